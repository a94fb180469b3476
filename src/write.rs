//! Writing responses to clients which may already have hung up.
//!
//! A peer closing the connection mid-response is routine for a balancer
//! and must not take the serving task down with it.

use crate::prelude::*;

/// Returns whether `err` means the peer closed the connection.
#[must_use]
pub fn peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Writes all of `data` to `writer`, then flushes.
///
/// Failures caused by the peer disconnecting are swallowed; the response
/// simply has nowhere to go anymore.
///
/// # Errors
///
/// All other I/O errors are passed on untouched.
pub async fn tolerant(
    writer: &mut (impl AsyncWrite + Unpin),
    data: &[u8],
) -> io::Result<()> {
    let result = async {
        writer.write_all(data).await?;
        writer.flush().await
    }
    .await;
    match result {
        Err(err) if peer_gone(&err) => {
            debug!("peer went away mid-response: {err}");
            Ok(())
        }
        other => other,
    }
}
