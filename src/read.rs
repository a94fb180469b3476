//! Reading request heads, bodies, and canned response files.
//!
//! All functions return [`Bytes`] so slices of the data can be passed
//! around without copying.

use crate::parse::{chars, Error};
use crate::prelude::*;

/// Reads from `reader` until a blank line terminates the request head.
///
/// Bytes past the blank line may also be returned; they are the start of
/// the body. Each read is bounded by `timeout` and the whole head by
/// `max_len`.
///
/// # Errors
///
/// [`Error::UnexpectedEnd`] if the stream closes, errors, or times out
/// before the head is complete, and [`Error::HeadTooLong`] when `max_len`
/// is reached.
pub async fn head(
    reader: &mut (impl AsyncRead + Unpin),
    max_len: usize,
    timeout: Duration,
) -> Result<Bytes, Error> {
    let mut buffer = BytesMut::with_capacity(512);
    loop {
        if buffer.len() >= max_len {
            return Err(Error::HeadTooLong);
        }
        if buffer.capacity() - buffer.len() < 128 {
            buffer.reserve(512);
        }
        let read_now = tokio::time::timeout(timeout, reader.read_buf(&mut buffer))
            .await
            .map_err(|_| Error::UnexpectedEnd)?
            .map_err(|_| Error::UnexpectedEnd)?;
        if read_now == 0 {
            return Err(Error::UnexpectedEnd);
        }
        if contains_two_newlines(&buffer) {
            break;
        }
    }
    Ok(buffer.freeze())
}

/// Reads a body of exactly `length` bytes, continuing from `prefix`.
///
/// `prefix` is the overflow of the head read, see
/// [`RequestHead::overflow`](crate::parse::RequestHead::overflow).
///
/// # Errors
///
/// [`Error::UnexpectedEnd`] if the stream closes, errors, or times out
/// before `length` bytes arrived.
pub async fn body(
    reader: &mut (impl AsyncRead + Unpin),
    prefix: Bytes,
    length: usize,
    timeout: Duration,
) -> Result<Bytes, Error> {
    let mut buffer = BytesMut::with_capacity(length);
    buffer.extend_from_slice(&prefix[..cmp::min(prefix.len(), length)]);
    while buffer.len() < length {
        let read_now = tokio::time::timeout(timeout, reader.read_buf(&mut buffer))
            .await
            .map_err(|_| Error::UnexpectedEnd)?
            .map_err(|_| Error::UnexpectedEnd)?;
        if read_now == 0 {
            return Err(Error::UnexpectedEnd);
        }
    }
    buffer.truncate(length);
    Ok(buffer.freeze())
}

/// Reads the canned response file for `name` from `dir`.
///
/// The file is the complete response, status line and all; it's sent to
/// clients verbatim. `None` if the file is missing or unreadable.
pub async fn canned(dir: impl AsRef<Path>, name: &str) -> Option<Bytes> {
    let mut path = dir.as_ref().to_path_buf();
    path.push(format_compact!("{name}.http").as_str());
    tokio::fs::read(path).await.ok().map(Bytes::from)
}

fn contains_two_newlines(bytes: &[u8]) -> bool {
    let mut in_row = 0_u8;
    for byte in bytes.iter().copied() {
        match byte {
            chars::LF if in_row == 1 => return true,
            chars::LF => in_row += 1,
            chars::CR => {}
            _ => in_row = 0,
        }
    }
    false
}
