//! The management plane: a small JSON-over-HTTP control surface.
//!
//! Runs on its own [`Listener`], typically bound to loopback only.
//! The surface:
//!
//! | request | effect |
//! |---|---|
//! | `GET /hosts` | the whole table as JSON |
//! | `PUT /hosts/<host>` | insert or replace the entry from the body |
//! | `DELETE /hosts/<host>` | remove the entry |
//! | `GET /stats` | per-host connection counters |
//!
//! Mutations are saved to the state file, when one is configured.

use crate::prelude::{networking::*, *};

/// Largest accepted body of a management request.
pub const MAX_BODY_LENGTH: usize = 64 * 1024;

/// Creates the [`DelegatedHandler`] serving the management surface.
///
/// Mount it with [`Listener::delegated`]. `state` is the file mutations
/// are saved to; `None` disables persistence.
#[must_use]
pub fn handler(state: Option<PathBuf>) -> DelegatedHandler {
    let state = Arc::new(state);
    Arc::new(move |stream, peer, balancer| {
        let state = Arc::clone(&state);
        Box::pin(async move {
            if let Err(err) = handle(stream, &balancer, state.as_deref()).await {
                debug!("management request from {peer} failed: {err}");
            }
        })
    })
}

async fn handle(
    mut stream: TcpStream,
    balancer: &Arc<Balancer>,
    state: Option<&Path>,
) -> io::Result<()> {
    let options = balancer.options();
    let raw = read::head(&mut stream, options.max_head_length, options.head_timeout).await?;
    let head = RequestHead::parse(raw)?;

    let (status, body) = respond(&mut stream, balancer, &head, state).await?;
    let response = response_bytes(status, &body);
    write::tolerant(&mut stream, &response).await?;
    drop(stream.shutdown().await);
    Ok(())
}

/// Routes the request and returns the status and JSON body to send.
async fn respond(
    stream: &mut TcpStream,
    balancer: &Arc<Balancer>,
    head: &RequestHead,
    state: Option<&Path>,
) -> io::Result<(StatusCode, String)> {
    let path = head.path();
    let path = path.strip_prefix('/').unwrap_or(path);
    let (root, rest) = match path.split_once('/') {
        Some((root, rest)) => (root, Some(rest.trim_end_matches('/'))),
        None => (path.trim_end_matches('/'), None),
    };

    Ok(match (head.method(), root, rest) {
        (&Method::GET, "hosts", None | Some("")) => (
            StatusCode::OK,
            to_json(&balancer.hosts().snapshot()),
        ),
        (&Method::PUT, "hosts", Some(host)) if !host.is_empty() => {
            let entry = match body(stream, balancer, head).await? {
                Ok(entry) => entry,
                Err(message) => return Ok((StatusCode::BAD_REQUEST, error_body(&message))),
            };
            match balancer.hosts().insert(host, entry) {
                Ok(()) => {
                    info!("set host {host}");
                    save(balancer, state).await;
                    (StatusCode::OK, ok_body())
                }
                Err(err) => (StatusCode::BAD_REQUEST, error_body(err.as_str())),
            }
        }
        (&Method::DELETE, "hosts", Some(host)) if !host.is_empty() => {
            if balancer.hosts().remove(host).is_some() {
                info!("removed host {host}");
                save(balancer, state).await;
                (StatusCode::OK, ok_body())
            } else {
                (StatusCode::NOT_FOUND, error_body("no such host"))
            }
        }
        (&Method::GET, "stats", None | Some("")) => (
            StatusCode::OK,
            to_json(&balancer.stats().snapshot()),
        ),
        _ => (StatusCode::NOT_FOUND, error_body("no such endpoint")),
    })
}

/// Reads and parses the request body. The outer error is I/O, the inner
/// a message for the client.
async fn body(
    stream: &mut TcpStream,
    balancer: &Arc<Balancer>,
    head: &RequestHead,
) -> io::Result<Result<HostEntry, String>> {
    let length = match head
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<usize>().ok())
    {
        Some(length) if length <= MAX_BODY_LENGTH => length,
        Some(_) => return Ok(Err("body too large".into())),
        None => return Ok(Err("a content-length header is required".into())),
    };
    let body = read::body(
        stream,
        head.overflow(),
        length,
        balancer.options().head_timeout,
    )
    .await?;
    Ok(serde_json::from_slice(&body).map_err(|err| err.to_string()))
}

async fn save(balancer: &Arc<Balancer>, state: Option<&Path>) {
    if let Some(path) = state {
        if let Err(err) = balancer.hosts().save(path).await {
            error!("failed to save state to {}: {err}", path.display());
        }
    }
}

fn to_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|err| {
        error!("management response failed to serialize: {err}");
        error_body("serialization failed")
    })
}
fn ok_body() -> String {
    r#"{"ok": true}"#.into()
}
fn error_body(message: &str) -> String {
    format!(r#"{{"error": {}}}"#, serde_json::Value::from(message))
}

fn response_bytes(status: StatusCode, body: &str) -> Bytes {
    let status_line = format_compact!(
        "{} {}",
        status.as_str(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    let length = format_compact!("{}", body.len());
    build_bytes!(
        b"HTTP/1.0 ",
        status_line.as_bytes(),
        b"\r\nContent-Type: application/json\r\nContent-length: ",
        length.as_bytes(),
        b"\r\nConnection: close\r\n\r\n",
        body.as_bytes()
    )
}
