//! Relaying requests to upstream backends.
//!
//! The relay is byte-level: the raw request head is replayed to the
//! backend verbatim and the two streams are then piped into each other.
//! The backend closing its side is what ends an HTTP/1.0 response, so
//! that's what completes the relay.

use crate::action::empty_response;
use crate::prelude::{networking::*, *};
use rand::Rng;

macro_rules! ready {
    ($poll: expr) => {
        match $poll {
            Poll::Ready(v) => v,
            Poll::Pending => return Poll::Pending,
        }
    };
}
macro_rules! ret_ready_err {
    ($poll: expr, $map: expr) => {
        match $poll {
            Poll::Ready(Err(e)) => return Poll::Ready(Err($map(e))),
            Poll::Ready(r) => Poll::Ready(r),
            _ => Poll::Pending,
        }
    };
}

/// A buffer relaying bytes in one direction, keeping count of what it
/// has written.
#[derive(Debug)]
pub struct CopyBuffer {
    read_done: bool,
    pos: usize,
    cap: usize,
    written: u64,
    buf: Box<[u8]>,
}
impl CopyBuffer {
    /// Creates a new buffer with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            read_done: false,
            pos: 0,
            cap: 0,
            written: 0,
            buf: vec![0; 2048].into_boxed_slice(),
        }
    }
    /// The total number of bytes written to the writer so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Returns `Ok(true)` when the reader reached EOF and everything
    /// was written and flushed, `Ok(false)` when a full buffer was
    /// written out.
    ///
    /// # Errors
    ///
    /// Passes I/O errors from both sides on, without attribution.
    pub fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<bool>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            // If our buffer is empty, then we need to read some data to
            // continue.
            if self.pos == self.cap && !self.read_done {
                let me = &mut *self;
                let mut buf = ReadBuf::new(&mut me.buf);
                ready!(reader.as_mut().poll_read(cx, &mut buf))?;
                let n = buf.filled().len();
                if n == 0 {
                    self.read_done = true;
                } else {
                    self.pos = 0;
                    self.cap = n;
                }
            }

            // If our buffer has some data, let's write it out!
            while self.pos < self.cap {
                let i = ready!(writer
                    .as_mut()
                    .poll_write(cx, &self.buf[self.pos..self.cap]))?;
                if i == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write zero byte into writer",
                    )));
                }
                self.pos += i;
                self.written += i as u64;
                if self.pos >= self.cap {
                    return Poll::Ready(Ok(false));
                }
            }

            // If we've written all the data and we've seen EOF, flush out the
            // data and finish the transfer.
            if self.pos == self.cap && self.read_done {
                ready!(writer.as_mut().poll_flush(cx))?;
                return Poll::Ready(Ok(true));
            }
        }
    }
}
impl Default for CopyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The direction a relay failed in.
///
/// Both reading and writing errors of a direction land in that
/// direction's variant.
#[derive(Debug)]
pub enum RelayError {
    /// The client → backend direction failed.
    Request(io::Error),
    /// The backend → client direction failed.
    Response(io::Error),
}
impl RelayError {
    /// The underlying I/O error.
    #[must_use]
    pub fn get_io(&self) -> &io::Error {
        match self {
            Self::Request(err) | Self::Response(err) => err,
        }
    }
    /// The [`io::ErrorKind`] of the underlying error.
    #[must_use]
    pub fn get_io_kind(&self) -> io::ErrorKind {
        self.get_io().kind()
    }
    /// Unwraps to the underlying I/O error.
    #[must_use]
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Request(err) | Self::Response(err) => err,
        }
    }
}

/// A bidirectional byte relay between a client and a backend.
///
/// Completes when the backend closes its side, the response being over.
/// When the client stops sending (EOF on its read half), the backend's
/// write half is shut down so it sees the end of the request too.
#[derive(Debug)]
pub struct Relay<'a, C: AsyncRead + AsyncWrite + Unpin, B: AsyncRead + AsyncWrite + Unpin> {
    client: &'a mut C,
    backend: &'a mut B,
    up: CopyBuffer,
    down: CopyBuffer,
    request_done: bool,
    backend_shutdown: bool,
}
impl<'a, C: AsyncRead + AsyncWrite + Unpin, B: AsyncRead + AsyncWrite + Unpin> Relay<'a, C, B> {
    /// Creates a relay between `client` and `backend`.
    ///
    /// Nothing is read or written until it's polled.
    pub fn new(client: &'a mut C, backend: &'a mut B) -> Self {
        Self {
            client,
            backend,
            up: CopyBuffer::new(),
            down: CopyBuffer::new(),
            request_done: false,
            backend_shutdown: false,
        }
    }
    /// Bytes relayed from the backend to the client.
    #[must_use]
    pub fn response_bytes(&self) -> u64 {
        self.down.written()
    }
    /// Bytes relayed from the client to the backend.
    #[must_use]
    pub fn request_bytes(&self) -> u64 {
        self.up.written()
    }

    /// Polls both directions once. `Ok(true)` means the response is
    /// complete and the relay is over.
    ///
    /// # Errors
    ///
    /// See [`RelayError`].
    pub fn poll_relay(&mut self, cx: &mut Context<'_>) -> Poll<Result<bool, RelayError>> {
        if let Poll::Ready(Ok(response_done)) = ret_ready_err!(
            self.down
                .poll_copy(cx, Pin::new(&mut *self.backend), Pin::new(&mut *self.client)),
            RelayError::Response
        ) {
            return Poll::Ready(Ok(response_done));
        }
        if !self.request_done {
            if let Poll::Ready(Ok(request_done)) = ret_ready_err!(
                self.up
                    .poll_copy(cx, Pin::new(&mut *self.client), Pin::new(&mut *self.backend)),
                RelayError::Request
            ) {
                if request_done {
                    self.request_done = true;
                } else {
                    return Poll::Ready(Ok(false));
                }
            }
        }
        if self.request_done && !self.backend_shutdown {
            match Pin::new(&mut *self.backend).poll_shutdown(cx) {
                Poll::Pending => {}
                Poll::Ready(Ok(())) => {
                    self.backend_shutdown = true;
                    return Poll::Ready(Ok(false));
                }
                Poll::Ready(Err(err)) => {
                    return Poll::Ready(Err(RelayError::Request(err)));
                }
            }
        }
        Poll::Pending
    }
    /// Relays until the response is complete.
    ///
    /// # Errors
    ///
    /// See [`RelayError`].
    pub async fn channel(&mut self) -> Result<(), RelayError> {
        loop {
            if std::future::poll_fn(|cx| self.poll_relay(cx)).await? {
                return Ok(());
            }
        }
    }
}

/// A validated set of backends requests are forwarded to.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    backends: Vec<CompactString>,
    connect_timeout: Duration,
}
impl ReverseProxy {
    pub(crate) fn new(
        backends: Vec<CompactString>,
        connect_timeout: Duration,
    ) -> Result<Self, EntryError> {
        if backends.is_empty() {
            return Err(EntryError::NoBackends);
        }
        Ok(Self {
            backends,
            connect_timeout,
        })
    }

    /// Forwards the request in `head` to a backend and relays the
    /// response to `client`.
    ///
    /// Starts at a random backend and rotates through the rest while
    /// nothing has been exchanged yet. When every backend fails, the
    /// client gets an empty `502`, or `504` if the last failure was a
    /// connect timeout.
    ///
    /// # Errors
    ///
    /// Relay errors which aren't either peer hanging up.
    pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        client: &mut S,
        head: &RequestHead,
    ) -> io::Result<()> {
        let offset = if self.backends.len() > 1 {
            rand::rng().random_range(0..self.backends.len())
        } else {
            0
        };
        let mut last = GatewayError::Io(io::ErrorKind::NotConnected.into());
        for attempt in 0..self.backends.len() {
            let backend = &self.backends[(offset + attempt) % self.backends.len()];
            let mut upstream = match tokio::time::timeout(
                self.connect_timeout,
                TcpStream::connect(backend.as_str()),
            )
            .await
            {
                Err(_) => {
                    warn!("connection to {backend} timed out");
                    last = GatewayError::Timeout;
                    continue;
                }
                Ok(Err(err)) => {
                    warn!("connection to {backend} failed: {err}");
                    last = GatewayError::Io(err);
                    continue;
                }
                Ok(Ok(upstream)) => upstream,
            };
            if let Err(err) = upstream.write_all(head.raw()).await {
                warn!("sending request to {backend} failed: {err}");
                last = GatewayError::Io(err);
                continue;
            }

            let mut relay = Relay::new(client, &mut upstream);
            let result = relay.channel().await;
            let response_bytes = relay.response_bytes();
            let request_bytes = relay.request_bytes();
            drop(relay);
            match result {
                Ok(()) => return Ok(()),
                // nothing was exchanged beyond the head, so the next
                // backend gets an identical request
                Err(err) if response_bytes == 0 && request_bytes == 0 => {
                    warn!("backend {backend} failed before responding: {err:?}");
                    last = GatewayError::Io(err.into_io());
                }
                Err(err) if write::peer_gone(err.get_io()) => {
                    debug!("relay with {backend} closed early: {err:?}");
                    return Ok(());
                }
                Err(err) => return Err(err.into_io()),
            }
        }
        warn!(
            "all {} backend(s) failed, responding {}",
            self.backends.len(),
            last.status()
        );
        write::tolerant(client, &empty_response(last.status())).await
    }
}

/// Why a backend exchange failed.
#[derive(Debug)]
pub enum GatewayError {
    /// The backend could not be reached or broke the connection.
    Io(io::Error),
    /// Connecting to the backend timed out.
    Timeout,
}
impl GatewayError {
    /// The status code reported to the client.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Io(_) => StatusCode::BAD_GATEWAY.as_u16(),
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT.as_u16(),
        }
    }
}
impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_round_trip() {
        let (mut client_remote, mut client_local) = tokio::io::duplex(4096);
        let (mut upstream, mut backend_remote) = tokio::io::duplex(4096);

        let client = tokio::spawn(async move {
            client_remote.write_all(b"the request body").await.unwrap();
            client_remote.shutdown().await.unwrap();
            let mut response = Vec::new();
            client_remote.read_to_end(&mut response).await.unwrap();
            assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nbody");
        });
        let backend = tokio::spawn(async move {
            let mut request = Vec::new();
            // completes only if the relay half-closes on client EOF
            backend_remote.read_to_end(&mut request).await.unwrap();
            assert_eq!(request, b"the request body");
            backend_remote
                .write_all(b"HTTP/1.0 200 OK\r\n\r\nbody")
                .await
                .unwrap();
        });

        let mut relay = Relay::new(&mut client_local, &mut upstream);
        relay.channel().await.unwrap();
        assert_eq!(relay.request_bytes(), 16);
        assert_eq!(relay.response_bytes(), 23);
        drop(relay);
        drop(client_local);
        client.await.unwrap();
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn relay_counts_nothing_on_silent_backend() {
        let (client_remote, mut client_local) = tokio::io::duplex(4096);
        let (mut upstream, backend_remote) = tokio::io::duplex(4096);
        drop(backend_remote);

        let mut relay = Relay::new(&mut client_local, &mut upstream);
        // EOF without bytes is a complete, empty response
        relay.channel().await.unwrap();
        assert_eq!(relay.response_bytes(), 0);
        assert_eq!(relay.request_bytes(), 0);
        drop(client_remote);
    }

    #[test]
    fn no_backends_rejected() {
        assert!(matches!(
            ReverseProxy::new(vec![], Duration::from_secs(1)),
            Err(EntryError::NoBackends)
        ));
    }

    #[test]
    fn gateway_statuses() {
        assert_eq!(GatewayError::Timeout.status(), 504);
        assert_eq!(
            GatewayError::from(io::Error::from(io::ErrorKind::ConnectionRefused)).status(),
            502
        );
    }
}
