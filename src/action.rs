//! The actions requests resolve to.
//!
//! [`Balancer::resolve_host`] turns the table entry a request matched
//! into an [`Action`], a per-request value which then handles the whole
//! exchange on the accepted stream. Streams are generic so actions can
//! be driven over [`duplex`](tokio::io::duplex) pairs in tests.

use crate::prelude::*;
use crate::proxy::ReverseProxy;

/// A hard-coded response for when an action can't do its job,
/// like a canned response file missing from disk.
pub const INTERNAL_FAILURE: &[u8] =
    b"HTTP/1.0 500 Internal Server Error\r\nConnection: close\r\nContent-length: 0\r\n\r\n";

/// Builds the bytes of a bodyless `HTTP/1.0` response with status `code`.
///
/// Codes without a canonical reason phrase get `Unknown`.
#[must_use]
pub fn empty_response(code: u16) -> Bytes {
    let reason = StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown");
    let code = format_compact!("{code}");
    build_bytes!(
        b"HTTP/1.0 ",
        code.as_bytes(),
        b" ",
        reason.as_bytes(),
        b"\r\nConnection: close\r\nContent-length: 0\r\n\r\n"
    )
}

/// What one request gets.
///
/// Bound to the [`Balancer`] it was resolved on, the table key it
/// matched, and the hostname the client asked for. Handles exactly one
/// request, then the caller closes the stream.
#[derive(Debug)]
pub struct Action {
    balancer: Arc<Balancer>,
    matched_host: CompactString,
    original_host: CompactString,
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Empty { code: u16 },
    Static { file: CompactString },
    Unknown,
    NoHosts,
    Redirect { to: CompactString },
    Proxy(ReverseProxy),
    Spin { timeout: Duration, check_interval: Duration },
}
impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Self::Empty { .. } => "empty",
            Self::Static { .. } => "static",
            Self::Unknown => "unknown",
            Self::NoHosts => "no-hosts",
            Self::Redirect { .. } => "redirect",
            Self::Proxy(_) => "proxy",
            Self::Spin { .. } => "spin",
        }
    }
}

impl Action {
    /// Builds the action `spec` describes.
    ///
    /// `matched_host` is the table key the request matched and
    /// `original_host` the hostname the client asked for; they differ
    /// when a wildcard matched.
    ///
    /// # Errors
    ///
    /// Rejects specs which fail [`ActionSpec::validate`].
    pub fn build(
        balancer: &Arc<Balancer>,
        matched_host: &str,
        original_host: &str,
        spec: &ActionSpec,
    ) -> Result<Self, EntryError> {
        spec.validate()?;
        let kind = match spec {
            ActionSpec::Empty { code } => Kind::Empty { code: *code },
            ActionSpec::Static { file } => Kind::Static { file: file.clone() },
            ActionSpec::Unknown => Kind::Unknown,
            ActionSpec::NoHosts => Kind::NoHosts,
            ActionSpec::Redirect { to } => Kind::Redirect { to: to.clone() },
            ActionSpec::Proxy { backends } => Kind::Proxy(ReverseProxy::new(
                backends.clone(),
                balancer.options().connect_timeout,
            )?),
            ActionSpec::Spin {
                timeout,
                check_interval,
            } => Kind::Spin {
                timeout: Duration::from_secs_f64(*timeout),
                check_interval: Duration::from_secs_f64(*check_interval),
            },
        };
        Ok(Self::with_kind(balancer, matched_host, original_host, kind))
    }
    pub(crate) fn empty(balancer: &Arc<Balancer>, host: &str, code: u16) -> Self {
        Self::with_kind(balancer, host, host, Kind::Empty { code })
    }
    pub(crate) fn unknown(balancer: &Arc<Balancer>, host: &str) -> Self {
        Self::with_kind(balancer, host, host, Kind::Unknown)
    }
    pub(crate) fn no_hosts(balancer: &Arc<Balancer>, host: &str) -> Self {
        Self::with_kind(balancer, host, host, Kind::NoHosts)
    }
    fn with_kind(balancer: &Arc<Balancer>, matched_host: &str, original_host: &str, kind: Kind) -> Self {
        Self {
            balancer: Arc::clone(balancer),
            matched_host: matched_host.to_compact_string(),
            original_host: original_host.to_compact_string(),
            kind,
        }
    }

    /// The table key the request matched. Equals
    /// [`Action::original_host`] unless a wildcard matched.
    #[must_use]
    pub fn matched_host(&self) -> &str {
        &self.matched_host
    }
    /// The hostname the client asked for.
    #[must_use]
    pub fn original_host(&self) -> &str {
        &self.original_host
    }
    /// The name of this action, as used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
    /// Whether this action waits for the host's entry to settle.
    #[must_use]
    pub fn is_spin(&self) -> bool {
        matches!(self.kind, Kind::Spin { .. })
    }

    /// Handles one request on `stream`.
    ///
    /// Writes the response, or relays bytes until the exchange is over.
    /// The caller closes the stream afterwards.
    ///
    /// # Errors
    ///
    /// I/O errors which aren't the client hanging up.
    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        head: &RequestHead,
    ) -> io::Result<()> {
        match &self.kind {
            Kind::Spin {
                timeout,
                check_interval,
            } => self.spin(stream, head, *timeout, *check_interval).await,
            _ => self.respond(stream, head).await,
        }
    }

    /// Handles every kind except [`Kind::Spin`].
    async fn respond<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        head: &RequestHead,
    ) -> io::Result<()> {
        match &self.kind {
            Kind::Empty { code } => write::tolerant(stream, &empty_response(*code)).await,
            Kind::Static { file } => self.canned(stream, file).await,
            Kind::Unknown => self.canned(stream, "unknown").await,
            Kind::NoHosts => self.canned(stream, "no-hosts").await,
            Kind::Redirect { to } => {
                let location = redirect_location(to, head);
                let response = build_bytes!(
                    b"HTTP/1.0 302 Found\r\nLocation: ",
                    location.as_bytes(),
                    b"\r\n\r\n"
                );
                write::tolerant(stream, &response).await
            }
            Kind::Proxy(proxy) => proxy.run(stream, head).await,
            // spin only delegates to settled actions
            Kind::Spin { .. } => Ok(()),
        }
    }

    /// Polls the table until the entry for the original host is
    /// something other than spin, then acts on that. The `timeout`
    /// response is the `timeout` canned file.
    async fn spin<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        head: &RequestHead,
        timeout: Duration,
        check_interval: Duration,
    ) -> io::Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(check_interval).await;
            if start.elapsed() >= timeout {
                debug!(
                    "{} spun for {:?} without settling",
                    self.original_host, timeout
                );
                return self.canned(stream, "timeout").await;
            }
            let current = self.balancer.resolve_host(&self.original_host);
            if !current.is_spin() {
                debug!("{} settled to {}", self.original_host, current.name());
                return current.respond(stream, head).await;
            }
        }
    }

    async fn canned<S: AsyncWrite + Unpin>(&self, stream: &mut S, name: &str) -> io::Result<()> {
        match read::canned(self.balancer.static_dir(), name).await {
            Some(response) => write::tolerant(stream, &response).await,
            None => {
                error!(
                    "canned response {name:?} is missing from {}",
                    self.balancer.static_dir().display()
                );
                write::tolerant(stream, INTERNAL_FAILURE).await
            }
        }
    }
}

fn redirect_location(to: &str, head: &RequestHead) -> CompactString {
    let path = head.path();
    if to.starts_with("http://") || to.starts_with("https://") {
        format_compact!("{to}{path}")
    } else {
        let scheme = if head.forwarded_protocol() == Some("SSL") {
            "https"
        } else {
            "http"
        };
        format_compact!("{scheme}://{to}{path}")
    }
}
