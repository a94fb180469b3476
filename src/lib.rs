//! A hostname-based HTTP load balancer.
//!
//! Shunt accepts plain `HTTP/1.0`-style connections, reads one request
//! head, looks the `host` header up in a shared table, and lets the
//! matching [`Action`] handle the rest of the exchange. One connection,
//! one request, then the connection is closed.
//!
//! The table is live: a management listener (see [`management`]) and any
//! embedder holding the [`Balancer`] can add, replace, and remove hosts
//! while traffic flows, and in-flight `spin` actions pick the changes up.
//!
//! # Getting started
//!
//! ```no_run
//! use shunt::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let hosts = HostTable::new();
//!     hosts
//!         .insert(
//!             "example.com",
//!             HostEntry::new(ActionSpec::Proxy {
//!                 backends: vec!["127.0.0.1:8080".into()],
//!             }),
//!         )
//!         .unwrap();
//!     let balancer = Balancer::new(hosts, "static", BalancerOptions::default());
//!     let shutdown = balancer
//!         .run(vec![Listener::balance(([0, 0, 0, 0], 8000).into())])
//!         .await
//!         .unwrap();
//!     shutdown.wait().await;
//! }
//! ```

#![deny(
    unreachable_pub,
    missing_debug_implementations,
    missing_docs,
    clippy::pedantic
)]
#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines
)]

pub mod action;
pub mod host;
pub mod management;
pub mod parse;
pub mod prelude;
pub mod proxy;
pub mod read;
pub mod shutdown;
pub mod stats;
pub mod write;

use prelude::{networking::*, threading, *};

/// Convenience macro to create a [`Bytes`] from multiple `&[u8]` sources.
///
/// Works like the [`vec!`] macro, but takes byte slices and concatenates
/// them together, allocating only once.
///
/// # Examples
///
/// ```
/// # use shunt::prelude::*;
/// let built_bytes = build_bytes!(b"GET", b" ", b"/foo-", b"bar", b" HTTP/1.0");
/// assert_eq!(built_bytes, Bytes::from_static(b"GET /foo-bar HTTP/1.0"));
/// ```
#[macro_export]
macro_rules! build_bytes {
    () => (
        $crate::prelude::Bytes::new()
    );
    ($($bytes:expr),+ $(,)?) => {{
        let mut b = $crate::prelude::BytesMut::with_capacity($($bytes.len() +)* 0);

        $(b.extend($bytes.iter());)*

        b.freeze()
    }};
}

/// Default cap on the size of a request head, in bytes.
pub const MAX_HEAD_LENGTH: usize = 16 * 1024;

/// Tunables for how connections are handled.
#[derive(Debug, Clone)]
#[must_use]
pub struct BalancerOptions {
    /// Longest pause between reads while receiving a request head.
    pub head_timeout: Duration,
    /// Cap on the size of a request head, in bytes.
    pub max_head_length: usize,
    /// Bound on each connect attempt to a backend.
    pub connect_timeout: Duration,
}
impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            head_timeout: Duration::from_secs(10),
            max_head_length: MAX_HEAD_LENGTH,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// The balancer: the host table, its counters, and the tunables, shared
/// by every listener.
///
/// Everything mutable in here is interior; the balancer is handed
/// around as an [`Arc`] and never locked as a whole.
#[derive(Debug)]
#[must_use]
pub struct Balancer {
    hosts: HostTable,
    stats: stats::Stats,
    static_dir: PathBuf,
    options: BalancerOptions,
}
impl Balancer {
    /// Creates a balancer around `hosts`.
    ///
    /// `static_dir` is where canned response files (`unknown.http` and
    /// friends) are read from, per request and without caching, so
    /// edits take effect immediately.
    pub fn new(
        hosts: HostTable,
        static_dir: impl Into<PathBuf>,
        options: BalancerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts,
            stats: stats::Stats::new(),
            static_dir: static_dir.into(),
            options,
        })
    }
    /// The live host table.
    #[must_use]
    pub fn hosts(&self) -> &HostTable {
        &self.hosts
    }
    /// The per-host connection counters.
    #[must_use]
    pub fn stats(&self) -> &stats::Stats {
        &self.stats
    }
    /// The canned response directory.
    #[must_use]
    pub fn static_dir(&self) -> &Path {
        &self.static_dir
    }
    /// The tunables this balancer runs with.
    #[must_use]
    pub fn options(&self) -> &BalancerOptions {
        &self.options
    }

    /// Resolves `host` to the action which handles its requests.
    ///
    /// `host` is expected to be normalized, like
    /// [`parse::normalize_host`] and [`RequestHead::host`] return it.
    ///
    /// The policy:
    /// - an empty table resolves everything to `no-hosts`,
    /// - a missing entry resolves to `unknown`,
    /// - disabled entries resolve like missing ones,
    /// - an entry which fails validation resolves to an empty `500`.
    #[must_use]
    pub fn resolve_host(self: &Arc<Self>, host: &str) -> Action {
        if self.hosts.is_empty() {
            return Action::no_hosts(self, host);
        }
        match self.hosts.get(host) {
            Some((matched, entry)) if entry.enabled => {
                match Action::build(self, &matched, host, &entry.action) {
                    Ok(action) => action,
                    Err(err) => {
                        error!("the entry for {host} is invalid: {err}");
                        Action::empty(self, host, 500)
                    }
                }
            }
            _ => Action::unknown(self, host),
        }
    }

    /// Binds all of `listeners` and starts accepting connections.
    ///
    /// Returns the [`shutdown::Manager`] controlling the spawned accept
    /// loops.
    ///
    /// # Errors
    ///
    /// Errors if binding a listener fails. Nothing keeps running; the
    /// already bound listeners are dropped.
    pub async fn run(
        self: &Arc<Self>,
        listeners: Vec<Listener>,
    ) -> io::Result<Arc<shutdown::Manager>> {
        let manager = shutdown::Manager::new().build();
        let mut accept_loops = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let socket = TcpListener::bind(listener.addr).await?;
            info!("listening on {}", socket.local_addr()?);
            accept_loops.push((manager.add_listener(socket), listener.handler));
        }
        for (acceptor, handler) in accept_loops {
            threading::spawn(accept_loop(
                Arc::clone(self),
                Arc::clone(&manager),
                acceptor,
                handler,
            ));
        }
        Ok(manager)
    }
}

/// The future a [`DelegatedHandler`] returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// A handler taking over accepted connections on a [`Listener`].
///
/// Gets the stream, the peer address, and the balancer the listener
/// belongs to.
pub type DelegatedHandler =
    Arc<dyn Fn(TcpStream, SocketAddr, Arc<Balancer>) -> HandlerFuture + Send + Sync>;

/// One address to listen on, and what its connections get.
#[must_use]
pub struct Listener {
    addr: SocketAddr,
    handler: DelegatedHandler,
}
impl Listener {
    /// A data-plane listener: requests are resolved through the host
    /// table and handled by the matching [`Action`].
    pub fn balance(addr: SocketAddr) -> Self {
        Self {
            addr,
            handler: Arc::new(|stream, peer, balancer| {
                Box::pin(async move {
                    if let Err(err) = handle_connection(&balancer, stream, peer).await {
                        debug!("connection from {peer} failed: {err}");
                    }
                })
            }),
        }
    }
    /// A listener whose connections are handed to `handler` instead,
    /// like the management plane from [`management::handler`].
    pub fn delegated(addr: SocketAddr, handler: DelegatedHandler) -> Self {
        Self { addr, handler }
    }
    /// The address this listener binds.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
impl Debug for Listener {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.addr)
            .field("handler", &"[opaque]")
            .finish()
    }
}

async fn accept_loop(
    balancer: Arc<Balancer>,
    manager: Arc<shutdown::Manager>,
    mut acceptor: shutdown::Acceptor,
    handler: DelegatedHandler,
) {
    loop {
        match acceptor.accept().await {
            shutdown::AcceptAction::Shutdown => {
                debug!("accept loop stopping");
                break;
            }
            shutdown::AcceptAction::Accept(Err(err)) => {
                warn!("failed to accept connection: {err}");
            }
            shutdown::AcceptAction::Accept(Ok((stream, peer))) => {
                manager.add_connection();
                let future = handler(stream, peer, Arc::clone(&balancer));
                let manager = Arc::clone(&manager);
                threading::spawn(async move {
                    future.await;
                    manager.remove_connection();
                });
            }
        }
    }
}

/// Handles one data-plane connection: read the head, resolve the host,
/// let the action respond, close.
async fn handle_connection(
    balancer: &Arc<Balancer>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> io::Result<()> {
    let options = balancer.options();
    let raw = read::head(&mut stream, options.max_head_length, options.head_timeout).await?;
    let head = RequestHead::parse(raw)?;
    let action = balancer.resolve_host(head.host());
    debug!(
        "{} {} for {:?} from {peer} resolved to {}",
        head.method(),
        head.path(),
        head.host(),
        action.name()
    );

    balancer.stats().connection_opened(action.matched_host());
    let result = action.handle(&mut stream, &head).await;
    balancer.stats().connection_completed(action.matched_host());

    // the closing FIN is what ends an HTTP/1.0 response
    drop(stream.shutdown().await);
    result
}
