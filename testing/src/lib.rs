//! Helpers for integration-testing shunt.
//!
//! Here, you can easily spin up a balancer on a random non-used port,
//! populated with hosts and canned responses, and send a request to it
//! in under 5 lines.

#![deny(clippy::all, clippy::perf, clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]

use shunt::prelude::*;
use tempfile::TempDir;

/// The canned responses every test server starts with, bundled from the
/// repository's `static` directory.
const BUNDLED_ASSETS: &[(&str, &[u8])] = &[
    ("unknown", include_bytes!("../../static/unknown.http")),
    ("no-hosts", include_bytes!("../../static/no-hosts.http")),
    ("timeout", include_bytes!("../../static/timeout.http")),
];

macro_rules! impl_methods {
    ($($method: ident $name: ident),*) => {
        $(
            /// Make a request to `path` with the selected method.
            pub fn $method(&self, path: impl AsRef<str>) -> reqwest::RequestBuilder {
                let client = self.client().build().unwrap();
                client.request(reqwest::Method::$name, self.url(path))
            }
        )*
    };
}

/// A running balancer returned by [`ServerBuilder::run`] to connect to.
#[derive(Debug)]
pub struct Server {
    server: Arc<shutdown::Manager>,
    balancer: Arc<Balancer>,
    port: u16,
    management_port: Option<u16>,
    static_dir: TempDir,
}
impl Server {
    impl_methods!(get GET, post POST, put PUT, delete DELETE, head HEAD);

    /// Get a [`reqwest::ClientBuilder`] which doesn't follow redirects,
    /// since redirecting is one of the behaviours under test.
    #[allow(clippy::unused_self)]
    pub fn client(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder().redirect(reqwest::redirect::Policy::none())
    }
    /// Builds a URL to the balancing plane with `path`.
    pub fn url(&self, path: impl AsRef<str>) -> reqwest::Url {
        Self::build_url(self.port, path.as_ref())
    }
    /// Builds a URL to the management plane with `path`.
    pub fn management_url(&self, path: impl AsRef<str>) -> reqwest::Url {
        Self::build_url(
            self.management_port.expect("management plane is not enabled"),
            path.as_ref(),
        )
    }
    /// Make a request to the management plane with `method`.
    pub fn management(
        &self,
        method: reqwest::Method,
        path: impl AsRef<str>,
    ) -> reqwest::RequestBuilder {
        let client = self.client().build().unwrap();
        client.request(method, self.management_url(path))
    }
    fn build_url(port: u16, path: &str) -> reqwest::Url {
        let added_root = if path.starts_with('/') { "" } else { "/" };
        let string = format!("http://localhost:{port}{added_root}{path}");
        reqwest::Url::parse(&string).unwrap()
    }

    /// Sends `request` as raw bytes to the balancing plane and returns
    /// everything the balancer sends back.
    pub async fn raw_request(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = networking::TcpStream::connect(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.port,
        ))
        .await
        .unwrap();
        stream.write_all(request).await.unwrap();
        // half-close marks the end of the request like a 1.0 client does
        drop(stream.shutdown().await);
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    /// Gets the port of the balancing plane.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
    /// Gets the port of the management plane, if one is enabled.
    #[must_use]
    pub fn management_port(&self) -> Option<u16> {
        self.management_port
    }
    /// The balancer behind this server.
    ///
    /// Mutating its host table affects requests in flight.
    #[must_use]
    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }
    /// The directory canned responses are served from.
    #[must_use]
    pub fn static_path(&self) -> &Path {
        self.static_dir.path()
    }

    /// Gets a [`shutdown::Manager`] which is [`Send`].
    ///
    /// You can shut the balancer down from another task using this.
    #[must_use]
    pub fn get_shutdown_manager(&self) -> Arc<shutdown::Manager> {
        Arc::clone(&self.server)
    }
}
impl Drop for Server {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

/// A builder struct for starting a test [`Server`].
#[must_use = "run the server"]
#[derive(Debug)]
pub struct ServerBuilder {
    hosts: Vec<(CompactString, HostEntry)>,
    options: BalancerOptions,
    assets: Vec<(CompactString, Vec<u8>)>,
    management: bool,
    state: Option<PathBuf>,
}
impl ServerBuilder {
    /// Creates a new builder with an empty host table and no management
    /// plane. Use `Self::default()` for a default configuration.
    pub fn new(options: BalancerOptions) -> Self {
        let _ = env_logger::Builder::new()
            .parse_filters("debug")
            .is_test(true)
            .parse_default_env()
            .try_init();
        Self {
            hosts: Vec::new(),
            options,
            assets: Vec::new(),
            management: false,
            state: None,
        }
    }
    /// Routes `host` according to `entry` once the server is up.
    pub fn with_host(mut self, host: impl AsRef<str>, entry: HostEntry) -> Self {
        self.hosts.push((host.as_ref().to_compact_string(), entry));
        self
    }
    /// Writes `contents` as the canned response `name`.http,
    /// overriding any bundled asset with the same name.
    pub fn with_asset(mut self, name: impl AsRef<str>, contents: impl Into<Vec<u8>>) -> Self {
        self.assets
            .push((name.as_ref().to_compact_string(), contents.into()));
        self
    }
    /// Modifies the internal [`BalancerOptions`] with `mutation`.
    pub fn with_options(mut self, mutation: impl Fn(&mut BalancerOptions)) -> Self {
        mutation(&mut self.options);
        self
    }
    /// Binds a management plane on a second port.
    pub fn management(mut self) -> Self {
        self.management = true;
        self
    }
    /// Persists the host table to `path` on management writes.
    /// Implies [`Self::management`].
    pub fn with_state_file(mut self, path: impl AsRef<Path>) -> Self {
        self.state = Some(path.as_ref().to_path_buf());
        self.management = true;
        self
    }

    async fn test_port_availability(port: u16) -> io::Result<()> {
        match networking::TcpStream::connect(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        ))
        .await
        {
            Err(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => Ok(()),
                _ => panic!("spurious IO error while checking port availability: {e:?}"),
            },
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "something is listening on the port",
            )),
        }
    }
    async fn get_port() -> u16 {
        use rand::prelude::*;
        let mut rng = rand::rng();
        let port_range = rand::distr::Uniform::new(4096, 61440).unwrap();

        loop {
            let port = port_range.sample(&mut rng);

            if Self::test_port_availability(port).await.is_err() {
                continue;
            }
            return port;
        }
    }

    /// Starts a balancer with the current configuration.
    ///
    /// The returned [`Server`] can make requests to the server,
    /// streamlining the process of testing shunt.
    pub async fn run(self) -> Server {
        let Self {
            hosts,
            options,
            assets,
            management,
            state,
        } = self;

        let static_dir = tempfile::tempdir().unwrap();
        for (name, contents) in BUNDLED_ASSETS {
            tokio::fs::write(static_dir.path().join(format!("{name}.http")), contents)
                .await
                .unwrap();
        }
        for (name, contents) in assets {
            tokio::fs::write(static_dir.path().join(format!("{name}.http")), contents)
                .await
                .unwrap();
        }

        let table = HostTable::new();
        for (host, entry) in hosts {
            table
                .insert(&host, entry)
                .unwrap_or_else(|err| panic!("invalid entry for {host}: {err}"));
        }
        let balancer = Balancer::new(table, static_dir.path(), options);

        loop {
            let port = Self::get_port().await;
            let management_port = if management {
                Some(Self::get_port().await)
            } else {
                None
            };
            if management_port == Some(port) {
                continue;
            }

            let mut listeners = vec![Listener::balance(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
            ))];
            if let Some(management_port) = management_port {
                listeners.push(Listener::delegated(
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), management_port),
                    management::handler(state.clone()),
                ));
            }

            let server = match balancer.run(listeners).await {
                Ok(server) => server,
                // another process grabbed the port between the check and the bind
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
                Err(err) => panic!("failed to start the test server: {err}"),
            };
            info!("test server on port {port}");
            return Server {
                server,
                balancer,
                port,
                management_port,
                static_dir,
            };
        }
    }
}
impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new(BalancerOptions::default())
    }
}
impl From<BalancerOptions> for ServerBuilder {
    fn from(options: BalancerOptions) -> Self {
        Self::new(options)
    }
}

/// The testing prelude.
/// Also imports `shunt::prelude::*`.
pub mod prelude {
    pub use super::{Server, ServerBuilder};
    pub use reqwest;
    #[doc(hidden)]
    pub use shunt::prelude::*;
}
