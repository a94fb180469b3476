//! ## **The shunt prelude**
//!
//! Re-exports the types and modules you touch most when embedding or
//! extending the balancer.
//!
//! This includes all of the imports the crate itself uses; glob-import it
//! and you are in the same namespace the internals are written in.

pub use bytes::{Bytes, BytesMut};
pub use compact_str::{format_compact, CompactString, ToCompactString};
pub use http;
pub use http::{header, header::HeaderName, HeaderMap, HeaderValue, Method, StatusCode, Version};
pub use log::{debug, error, info, trace, warn};
pub use std::cmp;
pub use std::collections::{BTreeMap, HashMap};
pub use std::fmt::{self, Debug, Display, Formatter};
pub use std::future::Future;
pub use std::io;
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
pub use std::path::{Path, PathBuf};
pub use std::pin::Pin;
pub use std::str;
pub use std::sync::Arc;
pub use std::task::{Context, Poll};
pub use std::time::Duration;
pub use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub use crate::action::{self, Action};
pub use crate::host::{self, ActionSpec, EntryError, HostEntry, HostTable};
pub use crate::management;
pub use crate::parse::{self, chars, RequestHead};
pub use crate::proxy;
pub use crate::read;
pub use crate::shutdown;
pub use crate::stats;
pub use crate::write;
pub use crate::{
    build_bytes, Balancer, BalancerOptions, DelegatedHandler, HandlerFuture, Listener,
};

/// **Prelude:** file system
pub mod fs {
    pub use tokio::fs::File;
}

/// **Prelude:** networking
pub mod networking {
    pub use tokio::net::{TcpListener, TcpStream};
}

/// **Prelude:** threading and synchronization
pub mod threading {
    pub use std::sync::atomic::{self, AtomicBool, AtomicIsize, AtomicUsize, Ordering};
    pub use tokio::task::{spawn, spawn_blocking};
}
