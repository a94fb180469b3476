//! Per-host connection counters.
//!
//! Counters are keyed by the table key a request matched, so a wildcard
//! entry aggregates everything it caught. Unmatched requests count under
//! the hostname they asked for.

use crate::prelude::{threading::*, *};
use dashmap::DashMap;
use serde::Serialize;

/// Counters for all hosts.
#[derive(Debug, Default)]
pub struct Stats {
    hosts: DashMap<CompactString, Counters>,
}
impl Stats {
    /// An empty set of counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Records a connection for `host` starting to be handled.
    pub fn connection_opened(&self, host: &str) {
        self.counters(host).open.fetch_add(1, Ordering::Release);
    }
    /// Records a connection for `host` finishing.
    ///
    /// Must be paired with a previous [`Stats::connection_opened`].
    pub fn connection_completed(&self, host: &str) {
        let counters = self.counters(host);
        let open = counters.open.fetch_sub(1, Ordering::AcqRel);
        if open <= 0 {
            error!("connection count for {host} is below zero");
        }
        counters.completed.fetch_add(1, Ordering::Release);
    }
    /// A point-in-time copy of all counters, sorted by hostname.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<CompactString, Snapshot> {
        self.hosts
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    Snapshot {
                        open: entry.value().open.load(Ordering::Acquire),
                        completed: entry.value().completed.load(Ordering::Acquire),
                    },
                )
            })
            .collect()
    }
    fn counters(&self, host: &str) -> dashmap::mapref::one::Ref<'_, CompactString, Counters> {
        if let Some(counters) = self.hosts.get(host) {
            return counters;
        }
        self.hosts
            .entry(host.to_compact_string())
            .or_default()
            .downgrade()
    }
}

#[derive(Debug, Default)]
struct Counters {
    open: AtomicIsize,
    completed: AtomicUsize,
}

/// The counters of one host at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Connections currently being handled.
    pub open: isize,
    /// Connections handled to completion, including failed ones.
    pub completed: usize,
}
