//! The host table: hostname to routing policy.
//!
//! The table is shared between every accept loop and the management
//! plane. Lookups clone the entry out, so a request keeps working with
//! the policy it resolved, even if the entry is replaced mid-flight.

use crate::prelude::*;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// What to do with requests for a host.
///
/// This is the wire format of the management plane and of state files;
/// see [`Action`](crate::action::Action) for the behaviour each variant
/// resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "kebab-case")]
pub enum ActionSpec {
    /// Respond with an empty response carrying this status code.
    Empty {
        /// The status code of the response.
        code: u16,
    },
    /// Respond with the canned response file named `file`.
    Static {
        /// Name of the file in the canned response directory,
        /// without the `.http` suffix.
        file: CompactString,
    },
    /// Respond with the `unknown` canned response.
    Unknown,
    /// Respond with the `no-hosts` canned response.
    NoHosts,
    /// Redirect to another authority, keeping the request path.
    Redirect {
        /// Where to send the client. Either a full `http://` or `https://`
        /// prefix, or a bare authority which inherits the request's scheme.
        to: CompactString,
    },
    /// Forward the request to one of `backends` and relay the response.
    Proxy {
        /// `host:port` backend addresses. Must not be empty.
        backends: Vec<CompactString>,
    },
    /// Wait for the entry to settle into something else, then act on that.
    Spin {
        /// Total time to wait, in seconds.
        timeout: f64,
        /// Poll period, in seconds.
        check_interval: f64,
    },
}
impl ActionSpec {
    /// Checks the parameters which can't be expressed in the types.
    ///
    /// # Errors
    ///
    /// See the [`EntryError`] variants.
    pub fn validate(&self) -> Result<(), EntryError> {
        match self {
            Self::Proxy { backends } if backends.is_empty() => Err(EntryError::NoBackends),
            Self::Spin {
                timeout,
                check_interval,
            } => {
                // the cap keeps `Duration::from_secs_f64` from panicking
                let ok = |seconds: f64| {
                    seconds.is_finite() && (0. ..=1_000_000_000.).contains(&seconds)
                };
                if ok(*timeout) && ok(*check_interval) && *check_interval > 0. {
                    Ok(())
                } else {
                    Err(EntryError::InvalidDuration)
                }
            }
            _ => Ok(()),
        }
    }
    /// The name of this action, as used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Empty { .. } => "empty",
            Self::Static { .. } => "static",
            Self::Unknown => "unknown",
            Self::NoHosts => "no-hosts",
            Self::Redirect { .. } => "redirect",
            Self::Proxy { .. } => "proxy",
            Self::Spin { .. } => "spin",
        }
    }
}

/// A single host's routing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEntry {
    /// What requests for this host resolve to.
    pub action: ActionSpec,
    /// Disabled entries resolve like missing ones.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}
impl HostEntry {
    /// An enabled entry with `action`.
    #[must_use]
    pub fn new(action: ActionSpec) -> Self {
        Self {
            action,
            enabled: true,
        }
    }
    /// Disables the entry.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn enabled_default() -> bool {
    true
}

/// Why an entry was rejected by [`HostTable::insert`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EntryError {
    /// A proxy must have at least one backend.
    NoBackends,
    /// Spin durations must be finite, non-negative seconds, with a
    /// check interval above zero.
    InvalidDuration,
    /// The hostname is empty.
    EmptyHost,
}
impl EntryError {
    /// Gets a string representation of the error.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoBackends => "a proxy action needs at least one backend",
            Self::InvalidDuration => "spin durations must be finite seconds, interval above zero",
            Self::EmptyHost => "the hostname is empty",
        }
    }
}
impl Display for EntryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl std::error::Error for EntryError {}

/// The shared hostname → [`HostEntry`] map.
///
/// Keys are normalized. A key starting with `*.` matches any
/// hostname ending in the part after the `*`; exact entries win over
/// wildcards, and closer wildcards win over more general ones.
#[derive(Debug, Default)]
pub struct HostTable {
    entries: DashMap<CompactString, HostEntry>,
}
impl HostTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Whether the table has no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// The number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Inserts `entry` under the normalized `host`, replacing any
    /// previous entry.
    ///
    /// # Errors
    ///
    /// Rejects invalid entries, see [`ActionSpec::validate`].
    pub fn insert(&self, host: impl AsRef<str>, entry: HostEntry) -> Result<(), EntryError> {
        let key = normalize_key(host.as_ref());
        if key.is_empty() || key == "*." {
            return Err(EntryError::EmptyHost);
        }
        entry.action.validate()?;
        self.entries.insert(key, entry);
        Ok(())
    }
    /// Removes the entry under the normalized `host`, returning it.
    pub fn remove(&self, host: impl AsRef<str>) -> Option<HostEntry> {
        self.entries
            .remove(normalize_key(host.as_ref()).as_str())
            .map(|(_, entry)| entry)
    }
    /// Looks `host` up, falling back through wildcard keys.
    ///
    /// Returns the key which matched along with a clone of the entry.
    /// `host` is expected to already be normalized, like the output of
    /// [`parse::normalize_host`].
    #[must_use]
    pub fn get(&self, host: &str) -> Option<(CompactString, HostEntry)> {
        if let Some(entry) = self.entries.get(host) {
            return Some((entry.key().clone(), entry.value().clone()));
        }
        // `a.b.example` also matches `*.b.example`, then `*.example`
        let mut rest = host;
        while let Some((_, parent)) = rest.split_once('.') {
            if parent.is_empty() {
                break;
            }
            let key = format_compact!("*.{parent}");
            if let Some(entry) = self.entries.get(key.as_str()) {
                return Some((entry.key().clone(), entry.value().clone()));
            }
            rest = parent;
        }
        None
    }
    /// A point-in-time copy of the whole table, sorted by hostname.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<CompactString, HostEntry> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Reads a table from the JSON state file at `path`.
    ///
    /// # Errors
    ///
    /// Passes I/O errors on; malformed JSON and invalid entries become
    /// [`io::ErrorKind::InvalidData`].
    pub async fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let entries: HashMap<CompactString, HostEntry> = serde_json::from_slice(&data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let table = Self::new();
        for (host, entry) in entries {
            table
                .insert(host, entry)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.as_str()))?;
        }
        Ok(table)
    }
    /// Writes the table as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Passes I/O errors on.
    pub async fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        tokio::fs::write(path, json).await
    }
}

fn normalize_key(host: &str) -> CompactString {
    if let Some(suffix) = host.strip_prefix("*.") {
        format_compact!("*.{}", parse::normalize_host(suffix))
    } else {
        parse::normalize_host(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty(code: u16) -> HostEntry {
        HostEntry::new(ActionSpec::Empty { code })
    }

    #[test]
    fn exact_beats_wildcard() {
        let table = HostTable::new();
        table.insert("example.com", empty(500)).unwrap();
        table.insert("*.example.com", empty(402)).unwrap();

        let (matched, entry) = table.get("example.com").unwrap();
        assert_eq!(matched, "example.com");
        assert_eq!(entry, empty(500));

        let (matched, entry) = table.get("a.example.com").unwrap();
        assert_eq!(matched, "*.example.com");
        assert_eq!(entry, empty(402));
    }

    #[test]
    fn wildcard_walks_up() {
        let table = HostTable::new();
        table.insert("*.com", empty(402)).unwrap();
        assert_eq!(table.get("a.b.example.com").unwrap().0, "*.com");
        assert!(table.get("example.net").is_none());
        assert!(table.get("com").is_none());
    }

    #[test]
    fn keys_are_normalized() {
        let table = HostTable::new();
        table.insert("Example.COM:8080", empty(500)).unwrap();
        table.insert("*.Example.ORG", empty(500)).unwrap();
        assert!(table.get("example.com").is_some());
        assert!(table.get("a.example.org").is_some());
        assert!(table.remove("EXAMPLE.com").is_some());
        assert!(table.get("example.com").is_none());
    }

    #[test]
    fn validation() {
        let table = HostTable::new();
        assert_eq!(
            table.insert(
                "a.example",
                HostEntry::new(ActionSpec::Proxy { backends: vec![] })
            ),
            Err(EntryError::NoBackends)
        );
        assert_eq!(
            table.insert(
                "a.example",
                HostEntry::new(ActionSpec::Spin {
                    timeout: 2.,
                    check_interval: 0.,
                })
            ),
            Err(EntryError::InvalidDuration)
        );
        assert_eq!(table.insert("", empty(500)), Err(EntryError::EmptyHost));
        assert!(table.is_empty());
    }

    #[test]
    fn wire_format() {
        let entry: HostEntry = serde_json::from_str(
            r#"{"action": {"kind": "redirect", "params": {"to": "https://example.com"}}}"#,
        )
        .unwrap();
        assert_eq!(
            entry.action,
            ActionSpec::Redirect {
                to: "https://example.com".into()
            }
        );
        assert!(entry.enabled);

        let entry: HostEntry = serde_json::from_str(
            r#"{"action": {"kind": "no-hosts"}, "enabled": false}"#,
        )
        .unwrap();
        assert_eq!(entry.action, ActionSpec::NoHosts);
        assert!(!entry.enabled);

        let round = serde_json::to_string(&HostEntry::new(ActionSpec::Spin {
            timeout: 2.,
            check_interval: 1.,
        }))
        .unwrap();
        assert_eq!(
            round,
            r#"{"action":{"kind":"spin","params":{"timeout":2.0,"check_interval":1.0}},"enabled":true}"#
        );
    }
}
