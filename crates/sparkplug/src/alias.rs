//! Persistent Sparkplug alias cache.
//!
//! Birth frames declare `(alias, name)` pairs; data frames may then carry the
//! alias alone. The cache maps `(group, edge, device, alias)` back to a
//! metric name, persists itself to a local JSON file so mappings survive
//! restart, and throttles rebirth requests for aliases it cannot resolve.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sync_core::Result;
use telemetry::metrics;
use tracing::{debug, warn};

/// Scope key for one alias map: device-scoped for DBIRTH, node-scoped
/// (device = None) for NBIRTH.
pub type AliasKey = (String, String, Option<String>);

/// One alias mapping captured from a birth frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub name: String,
    #[serde(default)]
    pub datatype: Option<String>,
}

/// Outcome of an alias lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasResolution {
    /// A birth frame previously declared this alias.
    Known(String),
    /// No mapping exists; the caller tags the metric with a placeholder.
    Missing,
}

/// In-memory alias registry with write-through file persistence.
///
/// Single-writer by contract: only the ingest task mutates the cache, so a
/// plain rwlock plus a snapshot mutex (serialising file writes) suffices.
pub struct AliasCache {
    path: PathBuf,
    maps: RwLock<HashMap<AliasKey, HashMap<u64, AliasEntry>>>,
    snapshot_lock: Mutex<()>,
}

impl AliasCache {
    /// Restore the cache from `path`, starting empty when the file is absent
    /// or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let maps = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, BTreeMap<String, AliasEntry>>>(
                &raw,
            ) {
                Ok(data) => deserialize_alias_maps(data),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "alias cache file invalid; starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            maps: RwLock::new(maps),
            snapshot_lock: Mutex::new(()),
        }
    }

    /// Resolve an alias: device-scoped map first, then node-scoped.
    pub fn resolve(
        &self,
        group: &str,
        edge: &str,
        device: Option<&str>,
        alias: u64,
    ) -> AliasResolution {
        let maps = self.maps.read();
        let lookups = [
            (group.to_string(), edge.to_string(), device.map(String::from)),
            (group.to_string(), edge.to_string(), None),
        ];
        for key in lookups {
            if let Some(entry) = maps.get(&key).and_then(|entries| entries.get(&alias)) {
                return AliasResolution::Known(entry.name.clone());
            }
        }
        AliasResolution::Missing
    }

    /// Record one `(alias, name)` pair from a birth frame, overwriting any
    /// prior mapping for that alias.
    pub fn populate(
        &self,
        group: &str,
        edge: &str,
        device: Option<&str>,
        alias: u64,
        entry: AliasEntry,
    ) {
        let key = (group.to_string(), edge.to_string(), device.map(String::from));
        self.maps.write().entry(key).or_default().insert(alias, entry);
    }

    /// Persist the current maps to disk atomically (temp file + rename).
    ///
    /// Snapshots are serialised so concurrent callers cannot interleave
    /// partial writes.
    pub fn snapshot(&self) -> Result<()> {
        let serialized = {
            let maps = self.maps.read();
            serde_json::to_string_pretty(&serialize_alias_maps(&maps))?
        };

        let _guard = self.snapshot_lock.lock();
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{serialized}\n"))?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "alias cache snapshot written");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of aliases tracked across all scopes.
    pub fn len(&self) -> usize {
        self.maps.read().values().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Convert the nested alias mapping into its JSON-file form: composite
/// `group|edge|device` keys with stringified alias ids, sorted for stable
/// diffs.
fn serialize_alias_maps(
    maps: &HashMap<AliasKey, HashMap<u64, AliasEntry>>,
) -> BTreeMap<String, BTreeMap<String, AliasEntry>> {
    let mut out = BTreeMap::new();
    for ((group, edge, device), entries) in maps {
        let composite = format!("{group}|{edge}|{}", device.as_deref().unwrap_or(""));
        let serialized: BTreeMap<String, AliasEntry> = entries
            .iter()
            .map(|(alias, entry)| (alias.to_string(), entry.clone()))
            .collect();
        out.insert(composite, serialized);
    }
    out
}

fn deserialize_alias_maps(
    data: BTreeMap<String, BTreeMap<String, AliasEntry>>,
) -> HashMap<AliasKey, HashMap<u64, AliasEntry>> {
    let mut out = HashMap::new();
    for (composite, entries) in data {
        let mut parts = composite.splitn(3, '|');
        let (Some(group), Some(edge), Some(device_token)) =
            (parts.next(), parts.next(), parts.next())
        else {
            warn!(key = %composite, "skipping malformed alias cache key");
            continue;
        };
        let device = if device_token.is_empty() {
            None
        } else {
            Some(device_token.to_string())
        };
        let parsed: HashMap<u64, AliasEntry> = entries
            .into_iter()
            .filter_map(|(alias, entry)| alias.parse::<u64>().ok().map(|id| (id, entry)))
            .collect();
        out.insert((group.to_string(), edge.to_string(), device), parsed);
    }
    out
}

/// Per-key throttle for rebirth requests.
///
/// At most one request per `(group, edge, device)` is issued per cooldown;
/// a birth frame for the key clears the throttle early.
pub struct RebirthThrottle {
    cooldown: Duration,
    last_request: Mutex<HashMap<AliasKey, Instant>>,
}

impl RebirthThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a rebirth request may be issued now; records the request time
    /// when it may.
    pub fn try_acquire(&self, group: &str, edge: &str, device: Option<&str>) -> bool {
        let key = (group.to_string(), edge.to_string(), device.map(String::from));
        let mut guard = self.last_request.lock();
        let now = Instant::now();
        match guard.get(&key) {
            Some(last) if now.duration_since(*last) < self.cooldown => false,
            _ => {
                guard.insert(key, now);
                metrics().rebirth_requests.inc();
                true
            }
        }
    }

    /// Clear the throttle for a key once its birth frame arrives.
    pub fn clear(&self, group: &str, edge: &str, device: Option<&str>) {
        let key = (group.to_string(), edge.to_string(), device.map(String::from));
        self.last_request.lock().remove(&key);
    }
}
