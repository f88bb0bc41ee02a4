use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::AgentId;

pub const DEFAULT_AUDIT_CAPACITY: usize = 256;

/// The latest complete write of one key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: Value,
    pub producer: AgentId,
    pub version: u64,
    pub written_at: DateTime<Utc>,
}

/// One line of the bounded write log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub key: String,
    pub producer: AgentId,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Anything that can answer "is this key available yet?".
pub trait KeyPresence {
    fn has_key(&self, key: &str) -> bool;
}

impl KeyPresence for HashSet<String> {
    fn has_key(&self, key: &str) -> bool {
        self.contains(key)
    }
}

/// Per-session key/value state shared by the agents of that session.
///
/// Versions come from a store-wide clock, so they strictly increase per key and
/// also give a total order over every write the session has seen.
#[derive(Debug)]
pub struct MemoryStore {
    entries: HashMap<String, MemoryEntry>,
    clock: u64,
    audit: VecDeque<AuditRecord>,
    audit_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_audit_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_audit_capacity(audit_capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            clock: 0,
            audit: VecDeque::with_capacity(audit_capacity.min(1024)),
            audit_capacity,
        }
    }

    /// Rebuild a store from an exported snapshot. The version clock resumes
    /// after the largest imported version.
    pub fn from_snapshot(snapshot: &MemorySnapshot, audit_capacity: usize) -> Self {
        let mut store = Self::with_audit_capacity(audit_capacity);
        for entry in snapshot.entries() {
            store.clock = store.clock.max(entry.version);
            store.entries.insert(entry.key.clone(), entry.clone());
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&MemoryEntry> {
        self.entries.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Overwrite `key` unconditionally. Returns the new version.
    pub fn set(&mut self, key: impl Into<String>, value: Value, producer: &AgentId) -> u64 {
        let key = key.into();
        self.clock += 1;
        let version = self.clock;
        let now = Utc::now();

        if self.audit_capacity > 0 {
            if self.audit.len() == self.audit_capacity {
                self.audit.pop_front();
            }
            self.audit.push_back(AuditRecord {
                key: key.clone(),
                producer: producer.clone(),
                version,
                timestamp: now,
            });
        }

        self.entries.insert(
            key.clone(),
            MemoryEntry {
                key,
                value,
                producer: producer.clone(),
                version,
                written_at: now,
            },
        );
        version
    }

    /// Keys sorted by write order.
    pub fn keys(&self) -> Vec<String> {
        let mut entries: Vec<&MemoryEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.version);
        entries.into_iter().map(|e| e.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest record first.
    pub fn audit_log(&self) -> impl Iterator<Item = &AuditRecord> {
        self.audit.iter()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            entries: Arc::new(self.entries.clone()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyPresence for MemoryStore {
    fn has_key(&self, key: &str) -> bool {
        self.has(key)
    }
}

/// Immutable point-in-time copy of a [`MemoryStore`]. Cheap to clone.
///
/// Also the export/import format for resuming a session elsewhere; the embedding
/// application decides where the JSON goes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemorySnapshot {
    entries: Arc<HashMap<String, MemoryEntry>>,
}

impl MemorySnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&MemoryEntry> {
        self.entries.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.values()
    }

    pub fn key_set(&self) -> HashSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl KeyPresence for MemorySnapshot {
    fn has_key(&self, key: &str) -> bool {
        self.has(key)
    }
}
