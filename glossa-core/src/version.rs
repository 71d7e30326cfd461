//! Per-room version vectors: one strictly increasing counter per author.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Map of author id to the last version issued for that author in a room.
///
/// Counters start at 0 (nothing issued) and only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    versions: BTreeMap<Uuid, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last version issued for `author`, 0 if none.
    pub fn get(&self, author: &Uuid) -> u64 {
        self.versions.get(author).copied().unwrap_or(0)
    }

    /// Issue the next version for `author`.
    pub fn next(&mut self, author: Uuid) -> u64 {
        let entry = self.versions.entry(author).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Record a version observed from elsewhere, keeping the maximum.
    pub fn observe(&mut self, author: Uuid, version: u64) {
        let entry = self.versions.entry(author).or_insert(0);
        if version > *entry {
            *entry = version;
        }
    }

    /// Whether `version` from `author` is older than what we've issued.
    pub fn is_stale(&self, author: &Uuid, version: u64) -> bool {
        version < self.get(author)
    }

    /// Whether every counter in `other` is covered by this vector.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .versions
            .iter()
            .all(|(author, v)| self.get(author) >= *v)
    }

    pub fn authors(&self) -> impl Iterator<Item = &Uuid> {
        self.versions.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
