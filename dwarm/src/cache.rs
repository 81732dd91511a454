// Copyright 2024 dprewarm developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Cache snapshot sink.
//!
//! At the end of every run — successful, failed, or canceled — the worker's
//! accumulated per-set addresses are pushed into a [`CacheSink`] so readers
//! always see the freshest pre-warmed state. [`MemoryCache`] is the
//! in-process implementation the status surface reads from.

use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, Ipv6Addr},
    sync::RwLock,
};
use thiserror::Error;

/// Addresses discovered for one IP-set pair, both families.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAddrs {
    /// Sorted, deduplicated IPv4 addresses.
    pub v4: Vec<Ipv4Addr>,
    /// Sorted, deduplicated IPv6 addresses.
    pub v6: Vec<Ipv6Addr>,
}

/// Mapping from IP-set name to discovered addresses.
pub type CacheSnapshot = BTreeMap<String, SetAddrs>;

/// Failure while publishing a snapshot. Joined onto the run error but
/// never re-raised on its own.
#[derive(Debug, Error)]
#[error("cache sink: {0}")]
pub struct CacheError(pub String);

/// Consumer of per-run cache snapshots.
pub trait CacheSink: Send + Sync {
    /// Upsert the rows named in `snapshot`; rows for sets not named are
    /// left alone.
    fn replace(&self, snapshot: &CacheSnapshot) -> Result<(), CacheError>;

    /// Drop all rows.
    fn clear(&self) -> Result<(), CacheError>;
}

/// In-memory cache store.
#[derive(Default)]
pub struct MemoryCache {
    rows: RwLock<CacheSnapshot>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current rows, deep-copied.
    pub fn rows(&self) -> CacheSnapshot {
        self.rows.read().unwrap().clone()
    }
}

impl CacheSink for MemoryCache {
    fn replace(&self, snapshot: &CacheSnapshot) -> Result<(), CacheError> {
        let mut rows = self.rows.write().unwrap();
        for (set, addrs) in snapshot {
            rows.insert(set.clone(), addrs.clone());
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.rows.write().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_upserts_per_set() {
        let cache = MemoryCache::new();
        let mut first = CacheSnapshot::new();
        first.insert(
            "a-v4".into(),
            SetAddrs {
                v4: vec!["1.1.1.1".parse().unwrap()],
                v6: vec![],
            },
        );
        cache.replace(&first).unwrap();

        let mut second = CacheSnapshot::new();
        second.insert(
            "b-v4".into(),
            SetAddrs {
                v4: vec!["2.2.2.2".parse().unwrap()],
                v6: vec![],
            },
        );
        cache.replace(&second).unwrap();

        let rows = cache.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.contains_key("a-v4"));
    }

    #[test]
    fn clear_empties_rows() {
        let cache = MemoryCache::new();
        let mut snap = CacheSnapshot::new();
        snap.insert("a".into(), SetAddrs::default());
        cache.replace(&snap).unwrap();
        cache.clear().unwrap();
        assert!(cache.rows().is_empty());
    }
}
