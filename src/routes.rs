//! Versioned hostname → upstream route table
//!
//! The table holds an immutable [`RouteSnapshot`] behind an `Arc`. Readers clone
//! the pointer and always see a complete generation; the single writer builds a
//! new snapshot and swaps it in under a short write lock.

use crate::runtime::ContainerRecord;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RouteEntry {
    pub hostname: String,
    pub upstream: SocketAddr,
    /// Container that owns this hostname
    pub container_id: String,
    pub updated_at: DateTime<Utc>,
}

impl RouteEntry {
    /// Same routing target, ignoring timestamps
    pub fn same_target(&self, other: &RouteEntry) -> bool {
        self.upstream == other.upstream && self.container_id == other.container_id
    }
}

/// One committed generation of the route table
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteSnapshot {
    generation: u64,
    entries: BTreeMap<String, RouteEntry>,
}

impl RouteSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, hostname: &str) -> Option<&RouteEntry> {
        self.entries.get(hostname)
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.entries.contains_key(hostname)
    }

    /// Entries in hostname order
    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A commit built on a generation that is no longer current
#[derive(Debug, Error)]
#[error("stale route commit: based on generation {base}, table is at generation {current}")]
pub struct StaleCommit {
    pub base: u64,
    pub current: u64,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    current: RwLock<Arc<RouteSnapshot>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.current.read().contains(hostname)
    }

    /// Replace the table with `entries` as generation `base + 1`
    ///
    /// Fails without writing if another commit landed after `base` was read.
    pub fn commit(
        &self,
        base: u64,
        entries: BTreeMap<String, RouteEntry>,
    ) -> Result<Arc<RouteSnapshot>, StaleCommit> {
        let mut current = self.current.write();
        if current.generation != base {
            return Err(StaleCommit {
                base,
                current: current.generation,
            });
        }

        let snapshot = Arc::new(RouteSnapshot {
            generation: base + 1,
            entries,
        });
        *current = Arc::clone(&snapshot);
        debug!(generation = snapshot.generation, routes = snapshot.len(), "Route table committed");
        Ok(snapshot)
    }
}

/// Differences between the current table and a candidate entry set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteDiff {
    /// Hostnames new in the candidate
    pub added: Vec<String>,
    /// Hostnames whose upstream or owning container changed
    pub changed: Vec<String>,
    /// Hostnames no longer routed
    pub removed: Vec<String>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

pub fn diff(current: &RouteSnapshot, candidate: &BTreeMap<String, RouteEntry>) -> RouteDiff {
    let mut result = RouteDiff::default();

    for (hostname, entry) in candidate {
        match current.get(hostname) {
            None => result.added.push(hostname.clone()),
            Some(existing) if !existing.same_target(entry) => result.changed.push(hostname.clone()),
            Some(_) => {}
        }
    }

    result.removed = current
        .hostnames()
        .filter(|h| !candidate.contains_key(*h))
        .map(str::to_string)
        .collect();

    result
}

/// Build the candidate entry set from discovered containers
///
/// When several containers declare the same hostname the most recently created
/// one wins, with the larger container id breaking ties so the choice is stable
/// across passes. Entries whose target is unchanged keep their timestamp.
pub fn build_candidates(
    records: &[ContainerRecord],
    current: &RouteSnapshot,
    now: DateTime<Utc>,
) -> BTreeMap<String, RouteEntry> {
    let mut winners: BTreeMap<&str, &ContainerRecord> = BTreeMap::new();

    for record in records {
        match winners.entry(record.hostname.as_str()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                let held = *slot.get();
                let (winner, loser) = if (record.created, &record.id) > (held.created, &held.id) {
                    (record, held)
                } else {
                    (held, record)
                };
                warn!(
                    hostname = %record.hostname,
                    winner = %winner.name,
                    ignored = %loser.name,
                    "Multiple containers declare the same hostname, routing to the most recently created"
                );
                slot.insert(winner);
            }
        }
    }

    winners
        .into_iter()
        .map(|(hostname, record)| {
            let mut entry = RouteEntry {
                hostname: hostname.to_string(),
                upstream: record.upstream(),
                container_id: record.id.clone(),
                updated_at: now,
            };
            if let Some(existing) = current.get(hostname) {
                if existing.same_target(&entry) {
                    entry.updated_at = existing.updated_at;
                }
            }
            (hostname.to_string(), entry)
        })
        .collect()
}
