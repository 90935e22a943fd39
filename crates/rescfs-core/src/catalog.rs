//! Catalog queries needed by resource plugins.
//!
//! The catalog itself lives outside this crate; plugins see it only through the
//! [`Catalog`] trait. [`MockCatalog`] is an in-memory implementation for tests
//! and single-node setups.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ResourceError, ResourceResult};
use crate::hierarchy::HierarchyPath;

/// One row of the server load table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadEntry {
    /// Resource name.
    pub resource: String,
    /// Load factor; negative means unknown.
    pub load: i64,
    /// Unix time (seconds) the load was sampled.
    pub timestamp: u64,
}

/// An object that needs a replica created or refreshed under a replication resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRow {
    /// Catalog data id.
    pub data_id: u64,
    /// Logical path.
    pub logical_path: String,
    /// Hierarchy of a good replica to copy from.
    pub source_hierarchy: HierarchyPath,
    /// Physical path of that replica.
    pub source_path: String,
    /// Hierarchy of the stale replica to overwrite; `None` for a missing replica.
    pub stale_hierarchy: Option<HierarchyPath>,
    /// Size in bytes.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
}

/// Catalog queries used during resolve and rebalance.
pub trait Catalog: Send + Sync {
    /// The current load table.
    fn get_load_lists(&self) -> ResourceResult<Vec<LoadEntry>>;
    /// Number of distinct data objects stored below `resource`.
    fn get_distinct_object_count(&self, resource: &str) -> ResourceResult<u64>;
    /// Up to `limit` objects under `parent` that have no replica on `child`.
    fn gather_rebalance_batch(
        &self,
        parent: &str,
        child: &str,
        limit: usize,
    ) -> ResourceResult<Vec<RebalanceRow>>;
    /// Up to `limit` objects under `parent` whose replica on `child` is stale.
    fn gather_stale_batch(
        &self,
        parent: &str,
        child: &str,
        limit: usize,
    ) -> ResourceResult<Vec<RebalanceRow>>;
}

/// Call counters for [`MockCatalog`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockCatalogStats {
    /// Load table queries.
    pub load_queries: u64,
    /// Object count queries.
    pub count_queries: u64,
    /// Batch queries, missing and stale together.
    pub batch_queries: u64,
}

#[derive(Default)]
struct MockCatalogState {
    loads: Vec<LoadEntry>,
    counts: HashMap<String, u64>,
    missing: HashMap<(String, String), VecDeque<RebalanceRow>>,
    stale: HashMap<(String, String), VecDeque<RebalanceRow>>,
    failure: Option<String>,
    stats: MockCatalogStats,
}

/// In-memory catalog. Batch queries drain their queues, as a real catalog would
/// stop reporting rows once they are repaired.
#[derive(Default)]
pub struct MockCatalog {
    state: Mutex<MockCatalogState>,
}

impl MockCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a load sample.
    pub fn set_load(&self, resource: &str, load: i64, timestamp: u64) {
        let mut state = self.state.lock();
        state.loads.retain(|e| e.resource != resource);
        state.loads.push(LoadEntry {
            resource: resource.to_string(),
            load,
            timestamp,
        });
    }

    /// Sets the distinct object count for `resource`.
    pub fn set_object_count(&self, resource: &str, count: u64) {
        self.state.lock().counts.insert(resource.to_string(), count);
    }

    /// Queues an object missing from `child` under `parent`.
    pub fn push_missing(&self, parent: &str, child: &str, row: RebalanceRow) {
        self.state
            .lock()
            .missing
            .entry((parent.to_string(), child.to_string()))
            .or_default()
            .push_back(row);
    }

    /// Queues an object stale on `child` under `parent`.
    pub fn push_stale(&self, parent: &str, child: &str, row: RebalanceRow) {
        self.state
            .lock()
            .stale
            .entry((parent.to_string(), child.to_string()))
            .or_default()
            .push_back(row);
    }

    /// Makes every subsequent query fail with `msg`.
    pub fn fail_with(&self, msg: &str) {
        self.state.lock().failure = Some(msg.to_string());
    }

    /// Call counters.
    pub fn stats(&self) -> MockCatalogStats {
        self.state.lock().stats.clone()
    }

    fn check(state: &MockCatalogState) -> ResourceResult<()> {
        match &state.failure {
            Some(msg) => Err(ResourceError::Catalog { msg: msg.clone() }),
            None => Ok(()),
        }
    }

    fn drain(
        queues: &mut HashMap<(String, String), VecDeque<RebalanceRow>>,
        parent: &str,
        child: &str,
        limit: usize,
    ) -> Vec<RebalanceRow> {
        match queues.get_mut(&(parent.to_string(), child.to_string())) {
            Some(queue) => {
                let n = limit.min(queue.len());
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }
}

impl Catalog for MockCatalog {
    fn get_load_lists(&self) -> ResourceResult<Vec<LoadEntry>> {
        let mut state = self.state.lock();
        state.stats.load_queries += 1;
        Self::check(&state)?;
        Ok(state.loads.clone())
    }

    fn get_distinct_object_count(&self, resource: &str) -> ResourceResult<u64> {
        let mut state = self.state.lock();
        state.stats.count_queries += 1;
        Self::check(&state)?;
        Ok(state.counts.get(resource).copied().unwrap_or(0))
    }

    fn gather_rebalance_batch(
        &self,
        parent: &str,
        child: &str,
        limit: usize,
    ) -> ResourceResult<Vec<RebalanceRow>> {
        let mut state = self.state.lock();
        state.stats.batch_queries += 1;
        Self::check(&state)?;
        let rows = Self::drain(&mut state.missing, parent, child, limit);
        debug!(parent, child, limit, rows = rows.len(), "Mock rebalance batch");
        Ok(rows)
    }

    fn gather_stale_batch(
        &self,
        parent: &str,
        child: &str,
        limit: usize,
    ) -> ResourceResult<Vec<RebalanceRow>> {
        let mut state = self.state.lock();
        state.stats.batch_queries += 1;
        Self::check(&state)?;
        Ok(Self::drain(&mut state.stale, parent, child, limit))
    }
}
