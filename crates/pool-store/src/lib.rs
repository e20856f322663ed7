//! Durable metadata store (§3, §6.4) and the claim-in-progress guard (§3, §4.5).

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use pool_persist::JsonStore;
use pool_proto::MetadataRow;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

// ─── Metadata store ─────────────────────────────────────────────────────────────

/// Durable map keyed by instance id. Rows are inserted only on successful
/// claim, and deleted on recycle, destroy, or dismiss. There is no status
/// column — pool state is always derived, never stored here.
pub struct MetadataStore {
    rows: Mutex<HashMap<String, MetadataRow>>,
    store: JsonStore,
}

impl MetadataStore {
    pub fn new(state_dir: &Path) -> Self {
        let store = JsonStore::new(state_dir, "instances");
        let rows = store.load();
        debug!(count = rows.len(), "loaded metadata rows from disk");
        Self {
            rows: Mutex::new(rows),
            store,
        }
    }

    /// Write (or overwrite) a metadata row. Called only as part of a
    /// successful claim, atomically with the cache transition to `claimed`.
    pub fn upsert(&self, row: MetadataRow) {
        let mut rows = self.rows.lock();
        rows.insert(row.instance_id.clone(), row);
        self.snapshot(&rows);
    }

    pub fn get(&self, instance_id: &str) -> Option<MetadataRow> {
        self.rows.lock().get(instance_id).cloned()
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.rows.lock().contains_key(instance_id)
    }

    /// Delete a row. Idempotent: deleting a missing row is not an error.
    pub fn delete(&self, instance_id: &str) {
        let mut rows = self.rows.lock();
        if rows.remove(instance_id).is_some() {
            self.snapshot(&rows);
        }
    }

    pub fn all(&self) -> Vec<MetadataRow> {
        self.rows.lock().values().cloned().collect()
    }

    pub fn index_by_service_id(&self) -> HashMap<String, MetadataRow> {
        self.rows
            .lock()
            .values()
            .map(|row| (row.provider_service_id.clone(), row.clone()))
            .collect()
    }

    fn snapshot(&self, rows: &HashMap<String, MetadataRow>) {
        if let Err(e) = self.store.save(rows) {
            warn!(error = %e, "failed to snapshot metadata store");
        }
    }
}

// ─── Claim-in-progress guard ────────────────────────────────────────────────────

/// The ephemeral, process-local set of service ids currently being mutated
/// by a claim. An id is inserted synchronously before any awaiting I/O and
/// removed on every exit path — panics included — via RAII.
///
/// The reconciler treats ids in this set as opaque: it skips them entirely
/// rather than attempting to re-derive their state (§4.3 step 5, §4.5).
#[derive(Clone, Default)]
pub struct ClaimGuard {
    inner: Arc<Mutex<HashSet<String>>>,
}

/// A held claim ticket. The service id is removed from the in-progress set
/// when this is dropped, regardless of how the claim attempt ends.
pub struct ClaimTicket {
    guard: ClaimGuard,
    service_id: String,
}

impl ClaimGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to mark `service_id` as claim-in-progress. Returns `None` if
    /// it is already marked — the synchronous insertion is the sole source
    /// of atomicity for the idle→claimed transition (§4.5, §9).
    pub fn try_acquire(&self, service_id: &str) -> Option<ClaimTicket> {
        let mut set = self.inner.lock();
        if set.contains(service_id) {
            return None;
        }
        set.insert(service_id.to_string());
        Some(ClaimTicket {
            guard: self.clone(),
            service_id: service_id.to_string(),
        })
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.inner.lock().contains(service_id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Drop for ClaimTicket {
    fn drop(&mut self) {
        let mut set = self.guard.inner.lock();
        let removed = set.remove(&self.service_id);
        debug_assert!(removed, "claim ticket dropped for an id not in the set — duplicate ticket?");
    }
}

impl ClaimTicket {
    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}
