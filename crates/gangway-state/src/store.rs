//! StateStore: redb-backed state persistence for gangway.
//!
//! Provides typed CRUD operations over groups, requests, queues, events
//! and leases. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type StrTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        txn.open_table(QUEUES).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: StrTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: StrTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every value in `def`, optionally restricted to keys starting with `prefix`.
    fn scan_json<T: DeserializeOwned>(
        &self,
        def: StrTable,
        prefix: Option<&str>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if prefix.is_some_and(|p| !key.value().starts_with(p)) {
                continue;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn remove_key(&self, def: StrTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Insert or update a group.
    pub fn put_group(&self, group: &Group) -> StateResult<()> {
        self.put_json(GROUPS, &group.table_key(), group)?;
        debug!(group = %group.id(), phase = %group.phase, "group stored");
        Ok(())
    }

    pub fn get_group(&self, group_id: &str) -> StateResult<Option<Group>> {
        self.get_json(GROUPS, group_id)
    }

    pub fn list_groups(&self) -> StateResult<Vec<Group>> {
        self.scan_json(GROUPS, None)
    }

    /// Write a group and any number of its requests in one transaction.
    ///
    /// Readers see either the previous state of every row or the new
    /// state of every row.
    pub fn put_group_with_requests(&self, group: &Group, requests: &[Request]) -> StateResult<()> {
        let group_bytes = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
        let request_rows = requests
            .iter()
            .map(|r| {
                serde_json::to_vec(r)
                    .map(|bytes| (r.table_key(), bytes))
                    .map_err(map_err!(Serialize))
            })
            .collect::<StateResult<Vec<_>>>()?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            groups
                .insert(group.table_key().as_str(), group_bytes.as_slice())
                .map_err(map_err!(Write))?;

            let mut table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            for (key, bytes) in &request_rows {
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            group = %group.id(),
            phase = %group.phase,
            requests = requests.len(),
            "group and requests stored atomically"
        );
        Ok(())
    }

    /// Delete a group and all of its requests. Returns true if the group existed.
    pub fn delete_group(&self, group_id: &str) -> StateResult<bool> {
        let prefix = request_prefix(group_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let removed;
        {
            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            existed = groups.remove(group_id).map_err(map_err!(Write))?.is_some();

            let mut requests = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            let keys: Vec<String> = requests
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                requests.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed = keys.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %group_id, existed, requests_removed = removed, "group deleted");
        Ok(existed)
    }

    // ── Requests ───────────────────────────────────────────────────

    /// Insert or update a member request.
    pub fn put_request(&self, request: &Request) -> StateResult<()> {
        self.put_json(REQUESTS, &request.table_key(), request)
    }

    pub fn get_request(&self, group_id: &str, request_id: &str) -> StateResult<Option<Request>> {
        self.get_json(REQUESTS, &request_key(group_id, request_id))
    }

    /// All requests belonging to a group, in key order.
    pub fn list_requests_for_group(&self, group_id: &str) -> StateResult<Vec<Request>> {
        let prefix = request_prefix(group_id);
        self.scan_json(REQUESTS, Some(&prefix))
    }

    pub fn delete_request(&self, group_id: &str, request_id: &str) -> StateResult<bool> {
        self.remove_key(REQUESTS, &request_key(group_id, request_id))
    }

    // ── Queues ─────────────────────────────────────────────────────

    pub fn put_queue(&self, queue: &QueueSpec) -> StateResult<()> {
        self.put_json(QUEUES, &queue.name, queue)
    }

    pub fn get_queue(&self, name: &str) -> StateResult<Option<QueueSpec>> {
        self.get_json(QUEUES, name)
    }

    pub fn list_queues(&self) -> StateResult<Vec<QueueSpec>> {
        self.scan_json(QUEUES, None)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event and return its assigned sequence number.
    pub fn append_event(&self, event: &GangEvent) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            seq = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value() + 1)
                .unwrap_or(1);
            let mut stored = event.clone();
            stored.seq = seq;
            let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(seq, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// Events with a sequence greater than `after`, oldest first.
    pub fn list_events(&self, after: u64, limit: usize) -> StateResult<Vec<GangEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(after.saturating_add(1)..)
            .map_err(map_err!(Read))?
            .take(limit)
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// The most recent `limit` events for a group, oldest first.
    pub fn list_events_for_group(&self, group_id: &str, limit: usize) -> StateResult<Vec<GangEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: GangEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if event.group_id.as_deref() == Some(group_id) {
                results.push(event);
                if results.len() >= limit {
                    break;
                }
            }
        }
        results.reverse();
        Ok(results)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Grant or renew the lease on `queue` for `holder`.
    ///
    /// Succeeds when nobody holds it, the current lease has expired, or
    /// `holder` already owns it. The read and the write happen in one
    /// write transaction, so two contenders can't both win.
    pub fn try_acquire_lease(
        &self,
        queue: &str,
        holder: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> StateResult<Option<LeaseRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let granted;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current: Option<LeaseRecord> = match table.get(queue).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            let free = match &current {
                None => true,
                Some(lease) => lease.holder == holder || lease.expires_at_ms <= now_ms,
            };
            if !free {
                granted = None;
            } else {
                let lease = LeaseRecord {
                    queue: queue.to_string(),
                    holder: holder.to_string(),
                    expires_at_ms: now_ms.saturating_add(ttl_ms),
                };
                let bytes = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                table
                    .insert(queue, bytes.as_slice())
                    .map_err(map_err!(Write))?;
                granted = Some(lease);
            }
        }
        if granted.is_some() {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(granted)
    }

    pub fn get_lease(&self, queue: &str) -> StateResult<Option<LeaseRecord>> {
        self.get_json(LEASES, queue)
    }

    /// Drop the lease on `queue` if `holder` owns it. Returns true if released.
    pub fn release_lease(&self, queue: &str, holder: &str) -> StateResult<bool> {
        match self.get_lease(queue)? {
            Some(lease) if lease.holder == holder => self.remove_key(LEASES, queue),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_group(id: &str, queue: &str) -> Group {
        Group {
            spec: GroupSpec::new(id, queue, 2),
            members: Vec::new(),
            phase: GroupPhase::Pending,
            reason: None,
            schedule_timeout_secs: 300,
            retry_count: 0,
            conflict_count: 0,
            arrival_seq: 1,
            created_at_ms: 1000,
            last_transition_at_ms: 1000,
            deadline_at_ms: 301_000,
            not_before_ms: None,
        }
    }

    fn test_request(group_id: &str, id: &str) -> Request {
        Request::new(id, group_id, ResourceVector::new(1000, 1024, 1))
    }

    fn test_event(group_id: &str, kind: EventKind) -> GangEvent {
        GangEvent {
            seq: 0,
            at_ms: 1000,
            kind,
            queue: "default".to_string(),
            group_id: Some(group_id.to_string()),
            message: format!("{kind:?}"),
        }
    }

    // ── Group CRUD ─────────────────────────────────────────────────

    #[test]
    fn group_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let group = test_group("g1", "default");

        store.put_group(&group).unwrap();
        assert_eq!(store.get_group("g1").unwrap(), Some(group));
        assert!(store.get_group("nope").unwrap().is_none());
    }

    #[test]
    fn group_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut group = test_group("g1", "default");
        store.put_group(&group).unwrap();

        group.phase = GroupPhase::Queued;
        group.members.push("r1".to_string());
        store.put_group(&group).unwrap();

        let retrieved = store.get_group("g1").unwrap().unwrap();
        assert_eq!(retrieved.phase, GroupPhase::Queued);
        assert_eq!(retrieved.members, vec!["r1".to_string()]);
        assert_eq!(store.list_groups().unwrap().len(), 1);
    }

    #[test]
    fn group_delete_cascades_to_requests() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_group(&test_group("g1", "default")).unwrap();
        store.put_group(&test_group("g2", "default")).unwrap();
        store.put_request(&test_request("g1", "r1")).unwrap();
        store.put_request(&test_request("g1", "r2")).unwrap();
        store.put_request(&test_request("g2", "r1")).unwrap();

        assert!(store.delete_group("g1").unwrap());
        assert!(!store.delete_group("g1").unwrap());

        assert!(store.list_requests_for_group("g1").unwrap().is_empty());
        // g2 untouched
        assert_eq!(store.list_requests_for_group("g2").unwrap().len(), 1);
    }

    #[test]
    fn group_with_requests_written_together() {
        let store = StateStore::open_in_memory().unwrap();
        let mut group = test_group("g1", "default");
        group.phase = GroupPhase::Scheduled;

        let requests: Vec<Request> = (0..3)
            .map(|i| {
                let mut r = test_request("g1", &format!("r{i}"));
                r.binding = Some(Binding {
                    node_id: "n1".to_string(),
                    token_id: i,
                    bound_at_ms: 2000,
                });
                r
            })
            .collect();

        store.put_group_with_requests(&group, &requests).unwrap();

        assert_eq!(store.get_group("g1").unwrap().unwrap().phase, GroupPhase::Scheduled);
        let stored = store.list_requests_for_group("g1").unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(Request::is_bound));
    }

    // ── Request CRUD ───────────────────────────────────────────────

    #[test]
    fn request_prefix_does_not_leak_across_groups() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_request(&test_request("g1", "r1")).unwrap();
        store.put_request(&test_request("g10", "r1")).unwrap();

        assert_eq!(store.list_requests_for_group("g1").unwrap().len(), 1);
        assert_eq!(store.list_requests_for_group("g10").unwrap().len(), 1);
    }

    #[test]
    fn request_ids_with_colons_stay_in_their_group() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_request(&test_request("job:a", "r1")).unwrap();
        store.put_request(&test_request("job", "a:r1")).unwrap();
        store.put_request(&test_request("job", "x")).unwrap();

        let ids = |g: &str| -> Vec<(String, String)> {
            store
                .list_requests_for_group(g)
                .unwrap()
                .into_iter()
                .map(|r| (r.group_id, r.id))
                .collect()
        };
        assert_eq!(ids("job:a"), vec![("job:a".to_string(), "r1".to_string())]);
        assert_eq!(ids("job").len(), 2);
        assert!(ids("job").iter().all(|(g, _)| g == "job"));

        store.put_group(&test_group("job", "q")).unwrap();
        store.delete_group("job").unwrap();
        assert_eq!(ids("job:a").len(), 1);
        assert!(store.get_request("job:a", "r1").unwrap().is_some());
    }

    #[test]
    fn request_get_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let req = test_request("g1", "r1");
        store.put_request(&req).unwrap();

        assert_eq!(store.get_request("g1", "r1").unwrap(), Some(req));
        assert!(store.delete_request("g1", "r1").unwrap());
        assert!(!store.delete_request("g1", "r1").unwrap());
        assert!(store.get_request("g1", "r1").unwrap().is_none());
    }

    // ── Queues ─────────────────────────────────────────────────────

    #[test]
    fn queue_put_and_list() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_queue(&QueueSpec::new("training")).unwrap();
        store
            .put_queue(&QueueSpec {
                name: "batch".to_string(),
                weight: 2,
                capacity_share: 0.5,
            })
            .unwrap();

        assert_eq!(store.list_queues().unwrap().len(), 2);
        assert_eq!(store.get_queue("batch").unwrap().unwrap().weight, 2);
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn events_get_increasing_sequence() {
        let store = StateStore::open_in_memory().unwrap();
        let s1 = store.append_event(&test_event("g1", EventKind::GroupQueued)).unwrap();
        let s2 = store.append_event(&test_event("g2", EventKind::GroupQueued)).unwrap();
        let s3 = store.append_event(&test_event("g1", EventKind::GroupScheduled)).unwrap();
        assert_eq!((s1, s2, s3), (1, 2, 3));

        let all = store.list_events(0, 10).unwrap();
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        let after = store.list_events(1, 1).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].seq, 2);
    }

    #[test]
    fn events_for_group_are_chronological() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_event(&test_event("g1", EventKind::GroupQueued)).unwrap();
        store.append_event(&test_event("g2", EventKind::GroupQueued)).unwrap();
        store.append_event(&test_event("g1", EventKind::GroupTimedOut)).unwrap();
        store.append_event(&test_event("g1", EventKind::GroupRequeued)).unwrap();

        let g1 = store.list_events_for_group("g1", 2).unwrap();
        let kinds: Vec<_> = g1.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::GroupTimedOut, EventKind::GroupRequeued]);
    }

    // ── Leases ─────────────────────────────────────────────────────

    #[test]
    fn lease_is_exclusive_until_expiry() {
        let store = StateStore::open_in_memory().unwrap();

        let lease = store.try_acquire_lease("q", "a", 1000, 500).unwrap().unwrap();
        assert_eq!(lease.expires_at_ms, 1500);

        // Another replica is refused while the lease is live.
        assert!(store.try_acquire_lease("q", "b", 1200, 500).unwrap().is_none());

        // The holder can renew.
        let renewed = store.try_acquire_lease("q", "a", 1400, 500).unwrap().unwrap();
        assert_eq!(renewed.expires_at_ms, 1900);

        // After expiry the other replica takes over.
        let taken = store.try_acquire_lease("q", "b", 1900, 500).unwrap().unwrap();
        assert_eq!(taken.holder, "b");
    }

    #[test]
    fn lease_release_only_by_holder() {
        let store = StateStore::open_in_memory().unwrap();
        store.try_acquire_lease("q", "a", 0, 1000).unwrap();

        assert!(!store.release_lease("q", "b").unwrap());
        assert!(store.release_lease("q", "a").unwrap());
        assert!(store.get_lease("q").unwrap().is_none());
        assert!(store.try_acquire_lease("q", "b", 1, 1000).unwrap().is_some());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("gangway.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_group(&test_group("g1", "training")).unwrap();
            store.put_request(&test_request("g1", "r1")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let group = store.get_group("g1").unwrap().unwrap();
        assert_eq!(group.queue(), "training");
        assert_eq!(store.list_requests_for_group("g1").unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_groups().unwrap().is_empty());
        assert!(store.list_queues().unwrap().is_empty());
        assert!(store.list_requests_for_group("any").unwrap().is_empty());
        assert!(store.list_events(0, 10).unwrap().is_empty());
        assert!(!store.delete_group("nope").unwrap());
        assert!(!store.release_lease("nope", "a").unwrap());
    }
}
