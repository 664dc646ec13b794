use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::RecordStore;
use crate::{
    config::StoreOptions,
    error::{StoreError, StoreResult},
    lease::Lease,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Connect,
    CreateSchema,
    SelectSchema,
    CreateTables,
    LoadAll,
    Insert,
    Update,
    Delete,
    Query,
}

impl StoreOp {
    fn name(self) -> &'static str {
        match self {
            StoreOp::Connect => "connect",
            StoreOp::CreateSchema => "create_schema",
            StoreOp::SelectSchema => "select_schema",
            StoreOp::CreateTables => "create_tables",
            StoreOp::LoadAll => "load_all",
            StoreOp::Insert => "insert",
            StoreOp::Update => "update",
            StoreOp::Delete => "delete",
            StoreOp::Query => "query",
        }
    }
}

/// One verb invocation, recorded whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Connect,
    CreateSchema,
    SelectSchema,
    CreateTables,
    LoadAll,
    Insert { path: String, session_id: String },
    Update { path: String, session_id: String },
    Delete { path: String, session_id: String },
    Query { path: String, session_id: String },
}

impl StoreCall {
    pub fn op(&self) -> StoreOp {
        match self {
            StoreCall::Connect => StoreOp::Connect,
            StoreCall::CreateSchema => StoreOp::CreateSchema,
            StoreCall::SelectSchema => StoreOp::SelectSchema,
            StoreCall::CreateTables => StoreOp::CreateTables,
            StoreCall::LoadAll => StoreOp::LoadAll,
            StoreCall::Insert { .. } => StoreOp::Insert,
            StoreCall::Update { .. } => StoreOp::Update,
            StoreCall::Delete { .. } => StoreOp::Delete,
            StoreCall::Query { .. } => StoreOp::Query,
        }
    }
}

/// Record store kept in process memory, with a call journal and scripted
/// failures. Rows are keyed by `(path, session_id)`, so several rows for
/// one path can coexist the way they can in a real table.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: DashMap<(String, String), Lease>,
    calls: Mutex<Vec<StoreCall>>,
    fail_next: Mutex<HashMap<StoreOp, usize>>,
    fail_always: Mutex<HashSet<StoreOp>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates rows without touching the call journal.
    pub fn with_rows(rows: impl IntoIterator<Item = Lease>) -> Self {
        let store = Self::new();
        for lease in rows {
            store
                .rows
                .insert((lease.path.clone(), lease.session_id.clone()), lease);
        }
        store
    }

    /// The next `times` calls of `op` fail.
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        *self.fail_next.lock().entry(op).or_insert(0) += times;
    }

    pub fn fail_always(&self, op: StoreOp, enabled: bool) {
        let mut ops = self.fail_always.lock();
        if enabled {
            ops.insert(op);
        } else {
            ops.remove(&op);
        }
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, op: StoreOp) -> usize {
        self.calls.lock().iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Current rows ordered by path, then create time.
    pub fn rows(&self) -> Vec<Lease> {
        let mut rows: Vec<Lease> = self.rows.iter().map(|e| e.value().clone()).collect();
        rows.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then(a.create_time_us.cmp(&b.create_time_us))
        });
        rows
    }

    pub fn rows_for(&self, path: &str) -> Vec<Lease> {
        self.rows().into_iter().filter(|l| l.path == path).collect()
    }

    fn record(&self, call: StoreCall) -> StoreResult<()> {
        let op = call.op();
        self.calls.lock().push(call);

        if self.fail_always.lock().contains(&op) {
            return Err(StoreError::Injected(op.name()));
        }
        let mut pending = self.fail_next.lock();
        if let Some(remaining) = pending.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Injected(op.name()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn connect(&self, _options: &StoreOptions) -> StoreResult<()> {
        self.record(StoreCall::Connect)
    }

    async fn create_schema(&self) -> StoreResult<()> {
        self.record(StoreCall::CreateSchema)
    }

    async fn select_schema(&self) -> StoreResult<()> {
        self.record(StoreCall::SelectSchema)
    }

    async fn create_tables(&self) -> StoreResult<()> {
        self.record(StoreCall::CreateTables)
    }

    async fn load_all(&self) -> StoreResult<Vec<Lease>> {
        self.record(StoreCall::LoadAll)?;
        Ok(self.rows.iter().map(|e| e.value().clone()).collect())
    }

    async fn insert(&self, lease: &Lease) -> StoreResult<()> {
        self.record(StoreCall::Insert {
            path: lease.path.clone(),
            session_id: lease.session_id.clone(),
        })?;

        let key = (lease.path.clone(), lease.session_id.clone());
        if self.rows.contains_key(&key) {
            return Err(StoreError::Query(format!(
                "duplicate row for {} / {}",
                lease.path, lease.session_id
            )));
        }
        self.rows.insert(key, lease.clone());
        Ok(())
    }

    async fn update(&self, lease: &Lease) -> StoreResult<()> {
        self.record(StoreCall::Update {
            path: lease.path.clone(),
            session_id: lease.session_id.clone(),
        })?;

        let key = (lease.path.clone(), lease.session_id.clone());
        if let Some(mut row) = self.rows.get_mut(&key) {
            row.status = lease.status;
            row.create_time_us = lease.create_time_us;
        }
        Ok(())
    }

    async fn delete(&self, path: &str, session_id: &str) -> StoreResult<()> {
        self.record(StoreCall::Delete {
            path: path.to_string(),
            session_id: session_id.to_string(),
        })?;
        self.rows.remove(&(path.to_string(), session_id.to_string()));
        Ok(())
    }

    async fn query(&self, path: &str, session_id: &str) -> StoreResult<Option<Lease>> {
        self.record(StoreCall::Query {
            path: path.to_string(),
            session_id: session_id.to_string(),
        })?;
        Ok(self
            .rows
            .get(&(path.to_string(), session_id.to_string()))
            .map(|e| e.value().clone()))
    }
}
