//! In-memory durable store for development, tests and as an index for
//! file-backed stores.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{
    DurableStore, EventExecutionRecord, EventQuery, EventRecord, StoreError, TaskExecutionRecord,
    TaskRecord,
};
use crate::core::task::TaskStatus;
use crate::util::serde::{EventId, TaskId};

#[derive(Default)]
struct Tables {
    seq: u64,
    tasks: HashMap<TaskId, (u64, TaskRecord)>,
    task_history: Vec<TaskExecutionRecord>,
    task_history_seq: u64,
    events: HashMap<EventId, (u64, EventRecord)>,
    event_history: Vec<EventExecutionRecord>,
    event_history_seq: u64,
}

impl Tables {
    const fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Map-backed store. Rows keep their first-insert order.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of task rows.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tables.read().tasks.len()
    }

    /// Number of event rows.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.tables.read().events.len()
    }

    pub(crate) fn all_tasks(&self) -> Vec<TaskRecord> {
        self.list_tasks(None).unwrap_or_default()
    }

    pub(crate) fn all_events(&self) -> Vec<EventRecord> {
        self.query_events(&EventQuery::all()).unwrap_or_default()
    }
}

impl DurableStore for InMemoryStore {
    fn save_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let seq = match tables.tasks.get(&record.id) {
            Some((seq, _)) => *seq,
            None => tables.next_seq(),
        };
        tables.tasks.insert(record.id, (seq, record.clone()));
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tables.read().tasks.get(&id).map(|(_, r)| r.clone()))
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, StoreError> {
        let tables = self.tables.read();
        let mut rows: Vec<&(u64, TaskRecord)> = tables
            .tasks
            .values()
            .filter(|(_, r)| status.is_none_or(|s| r.status == s))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, r)| r.clone()).collect())
    }

    fn append_task_history(&self, mut record: TaskExecutionRecord) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        if record.id == 0 {
            record.id = tables.task_history_seq + 1;
        }
        tables.task_history_seq = tables.task_history_seq.max(record.id);
        let id = record.id;
        tables.task_history.push(record);
        Ok(id)
    }

    fn task_history(&self, task_id: TaskId) -> Result<Vec<TaskExecutionRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .task_history
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }

    fn save_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let seq = match tables.events.get(&record.id) {
            Some((seq, _)) => *seq,
            None => tables.next_seq(),
        };
        tables.events.insert(record.id, (seq, record.clone()));
        Ok(())
    }

    fn get_event(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.tables.read().events.get(&id).map(|(_, r)| r.clone()))
    }

    fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError> {
        let tables = self.tables.read();
        let mut rows: Vec<&(u64, EventRecord)> = tables
            .events
            .values()
            .filter(|(_, r)| query.matches(r))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().take(limit).map(|(_, r)| r.clone()).collect())
    }

    fn append_event_history(&self, mut record: EventExecutionRecord) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        if record.id == 0 {
            record.id = tables.event_history_seq + 1;
        }
        tables.event_history_seq = tables.event_history_seq.max(record.id);
        let id = record.id;
        tables.event_history.push(record);
        Ok(id)
    }

    fn event_history(&self, event_id: EventId) -> Result<Vec<EventExecutionRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .event_history
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }
}
