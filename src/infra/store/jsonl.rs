//! File-backed store using JSON lines for durability.
//!
//! Each table is an append-only `.jsonl` file under one directory. Every write
//! is appended before it becomes visible; on open the files are replayed and
//! the last row per id wins, so state survives restarts. `compact` rewrites the
//! task and event files down to their latest rows.
//!
//! One append handle per table stays open for the store's lifetime; each row
//! is flushed to the OS before the write returns.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::memory::InMemoryStore;
use super::{
    DurableStore, EventExecutionRecord, EventQuery, EventRecord, StoreError, TaskExecutionRecord,
    TaskRecord,
};
use crate::core::task::TaskStatus;
use crate::util::serde::{EventId, TaskId};

const TASKS: &str = "tasks";
const TASK_HISTORY: &str = "task_execution_history";
const EVENTS: &str = "events";
const EVENT_HISTORY: &str = "event_execution_history";

/// Durable store persisting each table as a JSON-lines file.
pub struct JsonlStore {
    dir: PathBuf,
    index: InMemoryStore,
    /// Open append handles keyed by table. The mutex also orders writes.
    writers: Mutex<HashMap<&'static str, BufWriter<File>>>,
}

impl JsonlStore {
    /// Open (or create) a store rooted at `dir` and replay existing files.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or a file holds a corrupt row.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir)?;
        let store = Self {
            dir,
            index: InMemoryStore::new(),
            writers: Mutex::new(HashMap::new()),
        };
        store.replay()?;
        tracing::info!(
            dir = %store.dir.display(),
            tasks = store.index.task_count(),
            events = store.index.event_count(),
            "jsonl store opened"
        );
        Ok(store)
    }

    /// Directory holding the table files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.jsonl"))
    }

    fn read_rows<R: DeserializeOwned>(&self, table: &str) -> Result<Vec<R>, StoreError> {
        let path = self.file_path(table);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line)?);
        }
        Ok(rows)
    }

    fn replay(&self) -> Result<(), StoreError> {
        for row in self.read_rows::<TaskRecord>(TASKS)? {
            self.index.save_task(&row)?;
        }
        for row in self.read_rows::<TaskExecutionRecord>(TASK_HISTORY)? {
            self.index.append_task_history(row)?;
        }
        for row in self.read_rows::<EventRecord>(EVENTS)? {
            self.index.save_event(&row)?;
        }
        for row in self.read_rows::<EventExecutionRecord>(EVENT_HISTORY)? {
            self.index.append_event_history(row)?;
        }
        Ok(())
    }

    fn append<R: Serialize>(
        &self,
        writers: &mut HashMap<&'static str, BufWriter<File>>,
        table: &'static str,
        row: &R,
    ) -> Result<(), StoreError> {
        let line = serde_json::to_string(row)?;
        let writer = match writers.entry(table) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.file_path(table))?;
                entry.insert(BufWriter::new(file))
            }
        };
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }

    fn rewrite<R: Serialize>(&self, table: &str, rows: &[R]) -> Result<(), StoreError> {
        let tmp = self.file_path(&format!("{table}.compact"));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            for row in rows {
                writeln!(file, "{}", serde_json::to_string(row)?)?;
            }
            file.sync_all()?;
        }
        std::fs::rename(tmp, self.file_path(table))?;
        Ok(())
    }

    /// Rewrite the task and event files with only their latest rows.
    ///
    /// # Errors
    ///
    /// Filesystem or encoding failure; the previous files stay intact.
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut writers = self.writers.lock();
        // handles to the replaced files must not be written again
        writers.remove(TASKS);
        self.rewrite(TASKS, &self.index.all_tasks())?;
        writers.remove(EVENTS);
        self.rewrite(EVENTS, &self.index.all_events())?;
        Ok(())
    }
}

impl DurableStore for JsonlStore {
    fn save_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut writers = self.writers.lock();
        self.append(&mut writers, TASKS, record)?;
        self.index.save_task(record)
    }

    fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.index.get_task(id)
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, StoreError> {
        self.index.list_tasks(status)
    }

    fn append_task_history(&self, record: TaskExecutionRecord) -> Result<u64, StoreError> {
        let mut writers = self.writers.lock();
        let id = self.index.append_task_history(record.clone())?;
        self.append(&mut writers, TASK_HISTORY, &TaskExecutionRecord { id, ..record })?;
        Ok(id)
    }

    fn task_history(&self, task_id: TaskId) -> Result<Vec<TaskExecutionRecord>, StoreError> {
        self.index.task_history(task_id)
    }

    fn save_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        let mut writers = self.writers.lock();
        self.append(&mut writers, EVENTS, record)?;
        self.index.save_event(record)
    }

    fn get_event(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        self.index.get_event(id)
    }

    fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError> {
        self.index.query_events(query)
    }

    fn append_event_history(&self, record: EventExecutionRecord) -> Result<u64, StoreError> {
        let mut writers = self.writers.lock();
        let id = self.index.append_event_history(record.clone())?;
        self.append(&mut writers, EVENT_HISTORY, &EventExecutionRecord { id, ..record })?;
        Ok(id)
    }

    fn event_history(&self, event_id: EventId) -> Result<Vec<EventExecutionRecord>, StoreError> {
        self.index.event_history(event_id)
    }
}
