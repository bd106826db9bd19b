use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::QueuedPayload;

/// Maximum number of payloads kept while offline. Older entries are evicted first.
pub const QUEUE_CAP: usize = 500;
pub const QUEUE_SLOT: &str = "offline_queue";

/// Opaque string-list persistence. Each slot is read and rewritten whole.
pub trait KeyValueStore: Send + Sync {
    fn get_list(&self, key: &str) -> Result<Option<Vec<String>>, StoreError>;
    fn set_list(&mut self, key: &str, values: &[String]) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("Initializing local store at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_lists (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves sqlite consistent, so a poisoned lock is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for SqliteStore {
    fn get_list(&self, key: &str) -> Result<Option<Vec<String>>, StoreError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM kv_lists WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set_list(&mut self, key: &str, values: &[String]) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(values)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO kv_lists (key, value) VALUES (?1, ?2)",
            params![key, encoded],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Bounded FIFO of payloads that have not been confirmed published.
///
/// Not safe for concurrent mutation: the controller is the only caller and
/// runs load/append/save as one uninterrupted step.
pub struct QueueStore {
    kv: Box<dyn KeyValueStore>,
    slot: String,
    cap: usize,
}

impl QueueStore {
    pub fn new(kv: Box<dyn KeyValueStore>) -> Self {
        Self::with_cap(kv, QUEUE_CAP)
    }

    pub fn with_cap(kv: Box<dyn KeyValueStore>, cap: usize) -> Self {
        QueueStore {
            kv,
            slot: QUEUE_SLOT.to_string(),
            cap,
        }
    }

    /// Reads the queue, dropping any record that does not parse. Storage
    /// failures read as an empty queue.
    pub fn load(&self) -> Vec<QueuedPayload> {
        let records = match self.kv.get_list(&self.slot) {
            Ok(Some(records)) => records,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(
                    error = %e,
                    slot = %self.slot,
                    "Failed to read offline queue, treating as empty"
                );
                return Vec::new();
            }
        };

        let total = records.len();
        let queue: Vec<QueuedPayload> = records
            .iter()
            .filter_map(|record| QueuedPayload::from_record(record).ok())
            .collect();

        if queue.len() < total {
            warn!(dropped = total - queue.len(), "Discarded unparseable queue entries");
        }
        queue
    }

    /// Replaces the stored queue with exactly `queue`.
    pub fn save(&mut self, queue: &[QueuedPayload]) -> Result<(), StoreError> {
        let records = queue
            .iter()
            .map(QueuedPayload::to_record)
            .collect::<Result<Vec<_>, _>>()?;
        self.kv.set_list(&self.slot, &records)?;
        debug!(len = records.len(), "Offline queue saved");
        Ok(())
    }

    /// Appends `payload`, evicting from the front past the cap, and returns
    /// the new length.
    pub fn enqueue(&mut self, payload: QueuedPayload) -> Result<usize, StoreError> {
        let mut queue = self.load();
        queue.push(payload);
        if queue.len() > self.cap {
            let overflow = queue.len() - self.cap;
            queue.drain(..overflow);
            warn!(evicted = overflow, cap = self.cap, "Offline queue full, dropped oldest entries");
        }
        self.save(&queue)?;
        Ok(queue.len())
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn raw_records(&self) -> Vec<String> {
        self.kv.get_list(&self.slot).ok().flatten().unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn write_raw(&mut self, records: &[String]) {
        self.kv.set_list(&self.slot, records).unwrap();
    }
}
