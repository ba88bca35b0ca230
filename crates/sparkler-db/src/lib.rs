pub mod error;
pub mod migrations;
pub mod models;
pub mod queries;
pub mod txn;

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::broadcast;
use tracing::info;

use sparkler_types::models::{Message, ParticipantId, Room, RoomId, WaitingEntry};

pub use error::{Result, StoreError};
pub use txn::Transaction;

const READER_POOL_SIZE: usize = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);
const CHANGE_FEED_CAPACITY: usize = 1024;

/// A committed change, published after the write that caused it.
#[derive(Debug, Clone)]
pub enum Change {
    WaitingAdded(WaitingEntry),
    WaitingRemoved(ParticipantId),
    RoomCreated(Room),
    RoomEnded(RoomId),
    MessageAppended(Message),
}

/// Sparkler store: one writer connection, a pool of read-only connections,
/// and a broadcast feed of committed changes.
pub struct Database {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    reader_idx: AtomicUsize,
    changes: broadcast::Sender<Change>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let writer = Connection::open(path)?;

        // WAL mode for concurrent reads
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        writer.busy_timeout(BUSY_TIMEOUT)?;

        migrations::run(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            readers.push(Mutex::new(conn));
        }

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        info!(
            "Database opened at {} (1 writer + {} readers)",
            path.display(),
            READER_POOL_SIZE
        );
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            reader_idx: AtomicUsize::new(0),
            changes,
        })
    }

    /// Run `f` on a read-only connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|_| StoreError::LockPoisoned("reader"))?;
        f(&conn)
    }

    /// Run `f` on the single writer connection.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .writer
            .lock()
            .map_err(|_| StoreError::LockPoisoned("writer"))?;
        f(&conn)
    }

    /// Subscribe to committed changes. Only changes published after this call are seen.
    pub fn changes(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    pub(crate) fn publish(&self, change: Change) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}
