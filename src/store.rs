//! Durable reading buffer backed by SQLite.
//!
//! The store is an append-only log of readings with a per-row delivery flag.
//! It runs SQLite in WAL mode with `synchronous=NORMAL`, which lets the
//! publisher read while the collector writes and keeps fsync traffic low on
//! SD/flash media. The trade-off is that a power cut can lose at most the last
//! committed write cycle.
//!
//! Two connections are held: a writer (append, mark, delete) and a reader
//! (fetch, counts). Each sits behind its own mutex so that a drain never waits
//! on the writer mutex, only on SQLite's own WAL locking.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::reading::{DeliveryState, NewReading, Reading, ReadingId};

/// Default time SQLite waits on a locked database before giving up.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of attempts made to open the database.
const DEFAULT_OPEN_ATTEMPTS: u32 = 3;

/// Default pause between open attempts.
const DEFAULT_OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        captured_at TEXT NOT NULL,
        source_id TEXT NOT NULL,
        payload BLOB NOT NULL,
        sent INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_readings_sent ON readings (sent, id);
";

/// Errors raised by the reading store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened or locked within the configured bounds
    #[error("reading store unavailable: {0}")]
    Unavailable(String),

    /// Any other SQLite failure
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// The blocking task running a store call failed
    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Whether the failure is a lock/open problem that the next tick may not hit.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::CannotOpen) => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Tuning knobs for opening the store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a statement waits on SQLite's write lock
    pub busy_timeout: Duration,

    /// Attempts made to open the database before failing
    pub open_attempts: u32,

    /// Pause between open attempts
    pub open_retry_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            open_retry_delay: DEFAULT_OPEN_RETRY_DELAY,
        }
    }
}

struct Inner {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

/// Shared handle to the reading buffer.
///
/// Cloning is cheap; every clone talks to the same pair of connections. The
/// handle is opened once at startup and handed to every periodic task.
#[derive(Clone)]
pub struct ReadingStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReadingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl ReadingStore {
    /// Open (or create) the store at `path`.
    ///
    /// The parent directory is created if missing. Opening is retried up to
    /// `options.open_attempts` times.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the database cannot be opened
    /// after all attempts.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                StoreError::Unavailable(format!(
                    "cannot create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let attempts = options.open_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match Self::try_open(&path, &options) {
                Ok(store) => {
                    info!(
                        path = %path.display(),
                        attempt = attempt,
                        "Reading store opened in WAL mode"
                    );
                    return Ok(store);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        error = %e,
                        attempt = attempt,
                        max_attempts = attempts,
                        "Failed to open reading store, retrying"
                    );
                    std::thread::sleep(options.open_retry_delay);
                }
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "cannot open {} after {} attempts: {}",
                        path.display(),
                        attempt,
                        e
                    )));
                }
            }
        }
    }

    /// Open the store with default options.
    pub fn open_default(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(path, StoreOptions::default())
    }

    fn try_open(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        let writer = Self::connect(path, options.busy_timeout)?;
        writer.execute_batch(SCHEMA)?;

        let reader = Self::connect(path, options.busy_timeout)?;

        Ok(Self {
            inner: Arc::new(Inner {
                path: path.to_path_buf(),
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
            }),
        })
    }

    fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(journal_mode = %mode, "SQLite refused WAL mode");
        }
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        Ok(conn)
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.inner
            .writer
            .lock()
            .map_err(|_| StoreError::Unavailable("writer connection lock poisoned".to_string()))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.inner
            .reader
            .lock()
            .map_err(|_| StoreError::Unavailable("reader connection lock poisoned".to_string()))
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Append readings atomically and return their ids in insertion order.
    ///
    /// Either every reading becomes visible or none does.
    pub fn append(&self, readings: &[NewReading]) -> Result<Vec<ReadingId>, StoreError> {
        if readings.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut ids = Vec::with_capacity(readings.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO readings (captured_at, source_id, payload) VALUES (?1, ?2, ?3)",
            )?;
            for reading in readings {
                let id = stmt.insert(params![
                    reading
                        .captured_at
                        .to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    reading.source_id,
                    reading.payload,
                ])?;
                ids.push(id);
            }
        }
        tx.commit()?;

        debug!(count = ids.len(), "Appended readings");
        Ok(ids)
    }

    /// Fetch up to `limit` unsent readings, oldest id first.
    pub fn fetch_unsent(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, captured_at, source_id, payload, sent
             FROM readings
             WHERE sent = 0
             ORDER BY id ASC
             LIMIT ?1",
        )?;

        let readings = stmt
            .query_map(params![limit], row_to_reading)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    /// Mark the given ids as sent in one transaction.
    ///
    /// Already-sent or unknown ids are ignored. Returns how many rows actually
    /// transitioned from unsent to sent.
    pub fn mark_sent(&self, ids: &[ReadingId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut transitioned = 0;
        {
            let mut stmt =
                tx.prepare_cached("UPDATE readings SET sent = 1 WHERE id = ?1 AND sent = 0")?;
            for id in ids {
                transitioned += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;

        debug!(
            requested = ids.len(),
            transitioned = transitioned,
            "Marked readings as sent"
        );
        Ok(transitioned)
    }

    /// Delete up to `max_count` sent readings.
    ///
    /// Unsent rows are never touched. Each call is a single short write
    /// transaction, so callers bound lock hold time through `max_count`.
    pub fn delete_sent_batch(&self, max_count: usize) -> Result<usize, StoreError> {
        if max_count == 0 {
            return Ok(0);
        }

        let max_count = i64::try_from(max_count).unwrap_or(i64::MAX);
        let conn = self.writer()?;
        let deleted = conn.execute(
            "DELETE FROM readings
             WHERE id IN (
                 SELECT id FROM readings
                 WHERE sent = 1
                 ORDER BY id ASC
                 LIMIT ?1
             )",
            params![max_count],
        )?;

        Ok(deleted)
    }

    /// Number of readings still waiting for delivery.
    pub fn count_unsent(&self) -> Result<u64, StoreError> {
        self.count_where(DeliveryState::Unsent)
    }

    /// Number of delivered readings not yet pruned.
    pub fn count_sent(&self) -> Result<u64, StoreError> {
        self.count_where(DeliveryState::Sent)
    }

    fn count_where(&self, state: DeliveryState) -> Result<u64, StoreError> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM readings WHERE sent = ?1",
            params![state.as_flag()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Look up a single reading by id. Deleted readings return `None`.
    pub fn get(&self, id: ReadingId) -> Result<Option<Reading>, StoreError> {
        let conn = self.reader()?;
        let reading = conn
            .query_row(
                "SELECT id, captured_at, source_id, payload, sent FROM readings WHERE id = ?1",
                params![id],
                row_to_reading,
            )
            .optional()?;
        Ok(reading)
    }

    /// Journal mode reported by the writer connection.
    pub fn journal_mode(&self) -> Result<String, StoreError> {
        let conn = self.writer()?;
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode)
    }

    /// Run a store operation on the blocking thread pool.
    ///
    /// Periodic tasks use this so SQLite I/O never stalls the async runtime.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&ReadingStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn row_to_reading(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reading> {
    let captured_at: String = row.get(1)?;
    let captured_at = DateTime::parse_from_rfc3339(&captured_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(Reading {
        id: row.get(0)?,
        captured_at,
        source_id: row.get(2)?,
        payload: row.get(3)?,
        delivery_state: DeliveryState::from_flag(row.get(4)?),
    })
}
