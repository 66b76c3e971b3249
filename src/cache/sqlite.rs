//! SQLite cache implementation
//!
//! The connection lives on a dedicated worker thread. Callers send a request
//! message and block on the reply channel, so a `SqliteCache` can be shared
//! across threads while SQLite sees a single connection.

use super::{cascade_targets, key_pattern, CacheDump, CacheHeaders, NormalizedCache};
use crate::metrics;
use crate::{CacheError, Result};
use chrono::{DateTime, TimeZone, Utc};
use graphcache_records::{CacheKey, ChangedKeys, Record, RecordMerger};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

const NAME: &str = "sqlite";

/// Column name, declared type and primary key position
const COLUMNS: [(&str, &str, i64); 3] = [
    ("key", "TEXT", 1),
    ("record", "BLOB", 0),
    ("last_written_at", "INTEGER", 0),
];

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteCacheConfig {
    /// Path to SQLite database file
    pub path: PathBuf,

    /// Enable WAL mode for better concurrency
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
}

fn default_wal_mode() -> bool {
    true
}

impl Default for SqliteCacheConfig {
    fn default() -> Self {
        // Always use ~/.config for consistency across platforms (macOS, Linux)
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("graphcache");
        path.push("cache.db");

        Self {
            path,
            wal_mode: true,
        }
    }
}

impl SqliteCacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            wal_mode: true,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub record_count: usize,
    pub last_written_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
}

type Reply<T> = mpsc::Sender<Result<T>>;

enum Request {
    Load {
        keys: Vec<CacheKey>,
        evict: bool,
        reply: Reply<Vec<Record>>,
    },
    LoadAll {
        reply: Reply<Vec<Record>>,
    },
    Write {
        records: Vec<Record>,
        reply: Reply<()>,
    },
    Remove {
        keys: Vec<CacheKey>,
        reply: Reply<usize>,
    },
    RemoveMatching {
        pattern: glob::Pattern,
        reply: Reply<usize>,
    },
    Clear {
        reply: Reply<()>,
    },
    Stats {
        reply: Reply<(usize, Option<i64>)>,
    },
}

/// Persistent record store backed by a single SQLite table
pub struct SqliteCache {
    config: SqliteCacheConfig,
    requests: Option<mpsc::Sender<Request>>,
    worker: Option<JoinHandle<()>>,

    /// Serializes read-modify-write cycles
    writer: Mutex<()>,
}

impl SqliteCache {
    /// Open or create a cache database
    pub fn open(config: SqliteCacheConfig) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %config.path.display(), "Opening cache database");

        let conn = Connection::open(&config.path)?;
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        init_schema(&conn)?;

        let (requests, inbox) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("graphcache-sqlite".to_string())
            .spawn(move || Worker { conn }.run(inbox))?;

        Ok(Self {
            config,
            requests: Some(requests),
            worker: Some(worker),
            writer: Mutex::new(()),
        })
    }

    /// Get the database path
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get cache statistics
    pub fn stats(&self) -> Result<CacheStats> {
        let (record_count, last_written_at) = self.request(|reply| Request::Stats { reply })?;
        metrics::set_stored_records(NAME, record_count);
        Ok(CacheStats {
            record_count,
            last_written_at: last_written_at.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            path: self.config.path.clone(),
        })
    }

    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let stopped = || CacheError::Backend("sqlite worker has stopped".to_string());
        let (reply, response) = mpsc::channel();
        self.requests
            .as_ref()
            .ok_or_else(stopped)?
            .send(build(reply))
            .map_err(|_| stopped())?;
        response.recv().map_err(|_| stopped())?
    }

    fn load(&self, keys: Vec<CacheKey>, evict: bool) -> Result<Vec<Record>> {
        self.request(|reply| Request::Load { keys, evict, reply })
    }
}

impl Drop for SqliteCache {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(path = %self.config.path.display(), "SQLite worker panicked");
            }
        }
    }
}

impl NormalizedCache for SqliteCache {
    fn name(&self) -> &str {
        NAME
    }

    fn load_record(&self, key: &CacheKey, headers: &CacheHeaders) -> Result<Option<Record>> {
        Ok(self
            .load_records(std::slice::from_ref(key), headers)?
            .into_iter()
            .next())
    }

    fn load_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> Result<Vec<Record>> {
        let evict = headers.evict_after_read();
        let records = if evict {
            let _guard = self.writer.lock();
            self.load(keys.to_vec(), true)?
        } else {
            self.load(keys.to_vec(), false)?
        };

        for _ in 0..records.len() {
            if evict {
                metrics::record_evict(NAME);
            } else {
                metrics::record_hit(NAME);
            }
        }
        for _ in records.len()..keys.len() {
            metrics::record_miss(NAME);
        }
        Ok(records)
    }

    fn merge_all(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> Result<ChangedKeys> {
        if headers.do_not_store() || records.is_empty() {
            return Ok(ChangedKeys::new());
        }

        let _guard = self.writer.lock();
        let count = records.len();
        let keys: Vec<CacheKey> = records
            .iter()
            .map(|r| r.key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut current: BTreeMap<CacheKey, Record> = self
            .load(keys, false)?
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();

        let mut changed = ChangedKeys::new();
        let mut dirty = BTreeSet::new();
        for record in records {
            let existed = current.contains_key(&record.key);
            let (merged, keys) = merger.merge(current.get(&record.key), record);
            if !existed || !keys.is_empty() {
                dirty.insert(merged.key.clone());
            }
            changed.extend(keys);
            current.insert(merged.key.clone(), merged);
        }

        let writes: Vec<Record> = current
            .into_values()
            .filter(|record| dirty.contains(&record.key))
            .collect();
        if !writes.is_empty() {
            self.request(|reply| Request::Write {
                records: writes,
                reply,
            })?;
        }

        metrics::record_merge(NAME, count, changed.len());
        tracing::debug!(records = count, changed = changed.len(), "Merged records into SQLite");
        Ok(changed)
    }

    fn load_all(&self) -> Result<Vec<Record>> {
        self.request(|reply| Request::LoadAll { reply })
    }

    fn remove(&self, key: &CacheKey, cascade: bool) -> Result<bool> {
        let _guard = self.writer.lock();
        let targets = if cascade {
            cascade_targets(&self.load_all()?, key)
        } else {
            vec![key.clone()]
        };
        if targets.is_empty() {
            return Ok(false);
        }

        let removed = self.request(|reply| Request::Remove {
            keys: targets,
            reply,
        })?;
        tracing::debug!(key = %key, cascade, removed, "Removed records");
        Ok(removed > 0)
    }

    fn remove_keys(&self, keys: &[CacheKey]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let _guard = self.writer.lock();
        self.request(|reply| Request::Remove {
            keys: keys.to_vec(),
            reply,
        })
    }

    fn remove_matching(&self, pattern: &str) -> Result<usize> {
        let pattern = key_pattern(pattern)?;
        let _guard = self.writer.lock();
        self.request(|reply| Request::RemoveMatching { pattern, reply })
    }

    fn clear_all(&self) -> Result<()> {
        tracing::info!(path = %self.config.path.display(), "Clearing cache");
        let _guard = self.writer.lock();
        self.request(|reply| Request::Clear { reply })
    }

    fn dump(&self) -> Result<CacheDump> {
        let records = self.load_all()?;
        let snapshot: BTreeMap<CacheKey, Record> = records
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();
        Ok(CacheDump::from([(NAME.to_string(), snapshot)]))
    }
}

/// Create the records table, or check the shape of an existing one
///
/// A table from before `last_written_at` existed gets the column added.
fn init_schema(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("SELECT name, type, pk FROM pragma_table_info('records')")?;
    let columns = stmt
        .query_map([], |row| {
            Ok(Column {
                name: row.get(0)?,
                declared: row.get::<_, String>(1)?.to_ascii_uppercase(),
                pk: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    if columns.is_empty() {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                record BLOB NOT NULL,
                last_written_at INTEGER
            );
            "#,
        )?;
        return Ok(());
    }

    let expected: Vec<Column> = COLUMNS
        .iter()
        .map(|(name, declared, pk)| Column {
            name: name.to_string(),
            declared: declared.to_string(),
            pk: *pk,
        })
        .collect();

    // A table without last_written_at predates it and is upgraded in place
    if columns == expected {
        Ok(())
    } else if columns == expected[..2] {
        tracing::info!("Adding last_written_at column to records table");
        conn.execute_batch("ALTER TABLE records ADD COLUMN last_written_at INTEGER;")?;
        Ok(())
    } else {
        Err(CacheError::SchemaMismatch(format!(
            "records table is ({}), expected ({})",
            describe(&columns),
            describe(&expected)
        )))
    }
}

/// One row of `pragma_table_info`
#[derive(Debug, PartialEq, Eq)]
struct Column {
    name: String,
    declared: String,
    pk: i64,
}

fn describe(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|column| {
            let pk = if column.pk > 0 { " PRIMARY KEY" } else { "" };
            format!("{} {}{}", column.name, column.declared, pk)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

struct Worker {
    conn: Connection,
}

impl Worker {
    fn run(self, inbox: mpsc::Receiver<Request>) {
        tracing::debug!("SQLite worker started");

        // Send failures mean the caller gave up waiting; nothing to report to
        for request in inbox {
            match request {
                Request::Load { keys, evict, reply } => {
                    let _ = reply.send(self.load(&keys, evict));
                }
                Request::LoadAll { reply } => {
                    let _ = reply.send(self.load_all());
                }
                Request::Write { records, reply } => {
                    let _ = reply.send(self.write(&records));
                }
                Request::Remove { keys, reply } => {
                    let _ = reply.send(self.remove(&keys));
                }
                Request::RemoveMatching { pattern, reply } => {
                    let _ = reply.send(self.remove_matching(&pattern));
                }
                Request::Clear { reply } => {
                    let _ = reply.send(self.clear());
                }
                Request::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
            }
        }

        tracing::debug!("SQLite worker stopped");
    }

    fn load(&self, keys: &[CacheKey], evict: bool) -> Result<Vec<Record>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut records = Vec::with_capacity(keys.len());
        {
            let mut select = tx.prepare_cached("SELECT record FROM records WHERE key = ?1")?;
            for key in keys {
                let blob: Option<Vec<u8>> = select
                    .query_row([key.as_str()], |row| row.get(0))
                    .optional()?;
                if let Some(blob) = blob {
                    records.push(Record::from_blob(key.clone(), &blob)?);
                }
            }
        }

        if evict {
            for record in &records {
                tx.execute("DELETE FROM records WHERE key = ?1", [record.key.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(records)
    }

    fn load_all(&self) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare("SELECT key, record FROM records ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, blob) = row?;
            records.push(Record::from_blob(CacheKey::new(key), &blob)?);
        }
        Ok(records)
    }

    fn write(&self, records: &[Record]) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        // Start transaction
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut upsert = tx.prepare_cached(
                "INSERT OR REPLACE INTO records (key, record, last_written_at) VALUES (?1, ?2, ?3)",
            )?;
            for record in records {
                upsert.execute(params![record.key.as_str(), record.to_blob()?, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, keys: &[CacheKey]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0;
        for key in keys {
            removed += tx.execute("DELETE FROM records WHERE key = ?1", [key.as_str()])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn remove_matching(&self, pattern: &glob::Pattern) -> Result<usize> {
        let mut stmt = self.conn.prepare("SELECT key FROM records")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let matching: Vec<CacheKey> = keys
            .into_iter()
            .filter(|key| pattern.matches(key))
            .map(CacheKey::new)
            .collect();
        self.remove(&matching)
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM records", [])?;
        Ok(())
    }

    fn stats(&self) -> Result<(usize, Option<i64>)> {
        let (count, last): (i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), MAX(last_written_at) FROM records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count as usize, last))
    }
}
