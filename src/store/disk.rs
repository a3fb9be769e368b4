use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::RecordStore;

/// A [`RecordStore`] backed by a single-table SQLite file.
///
/// Values are stored as JSON blobs. The file is scratch data for one run, so
/// journaling and fsync are switched off; the working directory that holds it
/// is removed when the run ends.
pub struct DiskStore<V> {
    conn: Mutex<Connection>,
    path: PathBuf,
    _value: PhantomData<fn() -> V>,
}

impl<V> DiskStore<V> {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open index store {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = OFF;
             PRAGMA synchronous = OFF;
             CREATE TABLE IF NOT EXISTS records (
                 key   TEXT PRIMARY KEY NOT NULL,
                 value BLOB NOT NULL
             );",
        )
        .with_context(|| format!("failed to initialise index store {}", path.display()))?;

        debug!(path = %path.display(), "Opened on-disk index store");

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            _value: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<V> RecordStore<V> for DiskStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn put(&self, key: &str, value: V) -> Result<()> {
        let blob = serde_json::to_vec(&value)?;
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("disk store lock poisoned"))?;
        conn.execute(
            "INSERT OR REPLACE INTO records (key, value) VALUES (?1, ?2)",
            params![key, blob],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<V>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("disk store lock poisoned"))?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        blob.map(|b| serde_json::from_slice(&b))
            .transpose()
            .with_context(|| format!("corrupt value for key '{key}' in {}", self.path.display()))
    }

    fn len(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("disk store lock poisoned"))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn put_batch(&self, entries: Vec<(String, V)>) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("disk store lock poisoned"))?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO records (key, value) VALUES (?1, ?2)")?;
            for (key, value) in entries {
                stmt.execute(params![key, serde_json::to_vec(&value)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
