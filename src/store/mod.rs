//! Key/record indexes used by the schedule indexer.
//!
//! [`RecordStore`] is the only contract the rest of the crate sees. [`MemoryStore`]
//! keeps everything in a hash map; [`DiskStore`] keeps rows in an embedded SQLite
//! file inside the run's working directory, for feeds whose indexes do not fit
//! in memory. [`Backend`] picks one of the two at runtime.

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use anyhow::{Result, bail};
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// A write-once/read-many mapping from a string key to a single value.
///
/// The value may itself be a list (a trip's ordered stop times, the trips of a
/// route); stores treat it as one opaque value.
pub trait RecordStore<V>: Send + Sync {
    fn put(&self, key: &str, value: V) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<V>>;

    fn len(&self) -> Result<usize>;

    /// Writes many entries at once. Backends with per-write overhead override this.
    fn put_batch(&self, entries: Vec<(String, V)>) -> Result<()> {
        for (key, value) in entries {
            self.put(&key, value)?;
        }
        Ok(())
    }
}

pub type SharedStore<V> = Arc<dyn RecordStore<V>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    Memory,
    Disk,
}

impl Backend {
    /// Opens an empty store named `name`. Disk stores are created as
    /// `<dir>/<name>.sqlite`; `dir` must already exist.
    pub fn open<V>(&self, name: &str, dir: &Path) -> Result<SharedStore<V>>
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Ok(match self {
            Backend::Memory => Arc::new(MemoryStore::new()),
            Backend::Disk => Arc::new(DiskStore::open(&dir.join(format!("{name}.sqlite")))?),
        })
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Backend::Memory),
            "disk" | "sqlite" => Ok(Backend::Disk),
            other => bail!("unknown store backend '{other}' (expected 'memory' or 'disk')"),
        }
    }
}
