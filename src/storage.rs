//! Two-tier blob storage.
//!
//! The cold tier is a set of plain files under the vault's hidden data
//! directory and is the source of truth: an operation succeeds iff its cold
//! write succeeded. The hot tier is an embedded rusqlite key/value cache
//! that is strictly advisory — every hot call may fail and the failure is
//! logged and swallowed.

use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct StorageProvider {
    cold_root: PathBuf,
    hot: Option<Mutex<Connection>>,
}

impl StorageProvider {
    /// Opens the provider. A hot-tier open failure downgrades to cold-only
    /// operation rather than failing construction.
    pub fn open(cold_root: &Path, hot_cache_dir: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(cold_root)?;
        write_gitignore_once(cold_root);

        let hot = match open_hot(hot_cache_dir) {
            Ok(conn) => Some(Mutex::new(conn)),
            Err(e) => {
                warn!("Hot cache unavailable, continuing cold-only: {e}");
                None
            }
        };

        Ok(Self {
            cold_root: cold_root.to_path_buf(),
            hot,
        })
    }

    fn store_dir(&self, store: &str) -> PathBuf {
        self.cold_root.join(store)
    }

    fn blob_path(&self, store: &str, key: &str) -> PathBuf {
        self.store_dir(store).join(key)
    }

    pub fn put(&self, store: &str, key: &str, bytes: &[u8]) -> EngineResult<()> {
        let dir = self.store_dir(store);
        std::fs::create_dir_all(&dir)?;
        let target = self.blob_path(store, key);
        write_atomic(&target, bytes)?;

        self.hot_try(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (store, key, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![store, key, bytes],
            )?;
            Ok(())
        });
        Ok(())
    }

    pub fn get(&self, store: &str, key: &str) -> EngineResult<Option<Vec<u8>>> {
        // Hot first; any hit must still be treated as advisory, so a miss or
        // error falls through to the cold file.
        if let Some(bytes) = self.hot_get(store, key) {
            return Ok(Some(bytes));
        }
        match std::fs::read(self.blob_path(store, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    /// Cold-tier-only read, for callers that must bypass a possibly stale
    /// hot entry.
    pub fn get_cold(&self, store: &str, key: &str) -> EngineResult<Option<Vec<u8>>> {
        match std::fs::read(self.blob_path(store, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    pub fn delete(&self, store: &str, key: &str) -> EngineResult<()> {
        let path = self.blob_path(store, key);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EngineError::Io(e)),
        }
        self.hot_try(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE store = ?1 AND key = ?2",
                rusqlite::params![store, key],
            )?;
            Ok(())
        });
        Ok(())
    }

    pub fn clear(&self, store: &str) -> EngineResult<()> {
        let dir = self.store_dir(store);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.hot_try(|conn| {
            conn.execute("DELETE FROM kv WHERE store = ?1", rusqlite::params![store])?;
            Ok(())
        });
        Ok(())
    }

    pub fn list_keys(&self, store: &str) -> EngineResult<Vec<String>> {
        let dir = self.store_dir(store);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                keys.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Removes the entire cold directory and every hot entry.
    pub fn purge(&self) -> EngineResult<()> {
        if self.cold_root.exists() {
            std::fs::remove_dir_all(&self.cold_root)?;
        }
        std::fs::create_dir_all(&self.cold_root)?;
        write_gitignore_once(&self.cold_root);
        self.hot_try(|conn| {
            conn.execute("DELETE FROM kv", [])?;
            Ok(())
        });
        Ok(())
    }

    /// Best-effort hot-tier write under a key that differs from any cold
    /// file name (the persistence manager keys its buffer cache this way).
    pub fn hot_put(&self, store: &str, key: &str, bytes: &[u8]) {
        self.hot_try(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (store, key, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![store, key, bytes],
            )?;
            Ok(())
        });
    }

    pub fn hot_delete(&self, store: &str, key: &str) {
        self.hot_try(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE store = ?1 AND key = ?2",
                rusqlite::params![store, key],
            )?;
            Ok(())
        });
    }

    pub fn hot_get(&self, store: &str, key: &str) -> Option<Vec<u8>> {
        let hot = self.hot.as_ref()?;
        let conn = hot.lock();
        match conn.query_row(
            "SELECT value FROM kv WHERE store = ?1 AND key = ?2",
            rusqlite::params![store, key],
            |row| row.get::<_, Vec<u8>>(0),
        ) {
            Ok(bytes) => Some(bytes),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                debug!("Hot cache read failed for {store}/{key}: {e}");
                None
            }
        }
    }

    fn hot_try(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<()>) {
        if let Some(hot) = &self.hot {
            let conn = hot.lock();
            if let Err(e) = f(&conn) {
                debug!("Hot cache write failed (ignored): {e}");
            }
        }
    }
}

fn open_hot(dir: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(dir)?;
    let conn = Connection::open(dir.join("hot-cache.db"))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            store TEXT NOT NULL,
            key   TEXT NOT NULL,
            value BLOB NOT NULL,
            PRIMARY KEY (store, key)
        );",
    )?;
    Ok(conn)
}

/// Write-temp-then-rename so a crash mid-write leaves the previous blob
/// intact.
fn write_atomic(target: &Path, bytes: &[u8]) -> EngineResult<()> {
    let tmp = target.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, target)?;
    Ok(())
}

fn write_gitignore_once(root: &Path) {
    let gitignore = root.join(".gitignore");
    if !gitignore.exists() {
        if let Err(e) = std::fs::write(&gitignore, "*\n") {
            warn!("Could not write {}: {e}", gitignore.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider() -> (TempDir, StorageProvider) {
        let dir = TempDir::new().unwrap();
        let provider =
            StorageProvider::open(&dir.path().join("cold"), &dir.path().join("hot")).unwrap();
        (dir, provider)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, p) = provider();
        p.put("vectors", "a.bin", b"hello").unwrap();
        assert_eq!(p.get("vectors", "a.bin").unwrap().unwrap(), b"hello");
    }

    #[test]
    fn get_missing_is_none() {
        let (_dir, p) = provider();
        assert!(p.get("vectors", "nope").unwrap().is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, p) = provider();
        p.put("vectors", "a.bin", b"x").unwrap();
        p.delete("vectors", "a.bin").unwrap();
        p.delete("vectors", "a.bin").unwrap();
        assert!(p.get("vectors", "a.bin").unwrap().is_none());
    }

    #[test]
    fn clear_removes_store() {
        let (_dir, p) = provider();
        p.put("vectors", "a.bin", b"x").unwrap();
        p.put("vectors", "b.bin", b"y").unwrap();
        p.clear("vectors").unwrap();
        assert!(p.list_keys("vectors").unwrap().is_empty());
    }

    #[test]
    fn gitignore_written_on_first_use() {
        let (dir, _p) = provider();
        assert!(dir.path().join("cold/.gitignore").exists());
    }

    #[test]
    fn cold_survives_hot_bypass() {
        let (_dir, p) = provider();
        p.put("vectors", "a.bin", b"cold-truth").unwrap();
        assert_eq!(p.get_cold("vectors", "a.bin").unwrap().unwrap(), b"cold-truth");
    }

    #[test]
    fn purge_wipes_everything() {
        let (dir, p) = provider();
        p.put("vectors", "a.bin", b"x").unwrap();
        p.purge().unwrap();
        assert!(p.get("vectors", "a.bin").unwrap().is_none());
        // Directory is recreated with its ignore marker.
        assert!(dir.path().join("cold/.gitignore").exists());
    }
}
