//! Vault filesystem adapter.
//!
//! Everything above this layer speaks vault-relative `/`-separated paths.
//! The adapter owns containment: a path that escapes the vault root (or
//! reaches into the hidden data directory) is refused before any I/O.

use crate::error::{EngineError, EngineResult};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

/// Hidden per-vault data directory name; never indexed, never writable
/// through the adapter.
pub const DATA_DIR_NAME: &str = ".notegraph";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownEntry {
    pub path: String,
    pub mtime: u64,
    pub size: u64,
}

pub trait FsAdapter: Send + Sync {
    fn exists(&self, path: &str) -> bool;
    fn read(&self, path: &str) -> EngineResult<String>;
    /// Atomic: write-temp-then-rename.
    fn write(&self, path: &str, bytes: &[u8]) -> EngineResult<()>;
    fn remove(&self, path: &str) -> EngineResult<()>;
    fn mkdirs(&self, path: &str) -> EngineResult<()>;
    fn list_markdown(&self) -> EngineResult<Vec<MarkdownEntry>>;
    fn stat(&self, path: &str) -> EngineResult<Option<(u64, u64)>>;
}

/// Rejects traversal and reserved locations. Lexical, so a path is refused
/// before the filesystem is ever consulted.
pub fn validate_vault_path(path: &str) -> EngineResult<()> {
    if path.is_empty() {
        return Err(EngineError::InvalidInput("empty path".into()));
    }
    if path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return Err(EngineError::InvalidInput(format!(
            "path must be vault-relative: {path}"
        )));
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(EngineError::InvalidInput(format!(
                "path traversal refused: {path}"
            )));
        }
    }
    if path == DATA_DIR_NAME || path.starts_with(&format!("{DATA_DIR_NAME}/")) {
        return Err(EngineError::InvalidInput(format!(
            "reserved data directory: {path}"
        )));
    }
    Ok(())
}

pub struct VaultFs {
    root: PathBuf,
}

impl VaultFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> EngineResult<PathBuf> {
        validate_vault_path(path)?;
        let full = self.root.join(path);
        // Containment double-check for anything that exists on disk:
        // symlinks may point outside the vault even when the lexical form
        // is clean.
        if full.exists() {
            let canonical = dunce::canonicalize(&full)?;
            let root = dunce::canonicalize(&self.root)?;
            if !canonical.starts_with(&root) {
                return Err(EngineError::InvalidInput(format!(
                    "path escapes the vault: {path}"
                )));
            }
        }
        Ok(full)
    }
}

impl FsAdapter for VaultFs {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn read(&self, path: &str) -> EngineResult<String> {
        let full = self.resolve(path)?;
        Ok(std::fs::read_to_string(full)?)
    }

    fn write(&self, path: &str, bytes: &[u8]) -> EngineResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = full.with_extension("md.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &full)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> EngineResult<()> {
        let full = self.resolve(path)?;
        match std::fs::remove_file(full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    fn mkdirs(&self, path: &str) -> EngineResult<()> {
        let full = self.resolve(path)?;
        std::fs::create_dir_all(full)?;
        Ok(())
    }

    fn list_markdown(&self) -> EngineResult<Vec<MarkdownEntry>> {
        let mut entries = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .max_depth(Some(20))
            .build();
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let is_md = entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));
            if !is_md {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if validate_vault_path(&relative).is_err() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            entries.push(MarkdownEntry {
                path: relative,
                mtime: mtime_secs(&metadata),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn stat(&self, path: &str) -> EngineResult<Option<(u64, u64)>> {
        let full = self.resolve(path)?;
        match std::fs::metadata(full) {
            Ok(m) => Ok(Some((mtime_secs(&m), m.len()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}

pub fn mtime_secs(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn traversal_is_refused() {
        assert!(validate_vault_path("Allowed/../Secret/stolen.md").is_err());
        assert!(validate_vault_path("/etc/passwd").is_err());
        assert!(validate_vault_path("a\\b.md").is_err());
        assert!(validate_vault_path(".notegraph/state.msgpack").is_err());
        assert!(validate_vault_path("").is_err());
        assert!(validate_vault_path("notes/ok.md").is_ok());
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fs = VaultFs::new(dir.path());
        fs.write("notes/a.md", b"hello").unwrap();
        assert!(fs.exists("notes/a.md"));
        assert_eq!(fs.read("notes/a.md").unwrap(), "hello");
    }

    #[test]
    fn list_markdown_skips_hidden_and_non_md() {
        let dir = TempDir::new().unwrap();
        let fs = VaultFs::new(dir.path());
        fs.write("a.md", b"one").unwrap();
        fs.write("sub/b.md", b"two").unwrap();
        std::fs::write(dir.path().join("c.txt"), "not md").unwrap();
        std::fs::create_dir_all(dir.path().join(DATA_DIR_NAME)).unwrap();
        std::fs::write(dir.path().join(DATA_DIR_NAME).join("x.md"), "hidden").unwrap();

        let listed = fs.list_markdown().unwrap();
        let paths: Vec<&str> = listed.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "sub/b.md"]);
        assert!(listed.iter().all(|e| e.size > 0));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fs = VaultFs::new(dir.path());
        fs.write("a.md", b"x").unwrap();
        fs.remove("a.md").unwrap();
        fs.remove("a.md").unwrap();
        assert!(!fs.exists("a.md"));
    }
}
