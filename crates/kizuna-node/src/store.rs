//! The shared memory log and blob drive live outside the core; these are the
//! narrow interfaces the node consumes, backed here by plain files under the
//! data directory.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use kizuna_protocol::envelope::now_ms;

/// Entries returned by a memory read.
pub const MEMORY_READ_LIMIT: usize = 100;

// ============================================================================
// Append-only memory log
// ============================================================================

pub struct MemoryLog {
    path: PathBuf,
}

impl MemoryLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one entry; returns the total entry count.
    pub fn append(&self, content: &Value) -> Result<usize> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&serde_json::json!({
            "timestamp": now_ms(),
            "content": content,
        }))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;

        let reader = BufReader::new(std::fs::File::open(&self.path)?);
        Ok(reader.lines().count())
    }

    /// The most recent entries, oldest first.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<Value>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(std::fs::File::open(&self.path)?);
        let entries: Vec<Value> = reader
            .lines()
            .map_while(|l| l.ok())
            .filter_map(|l| serde_json::from_str(&l).ok())
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

// ============================================================================
// Blob drive
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BlobInfo {
    pub name: String,
    pub size: u64,
}

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Blob names are flat: no separators, no dot-dot, nothing hidden.
    fn check_name(name: &str) -> Result<()> {
        let ok = !name.is_empty()
            && name.len() <= 255
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if ok {
            Ok(())
        } else {
            anyhow::bail!("invalid blob name: {name:?}")
        }
    }

    pub fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        Self::check_name(name)?;
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.root.join(name), bytes)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Self::check_name(name)?;
        match std::fs::read(self.root.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self) -> Result<Vec<BlobInfo>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                out.push(BlobInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: entry.metadata()?.len(),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_appends_and_reads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLog::new(dir.path().join("memory.log"));
        assert_eq!(log.append(&json!("first")).unwrap(), 1);
        assert_eq!(log.append(&json!("second")).unwrap(), 2);

        let entries = log.read_recent(MEMORY_READ_LIMIT).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["content"], "first");
        assert_eq!(entries[1]["content"], "second");

        assert_eq!(log.read_recent(1).unwrap()[0]["content"], "second");
    }

    #[test]
    fn blobs_round_trip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("drive"));
        store.put("notes.txt", b"hello").unwrap();
        assert_eq!(store.get("notes.txt").unwrap().unwrap(), b"hello");
        assert!(store.get("absent.bin").unwrap().is_none());

        let files = store.list().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "notes.txt");
        assert_eq!(files[0].size, 5);
    }

    #[test]
    fn traversal_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("drive"));
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.put("a/b", b"x").is_err());
        assert!(store.put(".hidden", b"x").is_err());
        assert!(store.put("", b"x").is_err());
    }
}
