//! Scratch storage for staged payloads.
//!
//! Each session's payload is written verbatim to its own file under the
//! scratch root:
//!   {root}/{session_id}-{seq}.tmp
//!
//! No framing, no metadata. The file belongs to the worker that allocated
//! it and is removed when that worker ends.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

use cvp_core::SessionId;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

const SCRATCH_EXTENSION: &str = "tmp";

#[derive(Debug, Clone)]
pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create scratch root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pick a fresh location for a session's payload. Nothing is created.
    pub fn allocate(&self, session: SessionId) -> PathBuf {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("{session}-{seq:x}.{SCRATCH_EXTENSION}"))
    }

    /// Count scratch files currently on disk (for stats/debugging).
    pub fn count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().extension().is_some_and(|x| x == SCRATCH_EXTENSION))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Remove leftover scratch files, e.g. from a previous crash.
    pub fn purge(&self) -> usize {
        let mut removed = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|x| x == SCRATCH_EXTENSION)
                    && fs::remove_file(&path).is_ok()
                {
                    removed += 1;
                }
            }
        }
        removed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    pub(crate) fn temp_store() -> ScratchStore {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "cvp-scratch-test-{}-{}",
            std::process::id(),
            id
        ));
        let _ = fs::remove_dir_all(&dir);
        ScratchStore::new(&dir).unwrap()
    }

    #[test]
    fn new_creates_directory() {
        let store = temp_store();
        assert!(store.root().is_dir());
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn allocations_are_unique_per_call() {
        let store = temp_store();
        let id = SessionId::new(0xabc);
        let first = store.allocate(id);
        let second = store.allocate(id);
        assert_ne!(first, second);
        assert!(first.starts_with(store.root()));
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("00000abc-"));
        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn purge_removes_only_scratch_files() {
        let store = temp_store();
        fs::write(store.allocate(SessionId::new(1)), b"left over").unwrap();
        fs::write(store.allocate(SessionId::new(2)), b"left over").unwrap();
        fs::write(store.root().join("keep.txt"), b"not ours").unwrap();

        assert_eq!(store.count(), 2);
        assert_eq!(store.purge(), 2);
        assert_eq!(store.count(), 0);
        assert!(store.root().join("keep.txt").exists());
        let _ = fs::remove_dir_all(store.root());
    }
}
