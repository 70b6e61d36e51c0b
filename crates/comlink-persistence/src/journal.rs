//! Bounded append-only JSON journals.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::atomic::{atomic_write_json, read_json_optional};
use crate::error::{PersistenceError, Result};

/// Keeps the most recent `capacity` entries of `T` in one JSON array file.
///
/// Appends rewrite the whole file atomically; older entries fall off the
/// front once the capacity is reached.
pub struct Journal<T> {
    path: PathBuf,
    capacity: usize,
    lock: Mutex<()>,
    _entry: PhantomData<fn() -> T>,
}

impl<T> Journal<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a journal backed by `path`.
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity: capacity.max(1),
            lock: Mutex::new(()),
            _entry: PhantomData,
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an entry, dropping the oldest beyond capacity.
    pub fn append(&self, entry: T) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;

        let mut entries: Vec<T> = read_json_optional(&self.path)?.unwrap_or_default();
        entries.push(entry);
        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            entries.drain(..excess);
        }
        atomic_write_json(&self.path, &entries)
    }

    /// Returns all entries, oldest first.
    pub fn entries(&self) -> Result<Vec<T>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;
        Ok(read_json_optional(&self.path)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let journal: Journal<String> = Journal::new(dir.path().join("j.json"), 10);

        journal.append("a".into()).unwrap();
        journal.append("b".into()).unwrap();

        assert_eq!(journal.entries().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let dir = tempdir().unwrap();
        let journal: Journal<u32> = Journal::new(dir.path().join("j.json"), 3);

        for i in 0..5 {
            journal.append(i).unwrap();
        }

        assert_eq!(journal.entries().unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_empty_when_missing() {
        let dir = tempdir().unwrap();
        let journal: Journal<u32> = Journal::new(dir.path().join("none.json"), 3);
        assert!(journal.entries().unwrap().is_empty());
    }
}
