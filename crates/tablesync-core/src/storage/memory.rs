//! In-memory storage backend.
//!
//! `MemoryStore` keeps every object in a shared ordered map keyed by its full
//! relative path. Cloning the store shares the map, so several
//! [`StorageLocation::Memory`](crate::storage::StorageLocation::Memory) values
//! scoped to different prefixes can view one backing store. It is used by tests
//! and by embedders that do not need durability.
//!
//! Write failures can be injected to exercise storage error paths.
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::{Component, Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::storage::BackendError;

/// Shared in-memory object map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    objects: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write or removal fail with an I/O error until
    /// turned off again.
    pub fn inject_write_failures(&self, enabled: bool) {
        self.inner.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>> {
        self.inner
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), BackendError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Memory(io::Error::other(
                "injected write failure",
            )));
        }
        Ok(())
    }

    pub(crate) fn read(&self, path: &Path) -> Result<Vec<u8>, BackendError> {
        self.objects().get(path).cloned().ok_or_else(|| {
            BackendError::Memory(io::Error::new(io::ErrorKind::NotFound, "no such object"))
        })
    }

    pub(crate) fn put(&self, path: &Path, contents: &[u8]) -> Result<(), BackendError> {
        self.check_writable()?;
        self.objects().insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    pub(crate) fn put_new(&self, path: &Path, contents: &[u8]) -> Result<(), BackendError> {
        self.check_writable()?;
        let mut objects = self.objects();
        if objects.contains_key(path) {
            return Err(BackendError::Memory(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "object already exists",
            )));
        }
        objects.insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    pub(crate) fn remove(&self, path: &Path) -> Result<(), BackendError> {
        self.check_writable()?;
        match self.objects().remove(path) {
            Some(_) => Ok(()),
            None => Err(BackendError::Memory(io::Error::new(
                io::ErrorKind::NotFound,
                "no such object",
            ))),
        }
    }

    /// Names of the immediate children below `dir`, sorted.
    pub(crate) fn children(&self, dir: &Path) -> Vec<String> {
        let objects = self.objects();
        let mut names = BTreeSet::new();
        for key in objects.range(dir.to_path_buf()..).map(|(k, _)| k) {
            let Ok(rest) = key.strip_prefix(dir) else {
                break;
            };
            if let Some(Component::Normal(first)) = rest.components().next() {
                names.insert(first.to_string_lossy().into_owned());
            }
        }
        names.into_iter().collect()
    }
}
