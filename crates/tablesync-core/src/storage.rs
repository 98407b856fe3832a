//! Storage collaborator used by the ledger and the engine.
//!
//! The engine needs very little from durable storage: read an object, replace
//! an object atomically, create an object only if it does not exist yet,
//! remove an object, and list the children of a directory-like prefix. This
//! module provides those operations over two backends:
//!
//! - [`StorageLocation::Local`]: a directory on the local filesystem. Atomic
//!   replacement uses write-to-temp, `fsync`, then rename.
//! - [`StorageLocation::Memory`]: a [`MemoryStore`] shared map, scoped to a
//!   path prefix.
//!
//! Per-key locking lives in [`locks`]. Paths passed to the helpers are always
//! relative to the location; higher layers never build absolute paths
//! themselves.
pub mod error;
pub mod locks;
pub mod memory;

pub use error::*;
pub use locks::{KeyLockGuard, KeyLocks};
pub use memory::MemoryStore;

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use snafu::prelude::*;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Where objects live.
#[derive(Clone, Debug)]
pub enum StorageLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
    /// A prefix inside an in-memory store.
    Memory {
        /// Backing store, shared between clones.
        store: MemoryStore,
        /// Prefix that every relative path is joined onto.
        prefix: PathBuf,
    },
}

impl StorageLocation {
    /// A location rooted at a local directory.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageLocation::Local(root.into())
    }

    /// A location at the root of an in-memory store.
    pub fn memory(store: MemoryStore) -> Self {
        StorageLocation::Memory {
            store,
            prefix: PathBuf::new(),
        }
    }

    /// Parse a user-facing location string.
    ///
    /// Only local filesystem paths are accepted; an empty string is rejected.
    pub fn parse(spec: &str) -> StorageResult<Self> {
        let trimmed = spec.trim();
        ensure!(
            !trimmed.is_empty(),
            InvalidLocationSnafu {
                spec,
                reason: "location is empty",
            }
        );
        Ok(StorageLocation::local(trimmed))
    }

    /// A location scoped to `rel` below this one.
    pub fn child(&self, rel: impl AsRef<Path>) -> Self {
        match self {
            StorageLocation::Local(root) => StorageLocation::Local(root.join(rel)),
            StorageLocation::Memory { store, prefix } => StorageLocation::Memory {
                store: store.clone(),
                prefix: prefix.join(rel),
            },
        }
    }

    fn resolve(&self, rel: &Path) -> PathBuf {
        match self {
            StorageLocation::Local(root) => root.join(rel),
            StorageLocation::Memory { prefix, .. } => prefix.join(rel),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::Local(root) => write!(f, "{}", root.display()),
            StorageLocation::Memory { prefix, .. } => write!(f, "memory:/{}", prefix.display()),
        }
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best effort; the caller is already returning another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Replace the object at `rel_path` with `contents` atomically.
///
/// Readers observe either the previous contents or the new contents, never a
/// partial write. On the local backend this writes a sibling `.tmp` file,
/// syncs it, and renames it over the target.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    match location {
        StorageLocation::Local(_) => {
            create_parent_dir(&abs).await?;

            let tmp_path = abs.with_extension("tmp");
            let mut guard = TempFileGuard::new(tmp_path.clone());

            {
                let mut file = fs::File::create(&tmp_path)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.write_all(contents)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.sync_all()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;
            }

            fs::rename(&tmp_path, &abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            guard.disarm();
            Ok(())
        }
        StorageLocation::Memory { store, .. } => store
            .put(&abs, contents)
            .map_err(|e| StorageError::classify(abs.display().to_string(), e)),
    }
}

/// Create a *new* object at `rel_path`, failing with
/// [`StorageError::AlreadyExists`] if one is already there.
///
/// The ledger uses this for change-set files so that each sequence number is
/// written exactly once.
pub async fn write_new(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    let path_str = abs.display().to_string();
    match location {
        StorageLocation::Local(_) => {
            create_parent_dir(&abs).await?;

            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&abs)
                .await
                .map_err(|e| StorageError::classify(path_str.clone(), BackendError::Local(e)))?;

            file.write_all(contents)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: path_str.clone(),
                })?;

            file.sync_all()
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu { path: path_str })?;

            Ok(())
        }
        StorageLocation::Memory { store, .. } => store
            .put_new(&abs, contents)
            .map_err(|e| StorageError::classify(path_str, e)),
    }
}

/// Read the object at `rel_path` as UTF-8 text.
///
/// A missing object yields [`StorageError::NotFound`]; every other failure is
/// [`StorageError::OtherIo`].
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.resolve(rel_path);
    let path_str = abs.display().to_string();
    match location {
        StorageLocation::Local(_) => fs::read_to_string(&abs)
            .await
            .map_err(|e| StorageError::classify(path_str, BackendError::Local(e))),
        StorageLocation::Memory { store, .. } => {
            let bytes = store
                .read(&abs)
                .map_err(|e| StorageError::classify(path_str.clone(), e))?;
            String::from_utf8(bytes)
                .map_err(|e| {
                    BackendError::Memory(io::Error::new(io::ErrorKind::InvalidData, e))
                })
                .context(OtherIoSnafu { path: path_str })
        }
    }
}

/// Remove the object at `rel_path`.
pub async fn remove(location: &StorageLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    let path_str = abs.display().to_string();
    match location {
        StorageLocation::Local(_) => fs::remove_file(&abs)
            .await
            .map_err(|e| StorageError::classify(path_str, BackendError::Local(e))),
        StorageLocation::Memory { store, .. } => store
            .remove(&abs)
            .map_err(|e| StorageError::classify(path_str, e)),
    }
}

/// List the names of the immediate children of `rel_dir`, sorted.
///
/// A missing directory lists as empty. Temporary files left behind by an
/// interrupted [`write_atomic`] are skipped.
pub async fn list_dir(location: &StorageLocation, rel_dir: &Path) -> StorageResult<Vec<String>> {
    let abs = location.resolve(rel_dir);
    let mut names = match location {
        StorageLocation::Local(_) => {
            let mut entries = match fs::read_dir(&abs).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(BackendError::Local(e)).context(OtherIoSnafu {
                        path: abs.display().to_string(),
                    });
                }
            };
            let mut names = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?
            {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names
        }
        StorageLocation::Memory { store, .. } => store.children(&abs),
    };
    names.retain(|name| !name.ends_with(".tmp"));
    names.sort();
    Ok(names)
}
