/// Append-merge of a run's table into the persisted dataset.
///
/// Historical rows come first in their stored order, then the new rows. The
/// new run's headers always win; if the stored headers differ the drift is
/// logged and old rows are padded or truncated to the new width.
use crate::store::{StoreError, TableStore};
use crate::table::Table;
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum MergeError {
    Store(StoreError),
    /// Another run holds the dataset lock.
    Locked { path: PathBuf },
    /// The lock file could not be created or locked.
    Lock { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::Store(e) => write!(f, "dataset error: {e}"),
            MergeError::Locked { path } => write!(
                f,
                "dataset is locked by another run ({})",
                path.display()
            ),
            MergeError::Lock { path, source } => {
                write!(f, "failed to lock {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MergeError::Store(e) => Some(e),
            MergeError::Lock { source, .. } => Some(source),
            MergeError::Locked { .. } => None,
        }
    }
}

impl From<StoreError> for MergeError {
    fn from(e: StoreError) -> Self {
        MergeError::Store(e)
    }
}

/// Merges new tables into the dataset at one path.
pub struct DatasetMerger {
    store: Box<dyn TableStore + Send>,
    path: PathBuf,
    sheet: String,
}

impl DatasetMerger {
    pub fn new(store: Box<dyn TableStore + Send>, path: PathBuf, sheet: String) -> Self {
        Self { store, path, sheet }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling lock file guarding read-merge-write.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Combine the stored dataset (if any) with `new_table`.
    pub fn merge(&self, new_table: Table) -> Result<Table, MergeError> {
        let Some(existing) = self.store.read_table(&self.path, &self.sheet)? else {
            tracing::debug!(path = %self.path.display(), "no existing dataset");
            return Ok(new_table);
        };

        if existing.headers() != new_table.headers() {
            tracing::warn!(
                path = %self.path.display(),
                stored = ?existing.headers(),
                current = ?new_table.headers(),
                "stored headers differ from this run; keeping current headers"
            );
        }

        let previous = existing.rows().len();
        let mut merged = Table::new(new_table.headers().to_vec());
        merged.extend_rows(existing.into_rows());
        merged.extend_rows(new_table.into_rows());
        tracing::debug!(previous, total = merged.rows().len(), "merged dataset");
        Ok(merged)
    }

    /// Replace the stored dataset with `table`.
    pub fn persist(&self, table: &Table) -> Result<(), MergeError> {
        self.store.write_table(&self.path, table, &self.sheet)?;
        Ok(())
    }

    /// Merge and persist while holding an exclusive lock on the dataset.
    ///
    /// Fails with `Locked` instead of waiting if another run holds it.
    pub fn merge_and_persist(&self, new_table: Table) -> Result<Table, MergeError> {
        let lock_path = self.lock_path();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| MergeError::Lock {
                path: lock_path.clone(),
                source: e,
            })?;
        lock.try_lock_exclusive()
            .map_err(|e| lock_failure(&lock_path, e))?;

        let result = self.merge(new_table).and_then(|merged| {
            self.persist(&merged)?;
            Ok(merged)
        });

        // Closing the handle releases the lock anyway
        if let Err(e) = lock.unlock() {
            tracing::warn!(path = %lock_path.display(), error = %e, "failed to release dataset lock");
        }
        result
    }
}

/// Contention means another run; anything else (e.g. no lock support on
/// the filesystem) is a real failure.
fn lock_failure(path: &Path, err: std::io::Error) -> MergeError {
    let contended = fs2::lock_contended_error();
    if err.kind() == std::io::ErrorKind::WouldBlock
        || (err.raw_os_error().is_some() && err.raw_os_error() == contended.raw_os_error())
    {
        MergeError::Locked {
            path: path.to_path_buf(),
        }
    } else {
        MergeError::Lock {
            path: path.to_path_buf(),
            source: err,
        }
    }
}
