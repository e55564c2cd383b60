//! Incremental run persistence.
//!
//! A run container holds the immutable run metadata, one record per acquired
//! point and a checkpoint. Every [`RunWriter::append`] is durable when it
//! returns; the Runner only advances after that, so a crash loses at most the
//! point that was in flight.
//!
//! Backends:
//! - [`run_store::JsonLinesStore`] (default): run directory with JSON-lines records
//! - `hdf5_store::Hdf5Store` (feature `storage_hdf5`): one HDF5 file per run

pub mod run_store;

#[cfg(feature = "storage_hdf5")]
pub mod hdf5_store;

use std::path::Path;
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{AppResult, DaqError};
use crate::experiment::record::{DataRecord, RunMetadata};
use crate::experiment::state::Checkpoint;

/// Append-only writer for one run.
pub trait RunWriter: Send {
    /// Metadata written at run start.
    fn metadata(&self) -> &RunMetadata;

    /// Where the run lives (directory or file).
    fn location(&self) -> &Path;

    /// Append `record` durably.
    ///
    /// # Errors
    ///
    /// Persistence error if the record index does not follow the last written
    /// one, or the write or sync fails.
    fn append(&mut self, record: &DataRecord) -> AppResult<()>;

    /// Index of the last durable record.
    fn last_index(&self) -> Option<usize>;

    /// Number of durable records.
    fn records_written(&self) -> usize;

    /// Replace the run checkpoint atomically.
    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> AppResult<()>;

    /// Most recent checkpoint, if one was written or found on reopen.
    fn checkpoint(&self) -> Option<&Checkpoint>;

    /// Flush and close. Further appends fail.
    fn close(&mut self) -> AppResult<()>;
}

/// Factory for run containers.
pub trait RunStore: Send + Sync {
    /// Create a new container and write `metadata` once.
    fn create(&self, metadata: &RunMetadata) -> AppResult<Box<dyn RunWriter>>;

    /// Reopen an existing container for appending.
    fn reopen(&self, location: &Path) -> AppResult<Box<dyn RunWriter>>;
}

/// Store for the configured backend.
pub fn open_store(config: &StorageConfig) -> AppResult<Arc<dyn RunStore>> {
    match config.backend {
        StorageBackend::Jsonl => Ok(Arc::new(run_store::JsonLinesStore::new(
            &config.output_dir,
            config.fsync,
        ))),
        #[cfg(feature = "storage_hdf5")]
        StorageBackend::Hdf5 => Ok(Arc::new(hdf5_store::Hdf5Store::new(&config.output_dir))),
        #[cfg(not(feature = "storage_hdf5"))]
        StorageBackend::Hdf5 => Err(DaqError::Configuration(
            "Storage backend 'hdf5' requires the storage_hdf5 feature".into(),
        )),
    }
}

/// Reject a record whose index does not follow `last`.
pub(crate) fn check_index_order(last: Option<usize>, record: &DataRecord) -> AppResult<()> {
    match last {
        Some(last) if record.index <= last => Err(DaqError::Persistence(format!(
            "Record index {} does not follow last written index {}",
            record.index, last
        ))),
        _ => Ok(()),
    }
}

/// Directory/file stem for a new run.
pub(crate) fn run_stem(metadata: &RunMetadata) -> String {
    let short_id: String = metadata.run_id.chars().take(8).collect();
    format!(
        "run_{}_{}",
        metadata.created_at_utc.format("%Y%m%d_%H%M%S"),
        short_id
    )
}
