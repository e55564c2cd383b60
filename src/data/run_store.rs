//! JSON-lines run container.
//!
//! Layout of one run directory:
//!
//! ```text
//! run_20260101_120000_1a2b3c4d/
//! ├── attributes.json   # RunMetadata, written once (create_new)
//! ├── records.jsonl     # one DataRecord per line, synced after each append
//! └── checkpoint.json   # last completed index, state, status (atomic replace)
//! ```
//!
//! A crash during an append can leave a torn last line. Reopening truncates it
//! and continues appending; readers skip it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{check_index_order, run_stem, RunStore, RunWriter};
use crate::error::{AppResult, DaqError};
use crate::experiment::record::{DataRecord, RunMetadata};
use crate::experiment::state::Checkpoint;

/// Root attributes file name.
pub const ATTRIBUTES_FILE: &str = "attributes.json";
/// Records file name.
pub const RECORDS_FILE: &str = "records.jsonl";
/// Checkpoint file name.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

fn read_metadata(dir: &Path) -> AppResult<RunMetadata> {
    let path = dir.join(ATTRIBUTES_FILE);
    let bytes = fs::read(&path)
        .map_err(|e| DaqError::persistence(format!("Failed to read {:?}", path), e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn read_checkpoint(dir: &Path) -> AppResult<Option<Checkpoint>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    Checkpoint::load(path).map(Some)
}

/// Outcome of scanning a records file.
struct Scan {
    /// Byte length of the complete, valid prefix
    valid_len: u64,
    last_index: Option<usize>,
    count: usize,
}

/// Scan `path` line by line, calling `visit` for every complete record.
///
/// Stops at a trailing line without newline (torn append). A complete line
/// that does not parse is corruption and fails the scan.
fn scan_records(
    path: &Path,
    mut visit: impl FnMut(DataRecord) -> AppResult<()>,
) -> AppResult<Scan> {
    let file =
        File::open(path).map_err(|e| DaqError::persistence(format!("Failed to open {:?}", path), e))?;
    let mut reader = BufReader::new(file);
    let mut scan = Scan {
        valid_len: 0,
        last_index: None,
        count: 0,
    };
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| DaqError::persistence(format!("Failed to read {:?}", path), e))?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }
        let record: DataRecord = serde_json::from_slice(&line).map_err(|e| {
            DaqError::Persistence(format!(
                "Corrupt record after index {:?} in {:?}: {}",
                scan.last_index, path, e
            ))
        })?;
        check_index_order(scan.last_index, &record)?;
        scan.last_index = Some(record.index);
        scan.count += 1;
        scan.valid_len += n as u64;
        visit(record)?;
    }

    Ok(scan)
}

/// Creates and reopens run directories under a root directory.
#[derive(Debug, Clone)]
pub struct JsonLinesStore {
    root: PathBuf,
    fsync: bool,
}

impl JsonLinesStore {
    /// Store creating runs under `root`. With `fsync`, every append is synced.
    pub fn new(root: impl AsRef<Path>, fsync: bool) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            fsync,
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RunStore for JsonLinesStore {
    fn create(&self, metadata: &RunMetadata) -> AppResult<Box<dyn RunWriter>> {
        fs::create_dir_all(&self.root)
            .map_err(|e| DaqError::persistence(format!("Failed to create {:?}", self.root), e))?;
        let dir = self.root.join(run_stem(metadata));
        fs::create_dir(&dir)
            .map_err(|e| DaqError::persistence(format!("Failed to create run {:?}", dir), e))?;

        let attributes_path = dir.join(ATTRIBUTES_FILE);
        let mut attributes = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&attributes_path)
            .map_err(|e| DaqError::persistence(format!("Failed to create {:?}", attributes_path), e))?;
        attributes
            .write_all(&serde_json::to_vec_pretty(metadata)?)
            .and_then(|_| attributes.sync_all())
            .map_err(|e| DaqError::persistence(format!("Failed to write {:?}", attributes_path), e))?;

        let records_path = dir.join(RECORDS_FILE);
        let records = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&records_path)
            .map_err(|e| DaqError::persistence(format!("Failed to create {:?}", records_path), e))?;

        info!(run_id = %metadata.run_id, path = ?dir, "Created run container");
        Ok(Box::new(JsonLinesWriter {
            dir,
            metadata: metadata.clone(),
            records: Some(records),
            fsync: self.fsync,
            last_index: None,
            written: 0,
            checkpoint: None,
        }))
    }

    fn reopen(&self, location: &Path) -> AppResult<Box<dyn RunWriter>> {
        let metadata = read_metadata(location)?;
        let records_path = location.join(RECORDS_FILE);
        let scan = scan_records(&records_path, |_| Ok(()))?;

        let records = OpenOptions::new()
            .append(true)
            .open(&records_path)
            .map_err(|e| DaqError::persistence(format!("Failed to open {:?}", records_path), e))?;
        let on_disk = records
            .metadata()
            .map_err(|e| DaqError::persistence(format!("Failed to stat {:?}", records_path), e))?
            .len();
        if on_disk > scan.valid_len {
            warn!(
                run_id = %metadata.run_id,
                torn_bytes = on_disk - scan.valid_len,
                "Truncating torn trailing record"
            );
            records
                .set_len(scan.valid_len)
                .and_then(|_| records.sync_all())
                .map_err(|e| DaqError::persistence(format!("Failed to truncate {:?}", records_path), e))?;
        }

        let checkpoint = read_checkpoint(location)?;
        info!(
            run_id = %metadata.run_id,
            records = scan.count,
            last_index = ?scan.last_index,
            "Reopened run container"
        );
        Ok(Box::new(JsonLinesWriter {
            dir: location.to_path_buf(),
            metadata,
            records: Some(records),
            fsync: self.fsync,
            last_index: scan.last_index,
            written: scan.count,
            checkpoint,
        }))
    }
}

/// Writer for one run directory.
pub struct JsonLinesWriter {
    dir: PathBuf,
    metadata: RunMetadata,
    records: Option<File>,
    fsync: bool,
    last_index: Option<usize>,
    written: usize,
    checkpoint: Option<Checkpoint>,
}

impl RunWriter for JsonLinesWriter {
    fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    fn location(&self) -> &Path {
        &self.dir
    }

    fn append(&mut self, record: &DataRecord) -> AppResult<()> {
        check_index_order(self.last_index, record)?;
        let file = self
            .records
            .as_mut()
            .ok_or_else(|| DaqError::Persistence("Run container is closed".into()))?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        // One write per record keeps a torn append confined to the last line
        file.write_all(&line)
            .map_err(|e| DaqError::persistence("Failed to append record", e))?;
        if self.fsync {
            file.sync_data()
                .map_err(|e| DaqError::persistence("Failed to sync record", e))?;
        }

        self.last_index = Some(record.index);
        self.written += 1;
        Ok(())
    }

    fn last_index(&self) -> Option<usize> {
        self.last_index
    }

    fn records_written(&self) -> usize {
        self.written
    }

    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> AppResult<()> {
        checkpoint.save(self.dir.join(CHECKPOINT_FILE))?;
        self.checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    fn close(&mut self) -> AppResult<()> {
        if let Some(file) = self.records.take() {
            file.sync_all()
                .map_err(|e| DaqError::persistence("Failed to sync records on close", e))?;
        }
        Ok(())
    }
}

impl Drop for JsonLinesWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(run_id = %self.metadata.run_id, error = %e, "Closing run container failed");
        }
    }
}

/// Read-only access to a run directory.
///
/// Datasets are materialised per channel or per axis, ordered by index.
#[derive(Debug, Clone)]
pub struct RunReader {
    dir: PathBuf,
    metadata: RunMetadata,
}

impl RunReader {
    /// Open the run at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let metadata = read_metadata(&dir)?;
        Ok(Self { dir, metadata })
    }

    /// Run metadata.
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Latest checkpoint, if any.
    pub fn checkpoint(&self) -> AppResult<Option<Checkpoint>> {
        read_checkpoint(&self.dir)
    }

    /// Every complete record in order.
    pub fn records(&self) -> AppResult<Vec<DataRecord>> {
        let mut records = Vec::new();
        scan_records(&self.dir.join(RECORDS_FILE), |record| {
            records.push(record);
            Ok(())
        })?;
        Ok(records)
    }

    /// Record indices in order.
    pub fn indices(&self) -> AppResult<Vec<usize>> {
        let mut indices = Vec::new();
        scan_records(&self.dir.join(RECORDS_FILE), |record| {
            indices.push(record.index);
            Ok(())
        })?;
        Ok(indices)
    }

    /// Values of channel `name`, one entry per record.
    ///
    /// # Errors
    ///
    /// Persistence error if a record lacks the channel.
    pub fn channel(&self, name: &str) -> AppResult<Vec<Vec<f64>>> {
        let mut values = Vec::new();
        scan_records(&self.dir.join(RECORDS_FILE), |mut record| {
            let value = record.channels.remove(name).ok_or_else(|| {
                DaqError::Persistence(format!(
                    "Record {} has no channel '{}'",
                    record.index, name
                ))
            })?;
            values.push(value);
            Ok(())
        })?;
        Ok(values)
    }

    /// Coordinate values of axis `name`, one entry per record.
    pub fn axis(&self, name: &str) -> AppResult<Vec<f64>> {
        let position = self
            .metadata
            .axes
            .iter()
            .position(|a| a == name)
            .ok_or_else(|| DaqError::Configuration(format!("Run has no axis '{}'", name)))?;
        let mut values = Vec::new();
        scan_records(&self.dir.join(RECORDS_FILE), |record| {
            values.push(record.coordinate.get(position).copied().unwrap_or(f64::NAN));
            Ok(())
        })?;
        Ok(values)
    }
}
