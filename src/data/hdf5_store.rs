//! HDF5 run container (feature `storage_hdf5`).
//!
//! One file per run:
//!
//! ```text
//! run_20260101_120000_1a2b3c4d.h5
//! └── run/                       attrs: run_id, created_at, operator, ..., metadata_json
//!     ├── index                  u64   (N)
//!     ├── timestamp_ns           i64   (N)
//!     ├── coordinates/<axis>     f64   (N)
//!     └── channels/<name>        f64   (N × samples)
//! ```
//!
//! Every dataset is resizable and chunked, grown by one row per point. `index`
//! is grown last, so a row is complete exactly when its index is present;
//! reopening shrinks any longer dataset back to the index length.
//!
//! The checkpoint lives next to the file as `<stem>.checkpoint.json`.

use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File, Group};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{check_index_order, run_stem, RunStore, RunWriter};
use crate::error::{AppResult, DaqError};
use crate::experiment::record::{DataRecord, RunMetadata};
use crate::experiment::state::Checkpoint;

const RUN_GROUP: &str = "run";
const CHUNK_ROWS: usize = 64;

fn h5(context: &str, err: hdf5::Error) -> DaqError {
    DaqError::persistence(context, err)
}

fn write_str_attr(group: &Group, name: &str, value: &str) -> AppResult<()> {
    let value = value
        .parse::<VarLenUnicode>()
        .map_err(|e| DaqError::persistence(format!("Invalid attribute '{}'", name), e))?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)
        .and_then(|attr| attr.write_scalar(&value))
        .map_err(|e| h5("Failed to write attribute", e))
}

fn dataset_name(name: &str) -> String {
    name.replace('/', "_")
}

fn checkpoint_path(file: &Path) -> PathBuf {
    file.with_extension("checkpoint.json")
}

fn grow_1d<T: hdf5::H5Type + Copy>(ds: &Dataset, row: usize, value: T) -> AppResult<()> {
    ds.resize((row + 1,))
        .and_then(|_| ds.write_slice(&[value][..], row..row + 1))
        .map_err(|e| h5("Failed to append row", e))
}

/// Creates one HDF5 file per run under a root directory.
#[derive(Debug, Clone)]
pub struct Hdf5Store {
    root: PathBuf,
}

impl Hdf5Store {
    /// Store creating runs under `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl RunStore for Hdf5Store {
    fn create(&self, metadata: &RunMetadata) -> AppResult<Box<dyn RunWriter>> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| DaqError::persistence(format!("Failed to create {:?}", self.root), e))?;
        let path = self.root.join(format!("{}.h5", run_stem(metadata)));
        if path.exists() {
            return Err(DaqError::Persistence(format!("Run file {:?} already exists", path)));
        }

        let file = File::create(&path).map_err(|e| h5("Failed to create run file", e))?;
        let run = file
            .create_group(RUN_GROUP)
            .map_err(|e| h5("Failed to create run group", e))?;

        write_str_attr(&run, "run_id", &metadata.run_id)?;
        write_str_attr(&run, "created_at", &metadata.created_at_utc.to_rfc3339())?;
        write_str_attr(&run, "created_at_local", &metadata.created_at_local)?;
        write_str_attr(&run, "operator", &metadata.description.operator)?;
        write_str_attr(&run, "description", &metadata.description.description)?;
        write_str_attr(&run, "location", &metadata.description.location)?;
        write_str_attr(&run, "software_version", &metadata.software_version)?;
        write_str_attr(&run, "sweep", &serde_json::to_string(&metadata.sweep)?)?;
        for (role, identity) in &metadata.instruments {
            write_str_attr(&run, &format!("instrument.{}", role), identity)?;
        }
        for (key, value) in &metadata.description.user {
            write_str_attr(&run, &format!("user.{}", key), value)?;
        }
        write_str_attr(&run, "metadata_json", &serde_json::to_string(metadata)?)?;

        run.new_dataset::<u64>()
            .chunk(CHUNK_ROWS)
            .shape(0..)
            .create("index")
            .and_then(|_| {
                run.new_dataset::<i64>()
                    .chunk(CHUNK_ROWS)
                    .shape(0..)
                    .create("timestamp_ns")
            })
            .map_err(|e| h5("Failed to create index datasets", e))?;

        let coordinates = run
            .create_group("coordinates")
            .map_err(|e| h5("Failed to create coordinates group", e))?;
        for axis in &metadata.axes {
            coordinates
                .new_dataset::<f64>()
                .chunk(CHUNK_ROWS)
                .shape(0..)
                .create(dataset_name(axis).as_str())
                .map_err(|e| h5("Failed to create coordinate dataset", e))?;
        }
        run.create_group("channels")
            .map_err(|e| h5("Failed to create channels group", e))?;
        file.flush().map_err(|e| h5("Failed to flush run file", e))?;

        info!(run_id = %metadata.run_id, path = ?path, "Created HDF5 run file");
        Ok(Box::new(Hdf5Writer {
            path,
            metadata: metadata.clone(),
            last_index: None,
            written: 0,
            checkpoint: None,
            closed: false,
        }))
    }

    fn reopen(&self, location: &Path) -> AppResult<Box<dyn RunWriter>> {
        let file = File::open_rw(location).map_err(|e| h5("Failed to open run file", e))?;
        let run = file.group(RUN_GROUP).map_err(|e| h5("Missing run group", e))?;
        let metadata_json = run
            .attr("metadata_json")
            .and_then(|attr| attr.read_scalar::<VarLenUnicode>())
            .map_err(|e| h5("Failed to read run metadata", e))?;
        let metadata: RunMetadata = serde_json::from_str(metadata_json.as_str())?;

        let indices = run
            .dataset("index")
            .and_then(|ds| ds.read_raw::<u64>())
            .map_err(|e| h5("Failed to read index dataset", e))?;
        let rows = indices.len();

        // Shrink datasets that were grown for a point whose index never landed
        let mut datasets = vec![run
            .dataset("timestamp_ns")
            .map_err(|e| h5("Missing timestamp dataset", e))?];
        for group in ["coordinates", "channels"] {
            let group = run.group(group).map_err(|e| h5("Missing dataset group", e))?;
            datasets.extend(group.datasets().map_err(|e| h5("Failed to list datasets", e))?);
        }
        for ds in datasets {
            let shape = ds.shape();
            if shape.first().copied().unwrap_or(0) > rows {
                warn!(run_id = %metadata.run_id, dataset = %ds.name(), "Truncating incomplete row");
                let mut truncated = shape.clone();
                truncated[0] = rows;
                ds.resize(truncated)
                    .map_err(|e| h5("Failed to truncate dataset", e))?;
            }
        }
        file.flush().map_err(|e| h5("Failed to flush run file", e))?;

        let checkpoint_file = checkpoint_path(location);
        let checkpoint = if checkpoint_file.exists() {
            Some(Checkpoint::load(&checkpoint_file)?)
        } else {
            None
        };

        info!(run_id = %metadata.run_id, records = rows, "Reopened HDF5 run file");
        Ok(Box::new(Hdf5Writer {
            path: location.to_path_buf(),
            metadata,
            last_index: indices.last().map(|i| *i as usize),
            written: rows,
            checkpoint,
            closed: false,
        }))
    }
}

/// Writer for one HDF5 run file.
pub struct Hdf5Writer {
    path: PathBuf,
    metadata: RunMetadata,
    last_index: Option<usize>,
    written: usize,
    checkpoint: Option<Checkpoint>,
    closed: bool,
}

impl Hdf5Writer {
    fn append_row(&self, run: &Group, record: &DataRecord) -> AppResult<()> {
        let row = self.written;

        let coordinates = run
            .group("coordinates")
            .map_err(|e| h5("Missing coordinates group", e))?;
        for (axis, value) in self.metadata.axes.iter().zip(&record.coordinate) {
            let ds = coordinates
                .dataset(dataset_name(axis).as_str())
                .map_err(|e| h5("Missing coordinate dataset", e))?;
            grow_1d(&ds, row, *value)?;
        }

        let channels = run
            .group("channels")
            .map_err(|e| h5("Missing channels group", e))?;
        for (name, values) in &record.channels {
            let key = dataset_name(name);
            let ds = match channels.dataset(key.as_str()) {
                Ok(ds) => ds,
                Err(_) => channels
                    .new_dataset::<f64>()
                    .chunk((CHUNK_ROWS, values.len().max(1)))
                    .shape((0.., values.len()))
                    .create(key.as_str())
                    .map_err(|e| h5("Failed to create channel dataset", e))?,
            };
            let width = ds.shape().get(1).copied().unwrap_or(0);
            if width != values.len() {
                return Err(DaqError::Persistence(format!(
                    "Channel '{}' has {} samples, dataset expects {}",
                    name,
                    values.len(),
                    width
                )));
            }
            let rowdata = Array2::from_shape_vec((1, width), values.clone())
                .map_err(|e| DaqError::persistence("Invalid channel shape", e))?;
            ds.resize((row + 1, width))
                .and_then(|_| ds.write_slice(&rowdata, (row..row + 1, ..)))
                .map_err(|e| h5("Failed to append channel row", e))?;
        }

        let timestamp = run
            .dataset("timestamp_ns")
            .map_err(|e| h5("Missing timestamp dataset", e))?;
        grow_1d(
            &timestamp,
            row,
            record.timestamp.timestamp_nanos_opt().unwrap_or_default(),
        )?;

        let index = run.dataset("index").map_err(|e| h5("Missing index dataset", e))?;
        grow_1d(&index, row, record.index as u64)
    }
}

impl RunWriter for Hdf5Writer {
    fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: &DataRecord) -> AppResult<()> {
        if self.closed {
            return Err(DaqError::Persistence("Run file is closed".into()));
        }
        check_index_order(self.last_index, record)?;

        let file = File::open_rw(&self.path).map_err(|e| h5("Failed to open run file", e))?;
        let run = file.group(RUN_GROUP).map_err(|e| h5("Missing run group", e))?;
        self.append_row(&run, record)?;
        file.flush().map_err(|e| h5("Failed to flush run file", e))?;

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
        checkpoint.save(checkpoint_path(&self.path))?;
        self.checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    fn close(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Read coordinate dataset `axis` of the run file at `path`.
pub fn read_axis(path: &Path, axis: &str) -> AppResult<Vec<f64>> {
    let file = File::open(path).map_err(|e| h5("Failed to open run file", e))?;
    file.dataset(&format!("{}/coordinates/{}", RUN_GROUP, dataset_name(axis)))
        .and_then(|ds| ds.read_raw::<f64>())
        .map_err(|e| h5("Failed to read coordinate dataset", e))
}

/// Read channel dataset `name` of the run file at `path`, one row per record.
pub fn read_channel(path: &Path, name: &str) -> AppResult<Vec<Vec<f64>>> {
    let file = File::open(path).map_err(|e| h5("Failed to open run file", e))?;
    let data = file
        .dataset(&format!("{}/channels/{}", RUN_GROUP, dataset_name(name)))
        .and_then(|ds| ds.read_2d::<f64>())
        .map_err(|e| h5("Failed to read channel dataset", e))?;
    Ok(data.outer_iter().map(|row| row.to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::record::RunDescription;
    use crate::experiment::sweep::{SweepAxis, SweepConfig};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn hdf5_append_reopen_and_read() {
        let dir = tempdir().unwrap();
        let store = Hdf5Store::new(dir.path());
        let sweep = SweepConfig::nested(vec![SweepAxis::count(3)]).unwrap();
        let metadata = RunMetadata::new(sweep, RunDescription::default(), 3);

        let record = |i: usize| {
            DataRecord::new(
                i,
                vec![i as f64],
                BTreeMap::from([("thz.signal".to_string(), vec![i as f64; 4])]),
            )
        };

        let location = {
            let mut writer = store.create(&metadata).unwrap();
            writer.append(&record(0)).unwrap();
            writer.append(&record(1)).unwrap();
            writer.location().to_path_buf()
        };

        let mut writer = store.reopen(&location).unwrap();
        assert_eq!(writer.last_index(), Some(1));
        writer.append(&record(2)).unwrap();

        assert_eq!(read_axis(&location, "count").unwrap(), vec![0.0, 1.0, 2.0]);
        let signal = read_channel(&location, "thz.signal").unwrap();
        assert_eq!(signal.len(), 3);
        assert_eq!(signal[2], vec![2.0; 4]);
    }
}
