use fxhash::FxHashMap;
use hdf5::{Dataset, Extent, File, Group, SimpleExtents};
use ndarray::{s, Array1, Array2, Array3};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::comm::{Communicator, RegionLedger, Reservation};
use super::error::{CommError, WriterError};
use super::gate::{OutValue, OutputRecord};

const ENTRY_GROUP: &str = "entry_1";

/// The shared side of the parallel writer: one HDF5 file per run, opened
/// once against the hidden temporary path, plus the region ledger that
/// negotiates exclusive slot ranges between readers.
///
/// Leaf datasets live under `entry_1/<group>/<key>` with an unlimited first
/// dimension, chunked by the configured chunk size. They are created lazily
/// on the first flush that carries the leaf; rows of records without it
/// keep the dataset fill value.
#[derive(Debug)]
pub struct SharedCxi {
    file: File,
    ledger: RegionLedger,
    datasets: Mutex<FxHashMap<String, Dataset>>,
    solo_written: Mutex<bool>,
    chunk_size: usize,
}

impl SharedCxi {
    pub fn create(path: &Path, chunk_size: usize) -> Result<Arc<Self>, WriterError> {
        let file = File::create(path)?;
        Ok(Arc::new(Self {
            file,
            ledger: RegionLedger::new(),
            datasets: Mutex::new(FxHashMap::default()),
            solo_written: Mutex::new(false),
            chunk_size,
        }))
    }

    /// Total record slots reserved so far across all readers.
    pub fn total_records(&self) -> Result<u64, WriterError> {
        Ok(self.ledger.total()?)
    }

    fn group_for(&self, name: &str) -> Result<Group, hdf5::Error> {
        let entry = match self.file.group(ENTRY_GROUP) {
            Ok(group) => group,
            Err(_) => self.file.create_group(ENTRY_GROUP)?,
        };
        match entry.group(name) {
            Ok(group) => Ok(group),
            Err(_) => entry.create_group(name),
        }
    }

    fn create_dataset(
        &self,
        group: &Group,
        key: &str,
        proto: &OutValue,
    ) -> Result<Dataset, hdf5::Error> {
        let chunk = self.chunk_size;
        match proto {
            OutValue::Float(_) => group
                .new_dataset::<f64>()
                .chunk(chunk)
                .shape(SimpleExtents::new([Extent::resizable(0)]))
                .fill_value(f64::NAN)
                .create(key),
            OutValue::Int(_) => group
                .new_dataset::<i64>()
                .chunk(chunk)
                .shape(SimpleExtents::new([Extent::resizable(0)]))
                .fill_value(-1i64)
                .create(key),
            OutValue::Array1(trace) => group
                .new_dataset::<f32>()
                .chunk((chunk, trace.len()))
                .shape(SimpleExtents::new([
                    Extent::resizable(0),
                    Extent::fixed(trace.len()),
                ]))
                .fill_value(f32::NAN)
                .create(key),
            OutValue::Array2(frame) => {
                let (rows, cols) = frame.dim();
                group
                    .new_dataset::<f32>()
                    .chunk((chunk, rows, cols))
                    .shape(SimpleExtents::new([
                        Extent::resizable(0),
                        Extent::fixed(rows),
                        Extent::fixed(cols),
                    ]))
                    .fill_value(f32::NAN)
                    .create(key)
            }
            OutValue::Bool2(mask) => {
                let (rows, cols) = mask.dim();
                group
                    .new_dataset::<bool>()
                    .chunk((chunk, rows, cols))
                    .shape(SimpleExtents::new([
                        Extent::resizable(0),
                        Extent::fixed(rows),
                        Extent::fixed(cols),
                    ]))
                    .fill_value(false)
                    .create(key)
            }
            OutValue::Mask(mask) => {
                let (rows, cols) = mask.dim();
                group
                    .new_dataset::<u16>()
                    .chunk((chunk, rows, cols))
                    .shape(SimpleExtents::new([
                        Extent::resizable(0),
                        Extent::fixed(rows),
                        Extent::fixed(cols),
                    ]))
                    .fill_value(0u16)
                    .create(key)
            }
        }
    }

    /// Write a buffered chunk into its reserved slot range.
    ///
    /// Called with a region the ledger handed out beforehand, so no other
    /// reader can touch these rows. Returns the payload size in bytes.
    fn write_region(
        &self,
        region: &Reservation,
        records: &[OutputRecord],
    ) -> Result<u64, WriterError> {
        let n = records.len();
        let start = region.start as usize;
        let end = region.end() as usize;

        // Union of the leaves present in this chunk, with a prototype value
        // fixing dtype and shape.
        let mut leaves: BTreeMap<(&str, &str), &OutValue> = BTreeMap::new();
        for record in records {
            for (group, key, value) in record.leaves() {
                leaves.entry((group, key)).or_insert(value);
            }
        }

        let mut datasets = self
            .datasets
            .lock()
            .map_err(|_| CommError::Poisoned)
            .map_err(WriterError::from)?;
        let mut bytes = 0u64;
        for ((group_name, key), proto) in leaves {
            let path = format!("{ENTRY_GROUP}/{group_name}/{key}");
            let dataset = match datasets.get(&path) {
                Some(dataset) => dataset.clone(),
                None => {
                    let group = self.group_for(group_name)?;
                    let dataset = self.create_dataset(&group, key, proto)?;
                    datasets.insert(path.clone(), dataset.clone());
                    dataset
                }
            };

            let mut shape = dataset.shape();
            if shape[0] < end {
                shape[0] = end;
                dataset.resize(shape.clone())?;
            }

            let mismatch = || WriterError::ShapeMismatch { path: path.clone() };
            match proto {
                OutValue::Float(_) => {
                    let mut stacked = Array1::<f64>::from_elem(n, f64::NAN);
                    for (i, record) in records.iter().enumerate() {
                        match record.get(group_name, key) {
                            Some(OutValue::Float(v)) => stacked[i] = *v,
                            Some(_) => return Err(mismatch()),
                            None => (),
                        }
                    }
                    dataset.write_slice(&stacked, s![start..end])?;
                    bytes += (n * 8) as u64;
                }
                OutValue::Int(_) => {
                    let mut stacked = Array1::<i64>::from_elem(n, -1);
                    for (i, record) in records.iter().enumerate() {
                        match record.get(group_name, key) {
                            Some(OutValue::Int(v)) => stacked[i] = *v,
                            Some(_) => return Err(mismatch()),
                            None => (),
                        }
                    }
                    dataset.write_slice(&stacked, s![start..end])?;
                    bytes += (n * 8) as u64;
                }
                OutValue::Array1(proto_trace) => {
                    let len = proto_trace.len();
                    if shape[1] != len {
                        return Err(mismatch());
                    }
                    let mut stacked = Array2::<f32>::from_elem((n, len), f32::NAN);
                    for (i, record) in records.iter().enumerate() {
                        match record.get(group_name, key) {
                            Some(OutValue::Array1(trace)) if trace.len() == len => {
                                stacked.slice_mut(s![i, ..]).assign(trace);
                            }
                            Some(_) => return Err(mismatch()),
                            None => (),
                        }
                    }
                    dataset.write_slice(&stacked, s![start..end, ..])?;
                    bytes += (n * len * 4) as u64;
                }
                OutValue::Array2(proto_frame) => {
                    let (rows, cols) = proto_frame.dim();
                    if shape[1] != rows || shape[2] != cols {
                        return Err(mismatch());
                    }
                    let mut stacked = Array3::<f32>::from_elem((n, rows, cols), f32::NAN);
                    for (i, record) in records.iter().enumerate() {
                        match record.get(group_name, key) {
                            Some(OutValue::Array2(frame)) if frame.dim() == (rows, cols) => {
                                stacked.slice_mut(s![i, .., ..]).assign(frame);
                            }
                            Some(_) => return Err(mismatch()),
                            None => (),
                        }
                    }
                    dataset.write_slice(&stacked, s![start..end, .., ..])?;
                    bytes += (n * rows * cols * 4) as u64;
                }
                OutValue::Bool2(proto_mask) => {
                    let (rows, cols) = proto_mask.dim();
                    if shape[1] != rows || shape[2] != cols {
                        return Err(mismatch());
                    }
                    let mut stacked = Array3::<bool>::from_elem((n, rows, cols), false);
                    for (i, record) in records.iter().enumerate() {
                        match record.get(group_name, key) {
                            Some(OutValue::Bool2(mask)) if mask.dim() == (rows, cols) => {
                                stacked.slice_mut(s![i, .., ..]).assign(mask);
                            }
                            Some(_) => return Err(mismatch()),
                            None => (),
                        }
                    }
                    dataset.write_slice(&stacked, s![start..end, .., ..])?;
                    bytes += (n * rows * cols) as u64;
                }
                OutValue::Mask(proto_mask) => {
                    let (rows, cols) = proto_mask.dim();
                    if shape[1] != rows || shape[2] != cols {
                        return Err(mismatch());
                    }
                    let mut stacked = Array3::<u16>::from_elem((n, rows, cols), 0);
                    for (i, record) in records.iter().enumerate() {
                        match record.get(group_name, key) {
                            Some(OutValue::Mask(mask)) if mask.dim() == (rows, cols) => {
                                stacked.slice_mut(s![i, .., ..]).assign(mask);
                            }
                            Some(_) => return Err(mismatch()),
                            None => (),
                        }
                    }
                    dataset.write_slice(&stacked, s![start..end, .., ..])?;
                    bytes += (n * rows * cols * 2) as u64;
                }
            }
        }
        Ok(bytes)
    }

    /// Write the dataset-wide solo artifacts, at most once per run.
    fn write_solo(&self, solo: &OutputRecord) -> Result<(), WriterError> {
        let mut written = self
            .solo_written
            .lock()
            .map_err(|_| CommError::Poisoned)
            .map_err(WriterError::from)?;
        if *written {
            return Err(WriterError::SoloAlreadyWritten);
        }
        *written = true;
        for (group_name, key, value) in solo.leaves() {
            let group = self.group_for(group_name)?;
            match value {
                OutValue::Float(v) => {
                    group.new_dataset_builder().with_data(&[*v]).create(key)?
                }
                OutValue::Int(v) => group.new_dataset_builder().with_data(&[*v]).create(key)?,
                OutValue::Array1(trace) => {
                    group.new_dataset_builder().with_data(trace).create(key)?
                }
                OutValue::Array2(frame) => {
                    group.new_dataset_builder().with_data(frame).create(key)?
                }
                OutValue::Bool2(mask) => {
                    group.new_dataset_builder().with_data(mask).create(key)?
                }
                OutValue::Mask(mask) => {
                    group.new_dataset_builder().with_data(mask).create(key)?
                }
            };
        }
        Ok(())
    }
}

/// One reader's handle on the shared output file.
///
/// Records buffer locally and flush as whole chunks into ledger-reserved
/// slot ranges, so per-reader record order is preserved while readers never
/// hold overlapping write regions. A flush failure is fatal to the whole
/// run: the communicator is aborted so every peer observes the outcome and
/// the temporary file is left in place, never published.
pub struct CxiWriter {
    shared: Arc<SharedCxi>,
    comm: Box<dyn Communicator>,
    buffer: Vec<OutputRecord>,
    records_written: u64,
}

impl CxiWriter {
    pub fn new(shared: Arc<SharedCxi>, comm: Box<dyn Communicator>) -> Self {
        Self {
            shared,
            comm,
            buffer: Vec::new(),
            records_written: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Append a record; flushes automatically at the chunk boundary.
    pub fn write_slice(&mut self, record: OutputRecord) -> Result<(), WriterError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.shared.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let region = self
            .shared
            .ledger
            .reserve(self.comm.rank(), self.buffer.len() as u64)?;
        match self.shared.write_region(&region, &self.buffer) {
            Ok(bytes) => {
                log::debug!(
                    "Reader {} flushed {} records ({}) into rows {}..{}",
                    self.comm.rank(),
                    region.len,
                    human_bytes::human_bytes(bytes as f64),
                    region.start,
                    region.end(),
                );
                self.records_written += region.len;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                // Peers must not keep writing once the file is suspect
                self.comm.abort();
                Err(e)
            }
        }
    }

    /// Write the solo record. Permitted only for the designated main
    /// reader and only once per run; anything else is a protocol misuse
    /// surfaced immediately.
    pub fn write_solo(&mut self, solo: &OutputRecord) -> Result<(), WriterError> {
        if self.comm.rank() != 0 {
            return Err(WriterError::SoloFromNonPrimary(self.comm.rank()));
        }
        self.shared.write_solo(solo)
    }

    /// Flush the remaining partial chunk and synchronize the close.
    ///
    /// All readers exchange their final record counts; with `barrier` set
    /// a second barrier then gates the finalize phase. Skipping the barrier
    /// is only sound when at most two cooperating readers exist, which the
    /// caller determines. Returns this reader's record count.
    pub fn close(mut self, barrier: bool) -> Result<u64, WriterError> {
        self.flush()?;
        let totals = self.comm.exchange_counts(self.records_written)?;
        if self.comm.rank() == 0 {
            log::info!(
                "{} records written by {} readers",
                totals.iter().sum::<u64>(),
                totals.len()
            );
        }
        if barrier {
            self.comm.barrier()?;
        }
        Ok(self.records_written)
    }

    /// Poison the run's collectives after a fatal error outside the writer.
    pub fn abort(&self) {
        self.comm.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use ndarray::Array2;
    use std::path::PathBuf;
    use std::thread;

    fn scratch_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cxi_reducer_{}_{}.h5", name, std::process::id()))
    }

    fn record(index: i64) -> OutputRecord {
        let mut rec = OutputRecord::new();
        rec.insert("event", "bunch_id", OutValue::Int(index));
        rec.insert("result_1", "hitscore_litpixel", OutValue::Float(index as f64 * 2.0));
        rec.insert(
            "detector_1",
            "data",
            OutValue::Array2(Array2::from_elem((4, 4), index as f32)),
        );
        rec
    }

    #[test]
    fn test_write_and_read_back() {
        let path = scratch_file("roundtrip");
        {
            let shared = SharedCxi::create(&path, 2).unwrap();
            let mut handles = LocalComm::create(1);
            let mut writer = CxiWriter::new(shared, Box::new(handles.remove(0)));
            for i in 0..3 {
                writer.write_slice(record(i)).unwrap();
            }
            assert_eq!(writer.close(false).unwrap(), 3);
        }
        let file = File::open(&path).unwrap();
        let ids = file.dataset("entry_1/event/bunch_id").unwrap();
        assert_eq!(ids.read_1d::<i64>().unwrap().to_vec(), vec![0, 1, 2]);
        let frames = file.dataset("entry_1/detector_1/data").unwrap();
        assert_eq!(frames.shape(), vec![3, 4, 4]);
        let scores = file.dataset("entry_1/result_1/hitscore_litpixel").unwrap();
        assert_eq!(scores.read_1d::<f64>().unwrap().to_vec(), vec![0.0, 2.0, 4.0]);
        drop(file);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_leaf_leaves_fill() {
        let path = scratch_file("fill");
        {
            let shared = SharedCxi::create(&path, 4).unwrap();
            let mut handles = LocalComm::create(1);
            let mut writer = CxiWriter::new(shared, Box::new(handles.remove(0)));
            writer.write_slice(record(0)).unwrap();
            let mut sparse = OutputRecord::new();
            sparse.insert("event", "bunch_id", OutValue::Int(1));
            writer.write_slice(sparse).unwrap();
            writer.close(false).unwrap();
        }
        let file = File::open(&path).unwrap();
        let scores = file
            .dataset("entry_1/result_1/hitscore_litpixel")
            .unwrap()
            .read_1d::<f64>()
            .unwrap();
        assert_eq!(scores[0], 0.0);
        assert!(scores[1].is_nan());
        drop(file);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_two_readers_interleave_without_overlap() {
        let path = scratch_file("parallel");
        {
            let shared = SharedCxi::create(&path, 2).unwrap();
            let handles = LocalComm::create(2);
            let mut threads = Vec::new();
            for comm in handles {
                let shared = shared.clone();
                threads.push(thread::spawn(move || {
                    let rank = comm.rank() as i64;
                    let mut writer = CxiWriter::new(shared, Box::new(comm));
                    for i in 0..5 {
                        writer.write_slice(record(rank + 2 * i)).unwrap();
                    }
                    writer.close(true).unwrap()
                }));
            }
            for t in threads {
                assert_eq!(t.join().unwrap(), 5);
            }
        }
        let file = File::open(&path).unwrap();
        let ids = file
            .dataset("entry_1/event/bunch_id")
            .unwrap()
            .read_1d::<i64>()
            .unwrap();
        assert_eq!(ids.len(), 10);
        // Per-reader relative order is preserved even though the global
        // interleaving is unspecified
        for rank in 0..2i64 {
            let owned: Vec<i64> = ids.iter().cloned().filter(|v| v % 2 == rank).collect();
            let mut sorted = owned.clone();
            sorted.sort_unstable();
            assert_eq!(owned, sorted);
            assert_eq!(owned.len(), 5);
        }
        drop(file);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_solo_protocol_misuse() {
        let path = scratch_file("solo");
        {
            let shared = SharedCxi::create(&path, 2).unwrap();
            let mut handles = LocalComm::create(2);
            let main = handles.remove(0);
            let other = handles.remove(0);
            let mut solo = OutputRecord::new();
            solo.insert(
                "detector_1",
                "mask",
                OutValue::Mask(Array2::from_elem((2, 2), 512u16)),
            );

            let mut secondary = CxiWriter::new(shared.clone(), Box::new(other));
            assert!(matches!(
                secondary.write_solo(&solo),
                Err(WriterError::SoloFromNonPrimary(1))
            ));

            let mut primary = CxiWriter::new(shared, Box::new(main));
            primary.write_solo(&solo).unwrap();
            assert!(matches!(
                primary.write_solo(&solo),
                Err(WriterError::SoloAlreadyWritten)
            ));
        }
        let file = File::open(&path).unwrap();
        let mask = file
            .dataset("entry_1/detector_1/mask")
            .unwrap()
            .read_2d::<u16>()
            .unwrap();
        assert_eq!(mask[[0, 0]], 512);
        drop(file);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_close_flushes_partial_chunk() {
        let path = scratch_file("partial");
        {
            // Chunk size larger than the record count: everything rides on
            // the final flush inside close
            let shared = SharedCxi::create(&path, 100).unwrap();
            let mut handles = LocalComm::create(1);
            let mut writer = CxiWriter::new(shared, Box::new(handles.remove(0)));
            writer.write_slice(record(7)).unwrap();
            assert_eq!(writer.close(false).unwrap(), 1);
        }
        let file = File::open(&path).unwrap();
        let ids = file
            .dataset("entry_1/event/bunch_id")
            .unwrap()
            .read_1d::<i64>()
            .unwrap();
        assert_eq!(ids.to_vec(), vec![7]);
        drop(file);
        let _ = std::fs::remove_file(&path);
    }
}
