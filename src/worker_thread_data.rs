use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use rust_htslib::bam;
use simple_error::{SimpleResult, try_with};

/// For worker threads making indexed bam reads, this provides a persistent worker specific reader
/// for the alignment file being split
pub struct BamReaderWorkerThreadData {
    pub bam_reader: bam::IndexedReader,
}

impl BamReaderWorkerThreadData {
    pub fn new(bam_filename: &Utf8Path) -> SimpleResult<Self> {
        let bam_reader = try_with!(
            bam::IndexedReader::from_path(bam_filename),
            "Failed to open indexed alignment file: '{bam_filename}'"
        );
        Ok(Self { bam_reader })
    }
}

pub type BamReaderWorkerThreadDataSet = Arc<Vec<Mutex<BamReaderWorkerThreadData>>>;

pub fn get_bam_reader_worker_thread_data(
    bam_filename: &Utf8Path,
    thread_count: usize,
) -> SimpleResult<BamReaderWorkerThreadDataSet> {
    assert!(thread_count > 0);
    let mut worker_thread_data = Vec::new();
    for _ in 0..thread_count {
        worker_thread_data.push(Mutex::new(BamReaderWorkerThreadData::new(bam_filename)?));
    }
    Ok(Arc::new(worker_thread_data))
}
