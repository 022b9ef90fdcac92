//! Coordinate sort and index a cleaned alignment file in place
//!
//! Records are sorted in memory up to a fixed memory limit. Larger files are sorted as a series
//! of chunks spilled to disk, which are then merged.
//!

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use rust_htslib::bam::{self, Read};
use simple_error::{SimpleResult, try_with};
use thousands::Separable;

use crate::bam_utils::{create_bam_writer, open_bam_reader};
use crate::os_utils::{create_dir_all, remove_file_if_present};

/// Samtools describes this value as "Set minimum interval size for CSI indices to 2^INT [14]"
const CSI_MIN_INTERVAL_POW2: u32 = 14;

/// Approximate memory used for records held in memory before a sorted chunk is spilled to disk
const DEFAULT_SORT_MEMORY_LIMIT: usize = 512 * 1024 * 1024;

/// Chromosome and position sort key, with reads lacking a chromosome last
type RecordSortKey = (bool, i32, i64);

fn get_record_sort_key(record: &bam::Record) -> RecordSortKey {
    (record.tid() < 0, record.tid(), record.pos())
}

fn compare_record_position(a: &bam::Record, b: &bam::Record) -> Ordering {
    get_record_sort_key(a).cmp(&get_record_sort_key(b))
}

/// Estimate memory used by one record held for sorting
fn estimate_record_size(record: &bam::Record) -> usize {
    std::mem::size_of::<bam::Record>()
        + record.qname().len()
        + record.seq_len() * 2
        + record.cigar_len() * 4
        + 256
}

fn get_sort_temp_filename(filename: &Utf8Path) -> Utf8PathBuf {
    let name = filename.file_name().unwrap_or("sort");
    filename.with_file_name(format!(".{name}.sorting.tmp.bam"))
}

fn get_sort_chunk_dir(filename: &Utf8Path) -> Utf8PathBuf {
    let name = filename.file_name().unwrap_or("sort");
    filename.with_file_name(format!(".{name}.sort_chunks"))
}

fn get_sort_chunk_filename(chunk_dir: &Utf8Path, chunk_index: usize) -> Utf8PathBuf {
    chunk_dir.join(format!("chunk_{chunk_index:05}.bam"))
}

/// Stable sort `records` and write them to `filename`
///
fn write_sorted_records(
    records: &mut [bam::Record],
    header: &bam::Header,
    filename: &Utf8Path,
    thread_count: usize,
) -> SimpleResult<()> {
    records.sort_by(compare_record_position);

    let mut writer = create_bam_writer(filename, header, thread_count)?;
    for record in records.iter() {
        try_with!(
            writer.write(record),
            "Failed to write sorted record to '{filename}'"
        );
    }
    Ok(())
}

struct SortChunkReader {
    reader: bam::Reader,
    chunk_index: usize,
}

impl SortChunkReader {
    fn next_record(&mut self) -> SimpleResult<Option<bam::Record>> {
        let mut record = bam::Record::new();
        match self.reader.read(&mut record) {
            Some(result) => {
                try_with!(
                    result,
                    "Failed to parse record from sort chunk {}",
                    self.chunk_index
                );
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

/// Head record of one sorted chunk during the merge
///
/// Ties are broken by chunk index. Chunks hold consecutive runs of the input, so this keeps
/// records with the same position in input order.
///
struct MergeEntry {
    key: RecordSortKey,
    chunk_index: usize,
    record: bam::Record,
}

impl MergeEntry {
    fn new(record: bam::Record, chunk_index: usize) -> Self {
        Self {
            key: get_record_sort_key(&record),
            chunk_index,
            record,
        }
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.chunk_index.cmp(&other.chunk_index))
    }
}

/// K-way merge of sorted chunk files into `output_filename`
///
fn merge_sorted_chunks(
    chunk_filenames: &[Utf8PathBuf],
    header: &bam::Header,
    output_filename: &Utf8Path,
    thread_count: usize,
) -> SimpleResult<()> {
    let mut chunk_readers = chunk_filenames
        .iter()
        .enumerate()
        .map(|(chunk_index, filename)| {
            Ok(SortChunkReader {
                reader: open_bam_reader(filename, 1)?,
                chunk_index,
            })
        })
        .collect::<SimpleResult<Vec<_>>>()?;

    let mut heap = BinaryHeap::with_capacity(chunk_readers.len());
    for chunk_reader in chunk_readers.iter_mut() {
        if let Some(record) = chunk_reader.next_record()? {
            heap.push(Reverse(MergeEntry::new(record, chunk_reader.chunk_index)));
        }
    }

    let mut writer = create_bam_writer(output_filename, header, thread_count)?;
    while let Some(Reverse(entry)) = heap.pop() {
        try_with!(
            writer.write(&entry.record),
            "Failed to write sorted record to '{output_filename}'"
        );
        let chunk_reader = &mut chunk_readers[entry.chunk_index];
        if let Some(record) = chunk_reader.next_record()? {
            heap.push(Reverse(MergeEntry::new(record, chunk_reader.chunk_index)));
        }
    }
    Ok(())
}

/// Write all records of `filename` sorted to `temp_filename`
///
/// Returns the record count and the number of chunks spilled to `chunk_dir`
///
fn sort_to_file(
    filename: &Utf8Path,
    temp_filename: &Utf8Path,
    chunk_dir: &Utf8Path,
    thread_count: usize,
    memory_limit: usize,
) -> SimpleResult<(usize, usize)> {
    let mut reader = open_bam_reader(filename, thread_count)?;
    let header = bam::Header::from_template(reader.header());

    let mut chunk_filenames = Vec::new();
    let mut records = Vec::new();
    let mut memory_used = 0;
    let mut record_count = 0;
    for result in reader.records() {
        let record = try_with!(result, "Failed to parse alignment record from '{filename}'");
        record_count += 1;
        memory_used += estimate_record_size(&record);
        records.push(record);

        if memory_used >= memory_limit {
            if chunk_filenames.is_empty() {
                create_dir_all(chunk_dir, "sort chunk")?;
            }
            let chunk_filename = get_sort_chunk_filename(chunk_dir, chunk_filenames.len());
            write_sorted_records(&mut records, &header, &chunk_filename, 1)?;
            chunk_filenames.push(chunk_filename);
            records.clear();
            memory_used = 0;
        }
    }

    if chunk_filenames.is_empty() {
        write_sorted_records(&mut records, &header, temp_filename, thread_count)?;
    } else {
        if !records.is_empty() {
            let chunk_filename = get_sort_chunk_filename(chunk_dir, chunk_filenames.len());
            write_sorted_records(&mut records, &header, &chunk_filename, 1)?;
            chunk_filenames.push(chunk_filename);
        }
        merge_sorted_chunks(&chunk_filenames, &header, temp_filename, thread_count)?;
    }
    Ok((record_count, chunk_filenames.len()))
}

fn remove_sort_chunk_dir(chunk_dir: &Utf8Path) -> SimpleResult<()> {
    if chunk_dir.exists() {
        try_with!(
            std::fs::remove_dir_all(chunk_dir),
            "Can't remove sort chunk directory '{chunk_dir}'"
        );
    }
    Ok(())
}

fn sort_and_index_impl(
    filename: &Utf8Path,
    thread_count: usize,
    memory_limit: usize,
) -> SimpleResult<()> {
    let temp_filename = get_sort_temp_filename(filename);
    let chunk_dir = get_sort_chunk_dir(filename);

    let sort_result = sort_to_file(
        filename,
        &temp_filename,
        &chunk_dir,
        thread_count,
        memory_limit,
    )
    .and_then(|x| {
        try_with!(
            std::fs::rename(&temp_filename, filename),
            "Failed to replace '{filename}' with sorted file '{temp_filename}'"
        );
        Ok(x)
    });
    remove_sort_chunk_dir(&chunk_dir)?;
    let (record_count, chunk_count) = match sort_result {
        Ok(x) => x,
        Err(e) => {
            remove_file_if_present(&temp_filename)?;
            return Err(e);
        }
    };
    debug!(
        "Sorted {} records in '{filename}' from {chunk_count} spilled chunks",
        record_count.separate_with_commas()
    );

    try_with!(
        bam::index::build(
            filename,
            None,
            bam::index::Type::Csi(CSI_MIN_INTERVAL_POW2),
            thread_count as u32,
        ),
        "Failed to build index for alignment file '{filename}'"
    );
    debug!("Finished building index for alignment file '{filename}'");
    Ok(())
}

/// Sort `filename` by coordinate and build a CSI index for it
///
/// Records with the same position keep their input order. Sorted output is written to a
/// temporary file next to `filename`, which then replaces the original, so `filename` always
/// refers to a complete file. On any failure the temporary file is removed and the unsorted file
/// is left in place.
///
pub fn sort_and_index(filename: &Utf8Path, thread_count: usize) -> SimpleResult<()> {
    sort_and_index_impl(filename, thread_count, DEFAULT_SORT_MEMORY_LIMIT)
}
