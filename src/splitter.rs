//! Partition one coordinate-sorted, indexed alignment file into fixed-width genomic windows
//!
//! Each chromosome is divided into windows of `window_size` bases, numbered in chromosome-major
//! order across the whole file, with one final window for reads without a chromosome. Every
//! record is written to the single window containing its alignment locus, so all reads which
//! could share a UMI group are always found in the same window.
//!
//! Chromosomes are split in parallel by segment, where each segment covers a whole number of
//! windows.
//!

use std::collections::BTreeMap;
use std::sync::mpsc::channel;

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info};
use rust_htslib::bam::{self, Read};
use simple_error::{SimpleResult, bail, try_with};
use thousands::Separable;

use crate::bam_utils::{AlignmentLocus, create_bam_writer, get_alignment_locus};
use crate::chrom_list::ChromList;
use crate::filenames::get_window_filename;
use crate::worker_thread_data::{BamReaderWorkerThreadDataSet, get_bam_reader_worker_thread_data};

const MIB: u64 = 1024 * 1024;

/// Approximate size of the chromosome segment split by a single worker thread
const TARGET_SEGMENT_SIZE: u64 = 1_000_000;

/// One row of the size policy table
///
/// Files up to `max_file_size` bytes are split into windows of `window_size` bases. A
/// `window_size` of zero means the file is not split. A `max_file_size` of None matches any size.
///
pub struct SizePolicyTier {
    pub max_file_size: Option<u64>,
    pub window_size: u64,
}

/// Select the window size from the input file size
///
/// The default table caps windows at 100 bases for all files over 1000 MiB, so the window count
/// of very large inputs grows with the genome size rather than the file size.
///
pub struct SizePolicy {
    tiers: Vec<SizePolicyTier>,
}

impl Default for SizePolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                SizePolicyTier {
                    max_file_size: Some(500 * MIB),
                    window_size: 0,
                },
                SizePolicyTier {
                    max_file_size: Some(1000 * MIB),
                    window_size: 250,
                },
                SizePolicyTier {
                    max_file_size: Some(10000 * MIB),
                    window_size: 100,
                },
                SizePolicyTier {
                    max_file_size: None,
                    window_size: 100,
                },
            ],
        }
    }
}

impl SizePolicy {
    /// Tiers must be ordered by increasing `max_file_size`
    pub fn new(tiers: Vec<SizePolicyTier>) -> Self {
        Self { tiers }
    }

    pub fn get_window_size(&self, file_size: u64) -> u64 {
        for tier in self.tiers.iter() {
            match tier.max_file_size {
                Some(max_file_size) if file_size > max_file_size => continue,
                _ => return tier.window_size,
            }
        }
        self.tiers.last().map(|x| x.window_size).unwrap_or(0)
    }

    pub fn get_file_window_size(&self, filename: &Utf8Path) -> SimpleResult<u64> {
        let metadata = try_with!(
            std::fs::metadata(filename),
            "Can't read file size of alignment file: '{filename}'"
        );
        Ok(self.get_window_size(metadata.len()))
    }
}

/// Map from alignment locus to global window index for one alignment file
///
pub struct WindowLayout {
    window_size: u64,

    /// Index of the first window of each chromosome
    chrom_window_offsets: Vec<usize>,

    /// Number of windows on each chromosome
    chrom_window_counts: Vec<usize>,

    /// Window holding all reads without a chromosome, always the last window
    pub unplaced_window_index: usize,
}

impl WindowLayout {
    pub fn new(chrom_list: &ChromList, window_size: u64) -> Self {
        assert!(window_size > 0);
        let mut chrom_window_offsets = Vec::new();
        let mut chrom_window_counts = Vec::new();
        let mut offset = 0;
        for chrom_info in chrom_list.data.iter() {
            let count = std::cmp::max(chrom_info.length.div_ceil(window_size), 1) as usize;
            chrom_window_offsets.push(offset);
            chrom_window_counts.push(count);
            offset += count;
        }
        Self {
            window_size,
            chrom_window_offsets,
            chrom_window_counts,
            unplaced_window_index: offset,
        }
    }

    pub fn window_count(&self) -> usize {
        self.unplaced_window_index + 1
    }

    /// Positions past the chromosome end are assigned to the chromosome's last window
    pub fn get_window_index(&self, locus: Option<AlignmentLocus>) -> usize {
        match locus {
            Some(locus) => {
                let chrom_window = std::cmp::min(
                    std::cmp::max(locus.pos, 0) as u64 / self.window_size,
                    self.chrom_window_counts[locus.chrom_index] as u64 - 1,
                );
                self.chrom_window_offsets[locus.chrom_index] + chrom_window as usize
            }
            None => self.unplaced_window_index,
        }
    }
}

/// One non-empty window written by the splitter
#[derive(Clone, Debug)]
pub struct Window {
    pub index: usize,
    pub filename: Utf8PathBuf,
    pub record_count: usize,
}

pub struct SplitResult {
    pub window_size: u64,

    /// All non-empty windows in index order
    pub windows: Vec<Window>,

    pub record_count: usize,
}

/// A range of one chromosome, or all reads without a chromosome, split by one worker thread
#[derive(Clone, Copy)]
struct SplitSegment {
    chrom_index: Option<usize>,
    begin: i64,
    end: i64,
}

/// Divide a region of `size` into segments of `segment_size`, the last segment may be shorter
///
fn get_region_segments(size: u64, segment_size: u64) -> Vec<(u64, u64)> {
    assert!(segment_size > 0);
    (0..size)
        .step_by(segment_size as usize)
        .map(|begin| (begin, std::cmp::min(begin + segment_size, size)))
        .collect()
}

/// Get the segment size closest to the target size which is a multiple of the window size
///
fn get_segment_size(window_size: u64) -> u64 {
    std::cmp::max(TARGET_SEGMENT_SIZE / window_size, 1) * window_size
}

fn get_split_segments(chrom_list: &ChromList, segment_size: u64) -> Vec<SplitSegment> {
    let mut segments = Vec::new();
    for (chrom_index, chrom_info) in chrom_list.data.iter().enumerate() {
        for (begin, end) in get_region_segments(chrom_info.length, segment_size) {
            segments.push(SplitSegment {
                chrom_index: Some(chrom_index),
                begin: begin as i64,
                end: end as i64,
            });
        }
    }
    segments.push(SplitSegment {
        chrom_index: None,
        begin: 0,
        end: 0,
    });
    segments
}

fn write_window_file(
    split_dir: &Utf8Path,
    header: &bam::Header,
    window_index: usize,
    records: Vec<bam::Record>,
) -> SimpleResult<Window> {
    let filename = get_window_filename(split_dir, window_index);
    let mut writer = create_bam_writer(&filename, header, 1)?;
    for record in records.iter() {
        try_with!(
            writer.write(record),
            "Failed to write record to window file '{filename}'"
        );
    }
    Ok(Window {
        index: window_index,
        filename,
        record_count: records.len(),
    })
}

/// Write every record whose locus falls in the segment to its window file
///
/// Records are buffered by window. A window is written as soon as the read stream starts past
/// its end, because a read's locus is never before its start position.
///
fn split_segment(
    bam_reader: &mut bam::IndexedReader,
    layout: &WindowLayout,
    split_dir: &Utf8Path,
    segment: SplitSegment,
) -> SimpleResult<Vec<Window>> {
    let fetch_definition = match segment.chrom_index {
        Some(chrom_index) => {
            bam::FetchDefinition::Region(chrom_index as i32, segment.begin, segment.end)
        }
        None => bam::FetchDefinition::Unmapped,
    };
    try_with!(
        bam_reader.fetch(fetch_definition),
        "Failed to fetch split segment from alignment file"
    );
    let header = bam::Header::from_template(bam_reader.header());

    let mut pending_windows: BTreeMap<usize, Vec<bam::Record>> = BTreeMap::new();
    let mut windows = Vec::new();
    for result in bam_reader.records() {
        let record = try_with!(result, "Failed to parse alignment record");
        let locus = get_alignment_locus(&record);
        if let Some(locus) = locus {
            // Reads overlapping the segment with a locus outside of it belong to a neighboring
            // segment
            if segment.chrom_index.is_none()
                || locus.pos < segment.begin
                || locus.pos >= segment.end
            {
                continue;
            }

            let first_open_window = layout.get_window_index(Some(AlignmentLocus {
                chrom_index: locus.chrom_index,
                pos: record.pos(),
            }));
            let open_windows = pending_windows.split_off(&first_open_window);
            for (window_index, records) in std::mem::replace(&mut pending_windows, open_windows) {
                windows.push(write_window_file(split_dir, &header, window_index, records)?);
            }
        } else if segment.chrom_index.is_some() {
            continue;
        }

        pending_windows
            .entry(layout.get_window_index(locus))
            .or_default()
            .push(record);
    }

    for (window_index, records) in pending_windows {
        windows.push(write_window_file(split_dir, &header, window_index, records)?);
    }
    Ok(windows)
}

/// Total record count from the alignment file index
///
fn get_indexed_record_count(bam_reader: &mut bam::IndexedReader) -> SimpleResult<usize> {
    let index_stats = try_with!(
        bam_reader.index_stats(),
        "Failed to read record counts from alignment file index"
    );
    Ok(index_stats
        .iter()
        .map(|(_, _, mapped, unmapped)| (mapped + unmapped) as usize)
        .sum())
}

/// Check that an index can be found for the alignment file
///
pub fn check_alignment_index(filename: &Utf8Path) -> SimpleResult<()> {
    if let Err(e) = bam::IndexedReader::from_path(filename) {
        bail!("Splitting requires an indexed alignment file, can't open index for '{filename}': {e}");
    }
    Ok(())
}

fn split_alignment_file_segments(
    worker_pool: &rayon::ThreadPool,
    worker_thread_dataset: BamReaderWorkerThreadDataSet,
    layout: &WindowLayout,
    split_dir: &Utf8Path,
    segments: Vec<SplitSegment>,
) -> SimpleResult<Vec<Window>> {
    let (tx, rx) = channel();

    worker_pool.scope(move |scope| {
        for segment in segments {
            let worker_thread_dataset = worker_thread_dataset.clone();
            let tx = tx.clone();

            scope.spawn(move |_| {
                let worker_id = rayon::current_thread_index().unwrap();
                let bam_reader = &mut worker_thread_dataset[worker_id].lock().unwrap().bam_reader;
                let result = split_segment(bam_reader, layout, split_dir, segment);
                tx.send(result).unwrap();
            });
        }
    });

    let mut windows = Vec::new();
    for result in rx {
        windows.extend(result?);
    }
    windows.sort_by_key(|x| x.index);
    Ok(windows)
}

fn split_alignment_file_impl(
    worker_pool: &rayon::ThreadPool,
    input_file: &Utf8Path,
    split_dir: &Utf8Path,
    chrom_list: &ChromList,
    window_size: u64,
    segment_size: u64,
) -> SimpleResult<SplitResult> {
    assert!(window_size > 0);
    assert_eq!(segment_size % window_size, 0);

    let worker_thread_dataset =
        get_bam_reader_worker_thread_data(input_file, worker_pool.current_num_threads())?;
    let expected_record_count =
        get_indexed_record_count(&mut worker_thread_dataset[0].lock().unwrap().bam_reader)?;

    let layout = WindowLayout::new(chrom_list, window_size);
    let segments = get_split_segments(chrom_list, segment_size);
    debug!(
        "Splitting '{input_file}' into up to {} windows over {} segments",
        layout.window_count().separate_with_commas(),
        segments.len()
    );

    let windows =
        split_alignment_file_segments(worker_pool, worker_thread_dataset, &layout, split_dir, segments)?;

    let record_count = windows.iter().map(|x| x.record_count).sum::<usize>();
    if record_count != expected_record_count {
        bail!(
            "Split windows hold {record_count} records but the alignment file index reports {expected_record_count} records for '{input_file}'"
        );
    }

    info!(
        "Split {} records from '{input_file}' into {} non-empty {window_size} bp windows",
        record_count.separate_with_commas(),
        windows.len().separate_with_commas()
    );

    Ok(SplitResult {
        window_size,
        windows,
        record_count,
    })
}

/// Split `input_file` into window files written under `split_dir`
///
/// Only non-empty windows produce a file. The total record count across all windows is checked
/// against the record count reported by the alignment file index.
///
pub fn split_alignment_file(
    worker_pool: &rayon::ThreadPool,
    input_file: &Utf8Path,
    split_dir: &Utf8Path,
    chrom_list: &ChromList,
    window_size: u64,
) -> SimpleResult<SplitResult> {
    split_alignment_file_impl(
        worker_pool,
        input_file,
        split_dir,
        chrom_list,
        window_size,
        get_segment_size(window_size),
    )
}
