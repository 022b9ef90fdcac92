//! Concatenate the filtered windows of one sample into a single alignment file
//!

use camino::Utf8Path;
use log::{debug, info};
use rust_htslib::bam::{self, Read};
use simple_error::{SimpleResult, try_with};
use thousands::Separable;

use crate::bam_utils::{create_bam_writer, open_bam_reader};
use crate::errors::{PipelineError, PipelineResult, PipelineStage};
use crate::os_utils::remove_file_if_present;
use crate::sample_manifest::{CompletedWindow, SampleManifest};

pub struct MergeResult {
    pub window_count: usize,
    pub record_count: usize,
}

fn merge_error(err: simple_error::SimpleError) -> PipelineError {
    PipelineError::tool(PipelineStage::Merge, None, err)
}

/// Append all records of one window, returning the number of records copied
///
fn append_window(
    writer: &mut bam::Writer,
    window: &CompletedWindow,
    thread_count: usize,
) -> SimpleResult<usize> {
    let mut reader = open_bam_reader(&window.filename, thread_count)?;
    let mut record_count = 0;
    let mut record = bam::Record::new();
    while let Some(r) = reader.read(&mut record) {
        try_with!(
            r,
            "Failed to parse alignment record from '{}'",
            window.filename
        );
        try_with!(writer.write(&record), "Failed to write merged record");
        record_count += 1;
    }
    Ok(record_count)
}

/// Merge all filtered windows recorded in the manifest into `output_file`
///
/// All windows must be complete, and each filtered window file must hold exactly the record
/// count recorded when it was completed. Otherwise the merge fails before any intermediate file
/// is removed, and any partial `output_file` is deleted.
///
/// Windows are concatenated in window index order. The split directory is removed after a
/// successful merge.
///
pub fn merge_sample_windows(
    manifest: SampleManifest,
    header: &bam::Header,
    output_file: &Utf8Path,
    thread_count: usize,
) -> PipelineResult<MergeResult> {
    let split_dir = manifest.split_dir().to_owned();
    let completed_windows = manifest
        .into_completed_windows()
        .map_err(|e| PipelineError::PartialData(e.as_str().to_string()))?;

    for (window_index, window) in completed_windows.iter() {
        if !window.filename.is_file() {
            return Err(PipelineError::PartialData(format!(
                "Filtered file for window {window_index} is missing: '{}'",
                window.filename
            )));
        }
    }

    let mut writer = create_bam_writer(output_file, header, thread_count).map_err(merge_error)?;
    let mut record_count = 0;
    for (window_index, window) in completed_windows.iter() {
        let window_record_count = match append_window(&mut writer, window, thread_count) {
            Ok(x) => x,
            Err(e) => {
                drop(writer);
                remove_file_if_present(output_file).map_err(merge_error)?;
                return Err(merge_error(e));
            }
        };
        if window_record_count != window.record_count {
            drop(writer);
            remove_file_if_present(output_file).map_err(merge_error)?;
            return Err(PipelineError::PartialData(format!(
                "Filtered file for window {window_index} has {window_record_count} records, but {} records were recorded on completion: '{}'",
                window.record_count, window.filename
            )));
        }
        record_count += window_record_count;
    }
    drop(writer);

    info!(
        "Merged {} records from {} windows into '{output_file}'",
        record_count.separate_with_commas(),
        completed_windows.len()
    );

    debug!("Removing window directory '{split_dir}'");
    std::fs::remove_dir_all(&split_dir).map_err(|e| {
        PipelineError::ToolInvocation {
            stage: PipelineStage::Merge,
            window_index: None,
            message: format!("Can't remove window directory '{split_dir}': {e}"),
        }
    })?;

    Ok(MergeResult {
        window_count: completed_windows.len(),
        record_count,
    })
}
