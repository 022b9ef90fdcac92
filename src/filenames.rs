//! Output filename conventions for each sample and for the whole run
//!

use camino::{Utf8Path, Utf8PathBuf};

pub const RUN_STATS_FILENAME: &str = "run.stats.json";

pub const CLEANED_SUFFIX: &str = "_cleaned";

/// Get the input filename stem used to name all output files for one sample
///
/// "/foo/bar/sample1.bam" -> "sample1"
///
pub fn get_sample_stem(input_file: &Utf8Path) -> String {
    match input_file.file_name() {
        Some(name) => match name.strip_suffix(".bam") {
            Some(stem) => stem.to_string(),
            None => input_file.file_stem().unwrap_or(name).to_string(),
        },
        None => "sample".to_string(),
    }
}

/// Final cleaned alignment file for one sample
pub fn get_cleaned_filename(output_dir: &Utf8Path, sample_stem: &str) -> Utf8PathBuf {
    output_dir.join(format!("{sample_stem}{CLEANED_SUFFIX}.bam"))
}

/// Tagged intermediate written when the sample is processed as a single window
pub fn get_unsplit_tagged_filename(output_dir: &Utf8Path, sample_stem: &str) -> Utf8PathBuf {
    output_dir.join(format!("{sample_stem}_tagged.bam"))
}

/// Filtered intermediate written when the sample is processed as a single window, renamed to
/// the cleaned file once complete
pub fn get_unsplit_filtered_filename(output_dir: &Utf8Path, sample_stem: &str) -> Utf8PathBuf {
    output_dir.join(format!("{sample_stem}_filtered.bam"))
}

/// Directory holding all per-window intermediates of one sample
pub fn get_split_dir(output_dir: &Utf8Path, sample_stem: &str, window_size: u64) -> Utf8PathBuf {
    output_dir.join(format!("{sample_stem}_{window_size}bp_windows"))
}

pub fn get_window_filename(split_dir: &Utf8Path, window_index: usize) -> Utf8PathBuf {
    split_dir.join(format!("window_{window_index:07}.bam"))
}

pub fn get_window_tagged_filename(split_dir: &Utf8Path, window_index: usize) -> Utf8PathBuf {
    split_dir.join(format!("window_{window_index:07}.tagged.bam"))
}

pub fn get_window_filtered_filename(split_dir: &Utf8Path, window_index: usize) -> Utf8PathBuf {
    split_dir.join(format!("window_{window_index:07}.filtered.bam"))
}

/// Coverage report written next to the cleaned alignment file
pub fn get_coverage_report_filename(cleaned_file: &Utf8Path) -> Utf8PathBuf {
    cleaned_file.with_extension("coverage.json")
}
