//! Compare per-chromosome coverage between an original and a cleaned alignment file
//!

use std::fs::File;

use camino::Utf8Path;
use log::info;
use rust_htslib::bam::{self, Read, record::Cigar};
use serde::{Deserialize, Serialize};
use simple_error::{SimpleResult, try_with};

use crate::bam_utils::open_bam_reader;
use crate::chrom_list::ChromList;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FileCoverage {
    pub mapped_record_count: usize,
    pub aligned_bases: u64,
    pub mean_depth: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChromCoverage {
    pub label: String,
    pub length: u64,
    pub original: FileCoverage,
    pub cleaned: FileCoverage,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CoverageReport {
    pub original_file: String,
    pub cleaned_file: String,
    pub chroms: Vec<ChromCoverage>,
    pub original_total: FileCoverage,
    pub cleaned_total: FileCoverage,

    pub original_record_count: usize,
    pub cleaned_record_count: usize,

    /// Fraction of original records found in the cleaned file
    pub retained_fraction: f64,
}

/// Reference bases covered by the alignment
fn get_aligned_bases(record: &bam::Record) -> u64 {
    record
        .cigar()
        .iter()
        .map(|c| match c {
            Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => *len as u64,
            _ => 0,
        })
        .sum()
}

fn update_mean_depth(coverage: &mut FileCoverage, length: u64) {
    coverage.mean_depth = if length > 0 {
        coverage.aligned_bases as f64 / length as f64
    } else {
        0.0
    };
}

/// Per-chromosome coverage of one file, and the file's total record count
///
fn get_file_coverage(
    filename: &Utf8Path,
    chrom_list: &ChromList,
    thread_count: usize,
) -> SimpleResult<(Vec<FileCoverage>, usize)> {
    let mut reader = open_bam_reader(filename, thread_count)?;
    let mut chrom_coverage = vec![FileCoverage::default(); chrom_list.data.len()];
    let mut record_count = 0;
    let mut record = bam::Record::new();
    while let Some(r) = reader.read(&mut record) {
        try_with!(r, "Failed to parse alignment record from '{filename}'");
        record_count += 1;
        if record.is_unmapped() || record.tid() < 0 {
            continue;
        }
        if let Some(coverage) = chrom_coverage.get_mut(record.tid() as usize) {
            coverage.mapped_record_count += 1;
            coverage.aligned_bases += get_aligned_bases(&record);
        }
    }
    for (coverage, chrom_info) in chrom_coverage.iter_mut().zip(chrom_list.data.iter()) {
        update_mean_depth(coverage, chrom_info.length);
    }
    Ok((chrom_coverage, record_count))
}

fn get_total_coverage(chrom_coverage: &[FileCoverage], genome_length: u64) -> FileCoverage {
    let mut total = FileCoverage::default();
    for x in chrom_coverage {
        total.mapped_record_count += x.mapped_record_count;
        total.aligned_bases += x.aligned_bases;
    }
    update_mean_depth(&mut total, genome_length);
    total
}

/// Build a coverage report comparing the original and cleaned alignment files
///
/// Chromosomes are taken from the cleaned file header, which is derived from the original file.
///
pub fn generate_report(
    original_file: &Utf8Path,
    cleaned_file: &Utf8Path,
    thread_count: usize,
) -> SimpleResult<CoverageReport> {
    let chrom_list = {
        let reader = open_bam_reader(cleaned_file, 1)?;
        ChromList::from_bam_header(reader.header())
    };

    let (original, original_record_count) =
        get_file_coverage(original_file, &chrom_list, thread_count)?;
    let (cleaned, cleaned_record_count) =
        get_file_coverage(cleaned_file, &chrom_list, thread_count)?;

    let genome_length = chrom_list.total_length();
    let original_total = get_total_coverage(&original, genome_length);
    let cleaned_total = get_total_coverage(&cleaned, genome_length);

    let chroms = chrom_list
        .data
        .iter()
        .zip(original.into_iter().zip(cleaned))
        .map(|(chrom_info, (original, cleaned))| ChromCoverage {
            label: chrom_info.label.clone(),
            length: chrom_info.length,
            original,
            cleaned,
        })
        .collect();

    let retained_fraction = if original_record_count > 0 {
        cleaned_record_count as f64 / original_record_count as f64
    } else {
        0.0
    };

    Ok(CoverageReport {
        original_file: original_file.to_string(),
        cleaned_file: cleaned_file.to_string(),
        chroms,
        original_total,
        cleaned_total,
        original_record_count,
        cleaned_record_count,
        retained_fraction,
    })
}

/// Write the coverage report in json format
pub fn write_coverage_report(filename: &Utf8Path, report: &CoverageReport) -> SimpleResult<()> {
    info!("Writing coverage report to file: '{filename}'");

    let f = try_with!(
        File::create(filename),
        "Unable to create coverage report json file: '{filename}'"
    );
    try_with!(
        serde_json::to_writer_pretty(&f, report),
        "Unable to write coverage report json file: '{filename}'"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_generate_report() {
        let (_tmp, dir) = get_test_dir();
        let original_lines = vec![
            sam_line("r1:AAAA", 0, "chr1", 11, ""),
            sam_line("r2:AAAA", 0, "chr1", 11, ""),
            sam_line("r3:CCCC", 0, "chr1", 51, ""),
            sam_line("r4:CCCC", 16, "chr2", 51, ""),
            sam_line("r5:GGGG", 4, "*", 0, ""),
        ];
        let original = write_test_bam(&dir, "original.bam", &original_lines, false);
        let cleaned = write_test_bam(&dir, "cleaned.bam", &original_lines[..2], false);

        let report = generate_report(&original, &cleaned, 1).unwrap();
        assert_eq!(report.chroms.len(), 2);
        assert_eq!(report.chroms[0].label, "chr1");
        assert_eq!(report.chroms[0].original.mapped_record_count, 3);
        assert_eq!(report.chroms[0].cleaned.mapped_record_count, 2);
        assert_eq!(report.chroms[0].original.aligned_bases, 30);
        assert!((report.chroms[0].original.mean_depth - 0.03).abs() < 1e-9);
        assert_eq!(report.chroms[1].original.mapped_record_count, 1);
        assert_eq!(report.chroms[1].cleaned.mapped_record_count, 0);

        assert_eq!(report.original_total.mapped_record_count, 4);
        assert!((report.original_total.mean_depth - 40.0 / 1500.0).abs() < 1e-9);
        assert_eq!(report.original_record_count, 5);
        assert_eq!(report.cleaned_record_count, 2);
        assert!((report.retained_fraction - 0.4).abs() < 1e-9);

        let report_filename = dir.join("cleaned.coverage.json");
        write_coverage_report(&report_filename, &report).unwrap();
        let text = std::fs::read_to_string(&report_filename).unwrap();
        let parsed: CoverageReport = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.cleaned_record_count, 2);
    }
}
