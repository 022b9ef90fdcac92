//! Helpers to synthesize small alignment files for unit tests
//!

use camino::{Utf8Path, Utf8PathBuf};
use rust_htslib::bam::{self, Header, HeaderView, Read, header};
use tempfile::TempDir;

use crate::bam_utils::get_group_tag;

pub const TEST_CHROM1_LEN: u64 = 1000;
pub const TEST_CHROM2_LEN: u64 = 500;

pub fn get_test_header() -> Header {
    let mut header = Header::new();
    header.push_record(
        header::HeaderRecord::new(b"HD")
            .push_tag(b"VN", "1.6")
            .push_tag(b"SO", "coordinate"),
    );
    header.push_record(
        header::HeaderRecord::new(b"SQ")
            .push_tag(b"SN", "chr1")
            .push_tag(b"LN", TEST_CHROM1_LEN),
    );
    header.push_record(
        header::HeaderRecord::new(b"SQ")
            .push_tag(b"SN", "chr2")
            .push_tag(b"LN", TEST_CHROM2_LEN),
    );
    header
}

pub fn get_test_header_view() -> HeaderView {
    HeaderView::from_header(&get_test_header())
}

/// Temporary directory with a utf8 path
pub fn get_test_dir() -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

/// Build a SAM line for a simple 10 base read
///
/// `pos` is 1-based as in SAM text. Pass `chrom = "*"` and `pos = 0` for an unplaced read.
///
pub fn sam_line(qname: &str, flag: u16, chrom: &str, pos: i64, extra_tags: &str) -> String {
    let cigar = if flag & 0x4 != 0 { "*" } else { "10M" };
    let mut line = format!("{qname}\t{flag}\t{chrom}\t{pos}\t60\t{cigar}\t*\t0\t0\tACGTACGTAC\tDDDDDDDDDD");
    if !extra_tags.is_empty() {
        line.push('\t');
        line.push_str(extra_tags);
    }
    line
}

pub fn records_from_sam_lines(lines: &[String]) -> Vec<bam::Record> {
    let header_view = get_test_header_view();
    lines
        .iter()
        .map(|x| bam::Record::from_sam(&header_view, x.as_bytes()).unwrap())
        .collect()
}

/// Write the SAM lines to a BAM file in the given order, optionally with an index
///
pub fn write_test_bam(dir: &Utf8Path, name: &str, lines: &[String], index: bool) -> Utf8PathBuf {
    let filename = dir.join(name);
    {
        let header = get_test_header();
        let mut writer = bam::Writer::from_path(&filename, &header, bam::Format::Bam).unwrap();
        for record in records_from_sam_lines(lines) {
            writer.write(&record).unwrap();
        }
    }
    if index {
        bam::index::build(&filename, None, bam::index::Type::Bai, 1).unwrap();
    }
    filename
}

pub fn read_test_bam(filename: &Utf8Path) -> Vec<bam::Record> {
    let mut reader = bam::Reader::from_path(filename).unwrap();
    reader.records().map(|x| x.unwrap()).collect()
}

pub fn read_test_qnames(filename: &Utf8Path) -> Vec<String> {
    read_test_bam(filename)
        .iter()
        .map(|x| String::from_utf8(x.qname().to_vec()).unwrap())
        .collect()
}

pub fn read_test_group_tags(filename: &Utf8Path) -> Vec<String> {
    read_test_bam(filename)
        .iter()
        .map(|x| get_group_tag(x).unwrap().unwrap())
        .collect()
}
