//! This module covers alignment record and file utilities shared by all pipeline stages: UMI
//! extraction from read names, alignment locus definition, group tag access, and reader/writer
//! setup.
//!

use camino::Utf8Path;
use rust_htslib::bam::{self, Read, record::Aux};
use simple_error::{SimpleResult, bail, try_with};

use crate::globals::{PROGRAM_NAME, PROGRAM_VERSION};

/// Aux tag holding the UMI group identifier
pub const UMI_GROUP_AUX_TAG: &[u8] = b"UG";

/// Extract the UMI from a read name
///
/// The UMI is the text following the last occurrence of `separator`. Returns None if the
/// separator is not found or the UMI is empty.
///
pub fn get_umi<'a>(qname: &'a [u8], separator: &str) -> Option<&'a [u8]> {
    let sep = separator.as_bytes();
    if sep.is_empty() || qname.len() < sep.len() {
        return None;
    }
    let split_pos = qname.windows(sep.len()).rposition(|x| x == sep)?;
    let umi = &qname[split_pos + sep.len()..];
    if umi.is_empty() { None } else { Some(umi) }
}

/// The reference position used to decide which UMI bundle and which window a read belongs to
///
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct AlignmentLocus {
    pub chrom_index: usize,
    pub pos: i64,
}

/// Get the alignment locus of a record
///
/// Forward reads use their start position and reverse reads use their last aligned reference
/// base, so that duplicates from either strand share a locus with reads from the same
/// fragment end. Unmapped reads placed on a chromosome use the placement position.
///
/// Returns None for reads without a chromosome.
///
pub fn get_alignment_locus(record: &bam::Record) -> Option<AlignmentLocus> {
    if record.tid() < 0 {
        return None;
    }
    let chrom_index = record.tid() as usize;
    let pos = if record.is_unmapped() || !record.is_reverse() {
        record.pos()
    } else {
        std::cmp::max(record.cigar().end_pos() - 1, record.pos())
    };
    Some(AlignmentLocus { chrom_index, pos })
}

fn get_qname(record: &bam::Record) -> String {
    String::from_utf8_lossy(record.qname()).to_string()
}

/// Retrieve the UMI group tag from a record
///
/// Both string and integer tag values are accepted, integer values are converted to their
/// decimal string representation.
///
pub fn get_group_tag(record: &bam::Record) -> SimpleResult<Option<String>> {
    let tag = match record.aux(UMI_GROUP_AUX_TAG) {
        Ok(aux_val) => match aux_val {
            Aux::String(val) => val.to_string(),
            Aux::U8(val) => val.to_string(),
            Aux::U16(val) => val.to_string(),
            Aux::U32(val) => val.to_string(),
            Aux::I8(val) => val.to_string(),
            Aux::I16(val) => val.to_string(),
            Aux::I32(val) => val.to_string(),
            _ => bail!(
                "Unexpected UG tag format in read {}: {:?}",
                get_qname(record),
                aux_val
            ),
        },
        Err(_) => return Ok(None),
    };
    Ok(Some(tag))
}

/// Set the UMI group tag on a record, replacing any existing value
///
pub fn set_group_tag(record: &mut bam::Record, group_tag: &str) -> SimpleResult<()> {
    if record.aux(UMI_GROUP_AUX_TAG).is_ok() {
        try_with!(
            record.remove_aux(UMI_GROUP_AUX_TAG),
            "Can't remove existing UG tag from read {}",
            get_qname(record)
        );
    }
    try_with!(
        record.push_aux(UMI_GROUP_AUX_TAG, Aux::String(group_tag)),
        "Can't add UG tag to read {}",
        get_qname(record)
    );
    Ok(())
}

/// Copy the input header and append a uclean PG entry
///
pub fn get_output_header(template: &bam::HeaderView) -> bam::Header {
    let mut new_header = bam::Header::from_template(template);

    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
    let mut pg_record = bam::header::HeaderRecord::new(b"PG");
    pg_record.push_tag(b"PN", PROGRAM_NAME);
    pg_record.push_tag(b"ID", format!("{PROGRAM_NAME}-{PROGRAM_VERSION}"));
    pg_record.push_tag(b"VN", PROGRAM_VERSION);
    pg_record.push_tag(b"CL", &cmdline);

    new_header.push_record(&pg_record);
    new_header
}

pub fn open_bam_reader(filename: &Utf8Path, thread_count: usize) -> SimpleResult<bam::Reader> {
    let mut reader = try_with!(
        bam::Reader::from_path(filename),
        "Failed to open alignment file: '{filename}'"
    );
    if thread_count > 1 {
        try_with!(
            reader.set_threads(thread_count),
            "Failed to set reader threads for alignment file: '{filename}'"
        );
    }
    Ok(reader)
}

pub fn create_bam_writer(
    filename: &Utf8Path,
    header: &bam::Header,
    thread_count: usize,
) -> SimpleResult<bam::Writer> {
    let mut writer = try_with!(
        bam::Writer::from_path(filename, header, bam::Format::Bam),
        "Failed to create alignment file: '{filename}'"
    );
    if thread_count > 1 {
        try_with!(
            writer.set_threads(thread_count),
            "Failed to set writer threads for alignment file: '{filename}'"
        );
    }
    Ok(writer)
}
