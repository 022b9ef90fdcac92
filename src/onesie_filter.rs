//! Remove UMI groups observed exactly once ("onesies") from a tagged alignment file
//!
//! The group tally is built in a first pass, and the file is stream-filtered against the
//! resulting blacklist in a second pass.
//!

use std::collections::HashSet;

use camino::Utf8Path;
use log::debug;
use rust_htslib::bam::{self, Read};
use simple_error::{SimpleResult, bail, try_with};

use crate::bam_utils::{create_bam_writer, get_group_tag, open_bam_reader};
use crate::group_tally::GroupTally;

pub struct FilterResult {
    pub input_count: usize,
    pub output_count: usize,

    /// Number of distinct groups in the tagged input
    pub group_count: usize,

    /// Group tags removed because they were found on a single record
    pub blacklist: HashSet<String>,
}

impl FilterResult {
    pub fn removed_count(&self) -> usize {
        self.input_count - self.output_count
    }
}

/// Each onesie group removes exactly one record
///
fn check_filter_counts(
    input_count: usize,
    output_count: usize,
    onesie_count: usize,
) -> SimpleResult<()> {
    if input_count != output_count + onesie_count {
        bail!(
            "Filter kept {output_count} of {input_count} records, but found {onesie_count} onesie groups"
        );
    }
    Ok(())
}

/// Find all onesie groups in `tagged_file` and write every other record to `filtered_file`
///
/// Every record in `tagged_file` must carry a group tag.
///
pub fn detect_and_filter(
    tagged_file: &Utf8Path,
    filtered_file: &Utf8Path,
    thread_count: usize,
) -> SimpleResult<FilterResult> {
    let tally = GroupTally::from_bam(tagged_file, thread_count)?;
    if tally.untagged_count > 0 {
        bail!(
            "Found {} records without a UG tag in tagged file '{tagged_file}'",
            tally.untagged_count
        );
    }
    let blacklist = tally.get_onesies();

    let mut reader = open_bam_reader(tagged_file, thread_count)?;
    let header = bam::Header::from_template(reader.header());
    let mut writer = create_bam_writer(filtered_file, &header, thread_count)?;

    let mut input_count = 0;
    let mut output_count = 0;
    let mut record = bam::Record::new();
    while let Some(r) = reader.read(&mut record) {
        try_with!(r, "Failed to parse alignment record from '{tagged_file}'");
        input_count += 1;
        let is_onesie = match get_group_tag(&record)? {
            Some(group_tag) => blacklist.contains(&group_tag),
            None => bail!("Record without a UG tag in tagged file '{tagged_file}'"),
        };
        if is_onesie {
            continue;
        }
        try_with!(
            writer.write(&record),
            "Failed to write filtered record to '{filtered_file}'"
        );
        output_count += 1;
    }

    check_filter_counts(input_count, output_count, blacklist.len())?;

    debug!(
        "Removed {} onesie groups from '{tagged_file}', {output_count} of {input_count} records kept",
        blacklist.len()
    );

    Ok(FilterResult {
        input_count,
        output_count,
        group_count: tally.counts.len(),
        blacklist,
    })
}
