//! Post-hoc check that no UMI group in a final file is a onesie
//!

use camino::Utf8Path;
use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use simple_error::SimpleResult;
use thousands::Separable;

use crate::group_tally::{GroupSizeStats, GroupTally};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display)]
pub enum ValidationVerdict {
    Pass,
    Fail,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ValidationResult {
    pub verdict: ValidationVerdict,
    pub record_count: usize,

    /// Records without any group tag. These are reported but do not change the verdict.
    pub untagged_count: usize,

    /// Number of groups observed exactly once
    pub onesie_count: usize,

    pub group_stats: GroupSizeStats,
}

fn log_group_tally(filename: &Utf8Path, tally: &GroupTally) {
    let hist = tally.get_multiplicity_histogram();
    info!(
        "Group size histogram for '{filename}' (size:groups): {}",
        hist.iter().map(|(size, count)| format!("{size}:{count}")).join(" ")
    );

    if log::log_enabled!(log::Level::Debug) {
        for (tag, count) in tally.counts.iter().sorted() {
            debug!("Group tag tally: {tag}\t{count}");
        }
    }
}

/// Scan `filename` and check that every group tag present occurs on at least two records
///
pub fn validate(filename: &Utf8Path, thread_count: usize) -> SimpleResult<ValidationResult> {
    let tally = GroupTally::from_bam(filename, thread_count)?;
    log_group_tally(filename, &tally);

    let onesie_count = tally.onesie_count();
    let verdict = if onesie_count == 0 {
        ValidationVerdict::Pass
    } else {
        ValidationVerdict::Fail
    };

    if tally.untagged_count > 0 {
        warn!(
            "Found {} records without a UG tag in '{filename}'",
            tally.untagged_count.separate_with_commas()
        );
    }

    let record_count = tally.tagged_record_count() + tally.untagged_count;
    match verdict {
        ValidationVerdict::Pass => info!(
            "Validation PASS for '{filename}': {} records in {} groups, no onesie groups",
            record_count.separate_with_commas(),
            tally.counts.len().separate_with_commas()
        ),
        ValidationVerdict::Fail => warn!(
            "Validation FAIL for '{filename}': {} onesie groups found among {} groups",
            onesie_count.separate_with_commas(),
            tally.counts.len().separate_with_commas()
        ),
    }

    Ok(ValidationResult {
        verdict,
        record_count,
        untagged_count: tally.untagged_count,
        onesie_count,
        group_stats: tally.get_group_size_stats(),
    })
}
