//! Track stats for the whole uclean run
//!

use std::fs::File;

use camino::Utf8Path;
use log::info;
use serde::{Deserialize, Serialize};
use unwrap::unwrap;

use crate::errors::{PipelineError, PipelineStage};
use crate::filenames::RUN_STATS_FILENAME;
use crate::group_tally::GroupSizeStats;

/// Final outcome of one sample
///
/// Pipeline failures are kept distinct from validation outcomes.
///
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum SampleStatus {
    Pass,
    Fail,
    PipelineFailure {
        stage: PipelineStage,
        message: String,
    },
}

impl SampleStatus {
    pub fn from_error(err: &PipelineError) -> Self {
        Self::PipelineFailure {
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FilterStats {
    pub records_tagged: usize,

    /// Records left out of grouping, such as second reads when grouping first reads only
    pub records_skipped: usize,

    pub group_count: usize,
    pub onesie_groups_removed: usize,
    pub records_filtered: usize,
}

impl FilterStats {
    pub fn merge(&mut self, other: &Self) {
        self.records_tagged += other.records_tagged;
        self.records_skipped += other.records_skipped;
        self.group_count += other.group_count;
        self.onesie_groups_removed += other.onesie_groups_removed;
        self.records_filtered += other.records_filtered;
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SampleRunStats {
    pub input_file: String,
    pub cleaned_file: Option<String>,

    /// Zero if the sample was processed as a single window
    pub window_size: u64,

    /// Number of non-empty windows processed
    pub window_count: usize,

    pub records_in: usize,
    pub filter_stats: FilterStats,
    pub records_out: usize,

    /// Group sizes in the final file, available once validation has run
    pub group_stats: Option<GroupSizeStats>,

    pub status: SampleStatus,
    pub runtime_secs: f64,
}

impl SampleRunStats {
    pub fn new(input_file: &Utf8Path) -> Self {
        Self {
            input_file: input_file.to_string(),
            cleaned_file: None,
            window_size: 0,
            window_count: 0,
            records_in: 0,
            filter_stats: FilterStats::default(),
            records_out: 0,
            group_stats: None,
            status: SampleStatus::Pass,
            runtime_secs: 0.0,
        }
    }
}

#[derive(Default, Deserialize, Serialize)]
pub struct RunStats {
    pub samples: Vec<SampleRunStats>,
}

impl RunStats {
    pub fn pipeline_failure_count(&self) -> usize {
        self.samples
            .iter()
            .filter(|x| matches!(x.status, SampleStatus::PipelineFailure { .. }))
            .count()
    }

    pub fn validation_failure_count(&self) -> usize {
        self.samples
            .iter()
            .filter(|x| x.status == SampleStatus::Fail)
            .count()
    }

    /// Process exit code summarizing all samples
    ///
    /// Any pipeline failure takes precedence over a validation failure.
    ///
    pub fn get_exit_code(&self) -> i32 {
        if self.pipeline_failure_count() > 0 {
            exitcode::SOFTWARE
        } else if self.validation_failure_count() > 0 {
            exitcode::DATAERR
        } else {
            exitcode::OK
        }
    }
}

/// Write run_stats structure out in json format
pub fn write_run_stats(output_dir: &Utf8Path, run_stats: &RunStats) {
    let filename = output_dir.join(RUN_STATS_FILENAME);

    info!("Writing run statistics to file: '{filename}'");

    let f = unwrap!(
        File::create(&filename),
        "Unable to create run statistics json file: '{}'",
        filename
    );

    unwrap!(
        serde_json::to_writer_pretty(&f, &run_stats),
        "Unable to write run statistics json file: '{}'",
        filename
    );
}
