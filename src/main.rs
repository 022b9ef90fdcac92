mod bam_utils;
mod chrom_list;
mod cli;
mod coverage_report;
mod errors;
mod filenames;
mod globals;
mod group_tagger;
mod group_tally;
mod logger;
mod merger;
mod onesie_filter;
mod os_utils;
mod pipeline;
mod run_stats;
mod sample_manifest;
mod sort_index;
mod splitter;
mod umi_clustering;
mod validator;
mod worker_thread_data;

#[cfg(test)]
mod test_utils;

use std::{error, process};

use hhmmss::Hhmmss;
use log::info;

use crate::globals::{PROGRAM_NAME, PROGRAM_VERSION};
use crate::logger::setup_output_dir_and_logger;
use crate::pipeline::run_clean;

/// Run system configuration steps prior to starting any other program logic
///
fn system_configuration_prelude() {
    os_utils::attempt_max_open_file_limit();
}

/// Returns the process exit code summarizing all samples
///
fn run(settings: &cli::Settings) -> Result<i32, Box<dyn error::Error>> {
    info!("Starting {PROGRAM_NAME} {PROGRAM_VERSION}");
    info!(
        "cmdline: {}",
        std::env::args().collect::<Vec<_>>().join(" ")
    );
    info!("Running on {} threads", settings.shared.thread_count);

    let start = std::time::Instant::now();

    let run_stats = run_clean(&settings.shared, &settings.clean)?;

    info!(
        "{PROGRAM_NAME} completed. Total Runtime: {}",
        start.elapsed().hhmmssxxx()
    );
    Ok(run_stats.get_exit_code())
}

fn main() {
    system_configuration_prelude();

    let settings = cli::validate_and_fix_settings(cli::parse_settings());

    // Setup logger, including creation of the output directory for the log file:
    setup_output_dir_and_logger(&settings.clean.output_dir, settings.shared.debug);

    match run(&settings) {
        Ok(exit_code) => process::exit(exit_code),
        Err(err) => {
            eprintln!("{err}");
            process::exit(2);
        }
    }
}
