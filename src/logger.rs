//! Methods specific to the uclean logger
//!

use camino::Utf8Path;

use crate::globals::PROGRAM_NAME;
use crate::os_utils::create_dir_all;

/// If debug is true set the default logger to the more verbose debug level
///
fn setup_logger(output_dir: Option<&Utf8Path>, debug: bool) -> Result<(), fern::InitError> {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let logger = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                PROGRAM_NAME,
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    let logger = if let Some(output_dir) = output_dir {
        let log_filename = output_dir.join(PROGRAM_NAME.to_string() + ".log");
        logger.chain(fern::log_file(log_filename)?)
    } else {
        logger
    };

    logger.apply()?;
    Ok(())
}

/// Create output directory if needed, then setup logger to write there
///
/// Unlike a single-sample output directory, the cleaned directory is shared by every sample
/// from the same input location, so an existing directory is reused.
///
/// #Arguments
/// * `debug` - If true use debug log level, and info level otherwise
///
pub fn setup_output_dir_and_logger(output_dir: &Utf8Path, debug: bool) {
    // No logger is setup yet, so errors here go straight to stderr
    if let Err(msg) = create_dir_all(output_dir, "output") {
        eprintln!("Invalid command-line setting: {msg}");
        std::process::exit(exitcode::CANTCREAT);
    }
    if let Err(e) = setup_logger(Some(output_dir), debug) {
        eprintln!("Unable to setup logger in output directory '{output_dir}': {e}");
        std::process::exit(exitcode::CANTCREAT);
    }
}
