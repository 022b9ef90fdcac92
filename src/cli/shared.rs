use clap::Args;
use simple_error::{SimpleResult, bail};

#[derive(Args, Default)]
pub struct SharedSettings {
    /// Number of threads to use. Defaults to all logical cpus detected.
    #[arg(long = "threads", global = true, value_name = "THREAD_COUNT")]
    pub thread_count_option: Option<usize>,

    /// This value will be filled in by thread_count_option
    #[arg(skip)]
    pub thread_count: usize,

    /// Turn on extra debug logging
    ///
    /// This option enables extra logging intended for debugging only, including the read count
    /// of every UMI group found in each final output file.
    ///
    #[arg(long, global = true)]
    pub debug: bool,
}

pub fn validate_and_fix_shared_settings(
    mut settings: SharedSettings,
) -> SimpleResult<SharedSettings> {
    settings.thread_count = match settings.thread_count_option {
        Some(count) => {
            if count == 0 {
                bail!("--threads argument must be greater than 0");
            }
            count
        }
        None => num_cpus::get(),
    };

    Ok(settings)
}
