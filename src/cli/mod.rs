mod clean;
mod shared;
mod utils;

use clap::Parser;
use simple_error::SimpleResult;

pub use self::clean::CleanSettings;
use self::clean::validate_and_fix_clean_settings;
pub use self::shared::SharedSettings;
use self::shared::validate_and_fix_shared_settings;

#[derive(Parser)]
#[command(
    author,
    version,
    about,
    help_template = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}"
)]
#[clap(propagate_version = true, rename_all = "kebab_case")]
pub struct Settings {
    #[command(flatten)]
    pub shared: SharedSettings,

    #[command(flatten)]
    pub clean: CleanSettings,
}

/// Validate settings and update parameters that can't be processed by clap
///
pub fn validate_and_fix_settings_impl(mut settings: Settings) -> SimpleResult<Settings> {
    settings.shared = validate_and_fix_shared_settings(settings.shared)?;
    settings.clean = validate_and_fix_clean_settings(settings.clean)?;
    Ok(settings)
}

/// Validate settings and update to parameters that can't be processed automatically by clap.
///
pub fn validate_and_fix_settings(settings: Settings) -> Settings {
    match validate_and_fix_settings_impl(settings) {
        Ok(x) => x,
        Err(msg) => {
            eprintln!("Invalid command-line setting: {msg}");
            std::process::exit(exitcode::USAGE);
        }
    }
}

pub fn parse_settings() -> Settings {
    Settings::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings() {
        let settings = Settings::try_parse_from([
            "uclean",
            "--bam",
            "in.bam",
            "--grouping-method",
            "acyclic",
            "--max-edits",
            "2",
            "--no-report",
            "--threads",
            "4",
        ])
        .unwrap();
        assert_eq!(settings.clean.bam_path, "in.bam");
        assert_eq!(
            settings.clean.grouping_method,
            crate::umi_clustering::GroupingMethod::Acyclic
        );
        assert_eq!(settings.clean.max_edits, 2);
        assert_eq!(settings.clean.separator, ":");
        assert!(settings.clean.no_report);
        assert!(!settings.clean.delete_temps);
        assert_eq!(settings.clean.window_size, None);

        assert!(Settings::try_parse_from(["uclean", "--bam", "in.bam", "--grouping-method", "x"]).is_err());
    }
}
