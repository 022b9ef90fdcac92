use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use simple_error::{SimpleResult, bail};

use super::utils::get_input_alignment_files;
use crate::umi_clustering::GroupingMethod;

/// Name of the default output directory, created next to the input alignment files
pub const DEFAULT_OUTPUT_DIRNAME: &str = "cleaned";

#[derive(Args, Default)]
pub struct CleanSettings {
    /// Coordinate-sorted alignment file in BAM format, or a directory of BAM files to process as
    /// a batch of samples.
    ///
    /// Files large enough to be split into windows must be indexed.
    ///
    #[arg(long = "bam", value_name = "PATH")]
    pub bam_path: Utf8PathBuf,

    /// Directory for all output. Defaults to a 'cleaned' directory in the input directory.
    #[arg(long = "output-dir", value_name = "DIR")]
    pub output_dir_option: Option<Utf8PathBuf>,

    /// This value will be filled in by output_dir_option
    #[arg(skip)]
    pub output_dir: Utf8PathBuf,

    /// This value will be filled in from bam_path
    #[arg(skip)]
    pub input_files: Vec<Utf8PathBuf>,

    /// Delimiter separating the UMI from the rest of each read name
    ///
    /// The UMI is taken from the text following the last occurrence of the separator.
    ///
    #[arg(long, default_value = ":")]
    pub separator: String,

    /// Method used to cluster the UMIs of reads at the same alignment locus
    #[arg(long, value_enum, default_value_t = GroupingMethod::Directional)]
    pub grouping_method: GroupingMethod,

    /// Maximum number of mismatches between two UMIs clustered together
    #[arg(long, default_value_t = 1)]
    pub max_edits: u32,

    /// Add the read length to the alignment locus used to bundle reads for UMI grouping
    #[arg(long)]
    pub group_by_length: bool,

    /// Group only the first read of each read pair, second reads are left out of the output
    #[arg(long)]
    pub r1_only: bool,

    /// Skip sorting, indexing and the coverage report. The final file is still validated.
    #[arg(long)]
    pub no_report: bool,

    /// Delete each intermediate file as soon as the next stage has consumed it
    #[arg(long)]
    pub delete_temps: bool,

    /// Window size in bases used to split each input file, 0 disables splitting
    ///
    /// By default the window size is selected from the input file size.
    ///
    #[arg(hide = true, long)]
    pub window_size: Option<u64>,

    /// Overwrite existing cleaned output files
    #[arg(long)]
    pub clobber: bool,
}

fn get_default_output_dir(bam_path: &Utf8Path) -> Utf8PathBuf {
    let input_dir = if bam_path.is_dir() {
        bam_path
    } else {
        match bam_path.parent() {
            Some(x) if !x.as_str().is_empty() => x,
            _ => Utf8Path::new("."),
        }
    };
    input_dir.join(DEFAULT_OUTPUT_DIRNAME)
}

/// Validate settings and update to parameters that can't be processed automatically by clap.
///
/// Assumes that the logger is not setup
///
pub fn validate_and_fix_clean_settings(mut settings: CleanSettings) -> SimpleResult<CleanSettings> {
    settings.input_files = get_input_alignment_files(&settings.bam_path, "input alignment")?;

    if settings.separator.is_empty() {
        bail!("--separator argument must not be empty");
    }

    settings.output_dir = match settings.output_dir_option.take() {
        Some(x) => x,
        None => get_default_output_dir(&settings.bam_path),
    };
    if settings.output_dir.exists() && !settings.output_dir.is_dir() {
        bail!(
            "Output directory path exists and is not a directory: '{}'",
            settings.output_dir
        );
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_clean_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let bam_path = dir.join("sample1.bam");
        std::fs::write(&bam_path, "").unwrap();

        let settings = CleanSettings {
            bam_path: bam_path.clone(),
            separator: ":".to_string(),
            ..Default::default()
        };
        let settings = validate_and_fix_clean_settings(settings).unwrap();
        assert_eq!(settings.input_files, vec![bam_path.clone()]);
        assert_eq!(settings.output_dir, dir.join(DEFAULT_OUTPUT_DIRNAME));

        let settings = CleanSettings {
            bam_path: dir.to_owned(),
            output_dir_option: Some(dir.join("out")),
            separator: "_".to_string(),
            ..Default::default()
        };
        let settings = validate_and_fix_clean_settings(settings).unwrap();
        assert_eq!(settings.input_files, vec![bam_path.clone()]);
        assert_eq!(settings.output_dir, dir.join("out"));

        let settings = CleanSettings {
            bam_path,
            separator: String::new(),
            ..Default::default()
        };
        assert!(validate_and_fix_clean_settings(settings).is_err());
    }

    #[test]
    fn test_default_output_dir() {
        assert_eq!(
            get_default_output_dir(Utf8Path::new("sample.bam")),
            Utf8PathBuf::from("./cleaned")
        );
        assert_eq!(
            get_default_output_dir(Utf8Path::new("/nonexistent/data/sample.bam")),
            Utf8PathBuf::from("/nonexistent/data/cleaned")
        );
    }
}
