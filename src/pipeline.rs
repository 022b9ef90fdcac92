//! Run the full cleaning pipeline for each input sample
//!
//! Each sample runs through Split, then Tag and Filter for every window in parallel, then Merge,
//! Sort/Index, Validate and Report. Samples too small to split skip Split and Merge, and are
//! tagged and filtered as a single window. A pipeline failure stops only the affected sample.
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;

use camino::{Utf8Path, Utf8PathBuf};
use log::{error, info, warn};
use rust_htslib::bam::{self, Read};
use simple_error::{SimpleError, SimpleResult, bail, try_with};
use thousands::Separable;

use crate::bam_utils::{get_output_header, open_bam_reader};
use crate::chrom_list::ChromList;
use crate::cli::{CleanSettings, SharedSettings};
use crate::coverage_report::{generate_report, write_coverage_report};
use crate::errors::{PipelineError, PipelineResult, PipelineStage};
use crate::filenames::{
    get_cleaned_filename, get_coverage_report_filename, get_sample_stem, get_split_dir,
    get_unsplit_filtered_filename, get_unsplit_tagged_filename, get_window_filtered_filename,
    get_window_tagged_filename,
};
use crate::group_tagger::{GroupTagger, UmiGroupTagger};
use crate::merger::merge_sample_windows;
use crate::onesie_filter::detect_and_filter;
use crate::os_utils::{create_dir_all, remove_file_if_present};
use crate::run_stats::{FilterStats, RunStats, SampleRunStats, SampleStatus, write_run_stats};
use crate::sample_manifest::SampleManifest;
use crate::sort_index::sort_and_index;
use crate::splitter::{SizePolicy, Window, check_alignment_index, split_alignment_file};
use crate::validator::{ValidationVerdict, validate};

fn stage_error(stage: PipelineStage) -> impl Fn(SimpleError) -> PipelineError {
    move |e| PipelineError::tool(stage, None, e)
}

fn window_stage_error(
    stage: PipelineStage,
    window_index: usize,
) -> impl Fn(SimpleError) -> PipelineError {
    move |e| PipelineError::tool(stage, Some(window_index), e)
}

fn config_error(e: SimpleError) -> PipelineError {
    PipelineError::Configuration(e.as_str().to_string())
}

/// Settings for one sample which are shared by every stage
struct SampleContext<'a> {
    settings: &'a CleanSettings,
    input_file: &'a Utf8Path,
    sample_stem: String,
    cleaned_file: Utf8PathBuf,
    thread_count: usize,
}

/// Tag and filter the whole input as a single window
///
/// The filtered output is renamed to the cleaned file only once filtering is complete, so a
/// failure never leaves a partial cleaned file behind.
///
fn process_single_window(
    tagger: &dyn GroupTagger,
    context: &SampleContext,
    stats: &mut SampleRunStats,
) -> PipelineResult<()> {
    let filter_error = stage_error(PipelineStage::Filter);

    let tagged_file =
        get_unsplit_tagged_filename(&context.settings.output_dir, &context.sample_stem);
    let tag_result = tagger
        .tag(context.input_file, &tagged_file, 0)
        .map_err(stage_error(PipelineStage::Tag))?;
    stats.records_in = tag_result.record_count + tag_result.skipped_count;
    stats.window_count = 1;

    let filtered_file =
        get_unsplit_filtered_filename(&context.settings.output_dir, &context.sample_stem);
    let filter_result = match detect_and_filter(&tagged_file, &filtered_file, context.thread_count)
    {
        Ok(x) => x,
        Err(e) => {
            remove_file_if_present(&filtered_file).map_err(&filter_error)?;
            return Err(filter_error(e));
        }
    };
    std::fs::rename(&filtered_file, &context.cleaned_file).map_err(|e| {
        filter_error(SimpleError::new(format!(
            "Failed to move filtered file '{filtered_file}' to '{}': {e}",
            context.cleaned_file
        )))
    })?;
    remove_file_if_present(&tagged_file).map_err(&filter_error)?;

    stats.filter_stats = FilterStats {
        records_tagged: tag_result.record_count,
        records_skipped: tag_result.skipped_count,
        group_count: tag_result.group_count,
        onesie_groups_removed: filter_result.blacklist.len(),
        records_filtered: filter_result.output_count,
    };
    Ok(())
}

/// Tag and filter one window, and record its filtered output in the manifest
///
fn process_window(
    tagger: &dyn GroupTagger,
    manifest: &SampleManifest,
    window: &Window,
    delete_temps: bool,
) -> PipelineResult<FilterStats> {
    let tag_error = window_stage_error(PipelineStage::Tag, window.index);
    let filter_error = window_stage_error(PipelineStage::Filter, window.index);

    let tagged_file = get_window_tagged_filename(manifest.split_dir(), window.index);
    let tag_result = tagger
        .tag(&window.filename, &tagged_file, window.index)
        .map_err(&tag_error)?;
    if tag_result.record_count + tag_result.skipped_count != window.record_count {
        return Err(tag_error(SimpleError::new(format!(
            "Tagged file has {} records and {} skipped records but window file has {} records",
            tag_result.record_count, tag_result.skipped_count, window.record_count
        ))));
    }
    if delete_temps {
        remove_file_if_present(&window.filename).map_err(&tag_error)?;
    }

    let filtered_file = get_window_filtered_filename(manifest.split_dir(), window.index);
    let filter_result = detect_and_filter(&tagged_file, &filtered_file, 1).map_err(&filter_error)?;
    if delete_temps {
        remove_file_if_present(&tagged_file).map_err(&filter_error)?;
    }

    manifest
        .complete_window(window.index, &filtered_file, filter_result.output_count)
        .map_err(&filter_error)?;

    Ok(FilterStats {
        records_tagged: tag_result.record_count,
        records_skipped: tag_result.skipped_count,
        group_count: tag_result.group_count,
        onesie_groups_removed: filter_result.blacklist.len(),
        records_filtered: filter_result.output_count,
    })
}

/// Tag and filter all windows in parallel
///
/// After the first window failure, windows which have not started yet are skipped. Intermediate
/// files of all windows are kept for diagnosis.
///
fn process_all_windows(
    worker_pool: &rayon::ThreadPool,
    tagger: &dyn GroupTagger,
    manifest: &SampleManifest,
    windows: &[Window],
    delete_temps: bool,
) -> PipelineResult<FilterStats> {
    let abort = AtomicBool::new(false);
    let (tx, rx) = channel();

    let abort = &abort;
    worker_pool.scope(move |scope| {
        for window in windows {
            let tx = tx.clone();
            scope.spawn(move |_| {
                if abort.load(Ordering::Relaxed) {
                    return;
                }
                let result = process_window(tagger, manifest, window, delete_temps);
                if result.is_err() {
                    abort.store(true, Ordering::Relaxed);
                }
                tx.send(result).unwrap();
            });
        }
    });

    let mut filter_stats = FilterStats::default();
    let mut first_error = None;
    for result in rx {
        match result {
            Ok(x) => filter_stats.merge(&x),
            Err(e) => {
                error!("{e}");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(filter_stats),
    }
}

/// Split the input into windows, process each window, then merge all filtered windows into the
/// cleaned file
///
fn process_split_windows(
    worker_pool: &rayon::ThreadPool,
    tagger: &dyn GroupTagger,
    context: &SampleContext,
    header_view: &bam::HeaderView,
    window_size: u64,
    stats: &mut SampleRunStats,
) -> PipelineResult<()> {
    check_alignment_index(context.input_file).map_err(config_error)?;

    let split_error = stage_error(PipelineStage::Split);
    let split_dir = get_split_dir(
        &context.settings.output_dir,
        &context.sample_stem,
        window_size,
    );
    if split_dir.exists() {
        warn!("Removing window directory left by a previous run: '{split_dir}'");
        std::fs::remove_dir_all(&split_dir)
            .map_err(|e| split_error(SimpleError::from(e)))?;
    }
    create_dir_all(&split_dir, "window").map_err(&split_error)?;

    let chrom_list = ChromList::from_bam_header(header_view);
    let split_result = split_alignment_file(
        worker_pool,
        context.input_file,
        &split_dir,
        &chrom_list,
        window_size,
    )
    .map_err(&split_error)?;
    stats.records_in = split_result.record_count;
    stats.window_count = split_result.windows.len();

    let manifest = SampleManifest::new(&context.sample_stem, &split_dir, &split_result.windows);
    stats.filter_stats = process_all_windows(
        worker_pool,
        tagger,
        &manifest,
        &split_result.windows,
        context.settings.delete_temps,
    )?;

    info!(
        "Sample '{}': {} onesie groups removed, {} of {} records kept",
        manifest.sample_stem(),
        stats.filter_stats.onesie_groups_removed.separate_with_commas(),
        stats.filter_stats.records_filtered.separate_with_commas(),
        stats.records_in.separate_with_commas()
    );

    let header = get_output_header(header_view);
    let merge_result =
        merge_sample_windows(manifest, &header, &context.cleaned_file, context.thread_count)?;
    check_merged_record_count(merge_result.record_count, &stats.filter_stats)
}

/// Check that the merged file holds every record kept by the window filters
///
fn check_merged_record_count(
    merged_record_count: usize,
    filter_stats: &FilterStats,
) -> PipelineResult<()> {
    if merged_record_count != filter_stats.records_filtered {
        return Err(PipelineError::PartialData(format!(
            "Merged file has {merged_record_count} records, but window filters kept {} records",
            filter_stats.records_filtered
        )));
    }
    Ok(())
}

fn read_input_header(input_file: &Utf8Path) -> SimpleResult<bam::HeaderView> {
    let reader = open_bam_reader(input_file, 1)?;
    Ok(reader.header().clone())
}

fn prepare_cleaned_file(cleaned_file: &Utf8Path, clobber: bool) -> SimpleResult<()> {
    if cleaned_file.exists() {
        if !clobber {
            bail!(
                "Cleaned output file already exists, use --clobber to overwrite: '{cleaned_file}'"
            );
        }
        remove_file_if_present(cleaned_file)?;
    }
    remove_file_if_present(&Utf8PathBuf::from(format!("{cleaned_file}.csi")))?;
    remove_file_if_present(&get_coverage_report_filename(cleaned_file))?;
    Ok(())
}

fn process_sample_impl(
    worker_pool: &rayon::ThreadPool,
    tagger: &dyn GroupTagger,
    settings: &CleanSettings,
    input_file: &Utf8Path,
    stats: &mut SampleRunStats,
) -> PipelineResult<ValidationVerdict> {
    let sample_stem = get_sample_stem(input_file);
    let cleaned_file = get_cleaned_filename(&settings.output_dir, &sample_stem);
    let context = SampleContext {
        settings,
        input_file,
        sample_stem,
        cleaned_file,
        thread_count: worker_pool.current_num_threads(),
    };

    prepare_cleaned_file(&context.cleaned_file, settings.clobber).map_err(config_error)?;
    let header_view = read_input_header(input_file).map_err(config_error)?;

    let window_size = match settings.window_size {
        Some(x) => x,
        None => SizePolicy::default()
            .get_file_window_size(input_file)
            .map_err(config_error)?,
    };
    stats.window_size = window_size;

    if window_size == 0 {
        info!("Processing '{input_file}' as a single window");
        process_single_window(tagger, &context, stats)?;
    } else {
        info!("Processing '{input_file}' in {window_size} bp windows");
        process_split_windows(worker_pool, tagger, &context, &header_view, window_size, stats)?;
    }
    stats.cleaned_file = Some(context.cleaned_file.to_string());

    if !settings.no_report {
        sort_and_index(&context.cleaned_file, context.thread_count)
            .map_err(stage_error(PipelineStage::SortIndex))?;
    }

    let validation = validate(&context.cleaned_file, context.thread_count)
        .map_err(stage_error(PipelineStage::Validate))?;
    stats.records_out = validation.record_count;
    stats.group_stats = Some(validation.group_stats);

    if !settings.no_report {
        let report_error = stage_error(PipelineStage::Report);
        let report = generate_report(input_file, &context.cleaned_file, context.thread_count)
            .map_err(&report_error)?;
        write_coverage_report(&get_coverage_report_filename(&context.cleaned_file), &report)
            .map_err(&report_error)?;
    }

    Ok(validation.verdict)
}

/// Run all pipeline stages for one sample
///
/// All failures are captured in the returned sample status.
///
pub fn process_sample(
    worker_pool: &rayon::ThreadPool,
    tagger: &dyn GroupTagger,
    settings: &CleanSettings,
    input_file: &Utf8Path,
) -> SampleRunStats {
    let start = std::time::Instant::now();
    let mut stats = SampleRunStats::new(input_file);

    info!("Processing sample alignment file '{input_file}'");
    let result = process_sample_impl(worker_pool, tagger, settings, input_file, &mut stats);
    stats.status = match result {
        Ok(ValidationVerdict::Pass) => SampleStatus::Pass,
        Ok(ValidationVerdict::Fail) => {
            warn!("Cleaned output for '{input_file}' failed validation: onesie groups remain");
            SampleStatus::Fail
        }
        Err(e) => {
            error!("Processing failed for '{input_file}': {e}");
            SampleStatus::from_error(&e)
        }
    };
    stats.runtime_secs = start.elapsed().as_secs_f64();
    stats
}

/// Clean every input sample in turn and write the run statistics
///
pub fn run_clean(
    shared_settings: &SharedSettings,
    settings: &CleanSettings,
) -> SimpleResult<RunStats> {
    assert!(shared_settings.thread_count > 0);

    let worker_pool = try_with!(
        rayon::ThreadPoolBuilder::new()
            .num_threads(shared_settings.thread_count)
            .build(),
        "Failed to create worker thread pool"
    );

    let tagger = UmiGroupTagger::new(
        &settings.separator,
        settings.grouping_method,
        settings.max_edits,
        1,
    )
    .group_by_length(settings.group_by_length)
    .r1_only(settings.r1_only);

    info!(
        "Cleaning {} sample(s) with {} UMI grouping, max edits {}",
        settings.input_files.len(),
        settings.grouping_method,
        settings.max_edits
    );
    if settings.group_by_length {
        info!("Reads are grouped by alignment locus and read length");
    }
    if settings.r1_only {
        info!("Only the first read of each read pair is grouped, second reads are skipped");
    }

    let mut run_stats = RunStats::default();
    for input_file in settings.input_files.iter() {
        run_stats
            .samples
            .push(process_sample(&worker_pool, &tagger, settings, input_file));
    }

    write_run_stats(&settings.output_dir, &run_stats);

    let pipeline_failure_count = run_stats.pipeline_failure_count();
    let validation_failure_count = run_stats.validation_failure_count();
    if pipeline_failure_count > 0 {
        error!("{pipeline_failure_count} sample(s) failed in the pipeline");
    }
    if validation_failure_count > 0 {
        warn!("{validation_failure_count} sample(s) failed validation");
    }

    Ok(run_stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group_tagger::TagResult;
    use crate::test_utils::*;
    use crate::umi_clustering::GroupingMethod;

    fn get_test_pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap()
    }

    fn get_test_settings(output_dir: &Utf8Path, window_size: u64) -> CleanSettings {
        CleanSettings {
            output_dir: output_dir.to_owned(),
            separator: ":".to_string(),
            grouping_method: GroupingMethod::Directional,
            max_edits: 1,
            window_size: Some(window_size),
            ..Default::default()
        }
    }

    fn get_test_tagger() -> UmiGroupTagger {
        UmiGroupTagger::new(":", GroupingMethod::Directional, 1, 1)
    }

    /// Reads in three windows with window size 100
    ///
    /// Each window has one true group of three reads and one singleton UMI.
    ///
    fn get_test_lines() -> Vec<String> {
        vec![
            sam_line("a1:AAAA", 0, "chr1", 11, ""),
            sam_line("a2:AAAA", 0, "chr1", 11, ""),
            sam_line("a3:AAAT", 0, "chr1", 11, ""),
            sam_line("s1:GGGG", 0, "chr1", 21, ""),
            sam_line("b1:CCCC", 16, "chr1", 301, ""),
            sam_line("b2:CCCC", 16, "chr1", 301, ""),
            sam_line("b3:CCCC", 16, "chr1", 301, ""),
            sam_line("s2:TTTT", 0, "chr1", 321, ""),
            sam_line("c1:ACGT", 0, "chr2", 101, ""),
            sam_line("c2:ACGT", 0, "chr2", 101, ""),
            sam_line("c3:ACGT", 0, "chr2", 101, ""),
            sam_line("s3:TGCA", 0, "chr2", 151, ""),
        ]
    }

    fn check_test_output(output_dir: &Utf8Path, stats: &SampleRunStats) {
        assert_eq!(stats.status, SampleStatus::Pass);
        assert_eq!(stats.records_in, 12);
        assert_eq!(stats.filter_stats.records_tagged, 12);
        assert_eq!(stats.filter_stats.onesie_groups_removed, 3);
        assert_eq!(stats.filter_stats.records_filtered, 9);
        assert_eq!(stats.records_out, 9);

        let cleaned_file = get_cleaned_filename(output_dir, "sample1");
        assert_eq!(stats.cleaned_file.as_deref(), Some(cleaned_file.as_str()));

        let mut qnames = read_test_qnames(&cleaned_file);
        qnames.sort();
        assert_eq!(
            qnames,
            vec![
                "a1:AAAA", "a2:AAAA", "a3:AAAT", "b1:CCCC", "b2:CCCC", "b3:CCCC", "c1:ACGT",
                "c2:ACGT", "c3:ACGT"
            ]
        );

        let group_stats = stats.group_stats.as_ref().unwrap();
        assert_eq!(group_stats.group_count, 3);
        assert_eq!(group_stats.min_group_size, 3);

        assert!(Utf8PathBuf::from(format!("{cleaned_file}.csi")).exists());
        assert!(get_coverage_report_filename(&cleaned_file).exists());
    }

    #[test]
    fn test_single_window_pipeline() {
        let (_tmp, dir) = get_test_dir();
        let input = write_test_bam(&dir, "sample1.bam", &get_test_lines(), false);
        let output_dir = dir.join("cleaned");
        std::fs::create_dir(&output_dir).unwrap();

        let settings = get_test_settings(&output_dir, 0);
        let stats = process_sample(&get_test_pool(), &get_test_tagger(), &settings, &input);
        check_test_output(&output_dir, &stats);
        assert_eq!(stats.window_size, 0);
        assert_eq!(stats.window_count, 1);

        // Tagged intermediate is removed on success
        assert!(!get_unsplit_tagged_filename(&output_dir, "sample1").exists());

        // Without clobber, existing output is a configuration error
        let stats = process_sample(&get_test_pool(), &get_test_tagger(), &settings, &input);
        assert!(matches!(
            stats.status,
            SampleStatus::PipelineFailure {
                stage: PipelineStage::Setup,
                ..
            }
        ));

        let settings = CleanSettings {
            clobber: true,
            ..get_test_settings(&output_dir, 0)
        };
        let stats = process_sample(&get_test_pool(), &get_test_tagger(), &settings, &input);
        check_test_output(&output_dir, &stats);
    }

    #[test]
    fn test_multi_window_pipeline() {
        let (_tmp, dir) = get_test_dir();
        let input = write_test_bam(&dir, "sample1.bam", &get_test_lines(), true);
        let output_dir = dir.join("cleaned");
        std::fs::create_dir(&output_dir).unwrap();

        let settings = CleanSettings {
            delete_temps: true,
            ..get_test_settings(&output_dir, 100)
        };
        let stats = process_sample(&get_test_pool(), &get_test_tagger(), &settings, &input);
        check_test_output(&output_dir, &stats);
        assert_eq!(stats.window_size, 100);
        assert_eq!(stats.window_count, 3);

        // Window directory is removed after merge
        assert!(!get_split_dir(&output_dir, "sample1", 100).exists());

        // Group tags are unique across windows
        let cleaned_file = get_cleaned_filename(&output_dir, "sample1");
        let mut tags = read_test_group_tags(&cleaned_file);
        tags.dedup();
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn test_window_size_does_not_change_output() {
        let (_tmp, dir) = get_test_dir();

        // Unmapped reads placed at their mate's position, in two different windows
        let mut lines = get_test_lines();
        lines.insert(4, sam_line("u1:GGGG", 4, "chr1", 21, ""));
        lines.insert(9, sam_line("u2:GGGG", 4, "chr1", 501, ""));
        lines.push(sam_line("x1:CCCC", 4, "*", 0, ""));
        lines.push(sam_line("x2:CCCC", 4, "*", 0, ""));
        let input = write_test_bam(&dir, "sample1.bam", &lines, true);

        let mut cleaned_records = Vec::new();
        for window_size in [0, 100] {
            let output_dir = dir.join(format!("cleaned_{window_size}"));
            std::fs::create_dir(&output_dir).unwrap();
            let settings = get_test_settings(&output_dir, window_size);
            let stats = process_sample(&get_test_pool(), &get_test_tagger(), &settings, &input);
            assert_eq!(stats.status, SampleStatus::Pass);
            assert_eq!(stats.records_in, 16);

            let cleaned_file = get_cleaned_filename(&output_dir, "sample1");
            let records = read_test_bam(&cleaned_file)
                .iter()
                .map(|x| (String::from_utf8(x.qname().to_vec()).unwrap(), x.tid(), x.pos()))
                .collect::<Vec<_>>();
            cleaned_records.push(records);
        }
        assert_eq!(cleaned_records[0], cleaned_records[1]);

        // Both placed unmapped reads are onesies at their own position
        let qnames = cleaned_records[0]
            .iter()
            .map(|(x, _, _)| x.as_str())
            .collect::<Vec<_>>();
        assert!(!qnames.contains(&"u1:GGGG"));
        assert!(!qnames.contains(&"u2:GGGG"));
        assert!(qnames.contains(&"x1:CCCC"));
        assert_eq!(qnames.len(), 11);
    }

    #[test]
    fn test_single_window_filter_failure() {
        let (_tmp, dir) = get_test_dir();
        let input = write_test_bam(&dir, "sample1.bam", &get_test_lines(), false);
        let output_dir = dir.join("cleaned");
        std::fs::create_dir(&output_dir).unwrap();

        let settings = get_test_settings(&output_dir, 0);
        let stats = process_sample(&get_test_pool(), &UntaggedTagger, &settings, &input);
        assert!(matches!(
            stats.status,
            SampleStatus::PipelineFailure {
                stage: PipelineStage::Filter,
                ..
            }
        ));
        assert!(stats.cleaned_file.is_none());
        assert!(!get_cleaned_filename(&output_dir, "sample1").exists());
        assert!(!get_unsplit_filtered_filename(&output_dir, "sample1").exists());

        // The tagged intermediate is kept for diagnosis
        assert!(get_unsplit_tagged_filename(&output_dir, "sample1").exists());

        // A rerun is not blocked by leftover output
        let stats = process_sample(&get_test_pool(), &get_test_tagger(), &settings, &input);
        check_test_output(&output_dir, &stats);
    }

    #[test]
    fn test_check_merged_record_count() {
        let filter_stats = FilterStats {
            records_filtered: 9,
            ..Default::default()
        };
        assert!(check_merged_record_count(9, &filter_stats).is_ok());
        assert!(matches!(
            check_merged_record_count(8, &filter_stats),
            Err(PipelineError::PartialData(_))
        ));
    }

    #[test]
    fn test_no_report_pipeline() {
        let (_tmp, dir) = get_test_dir();
        let input = write_test_bam(&dir, "sample1.bam", &get_test_lines(), true);
        let output_dir = dir.join("cleaned");
        std::fs::create_dir(&output_dir).unwrap();

        let settings = CleanSettings {
            no_report: true,
            ..get_test_settings(&output_dir, 100)
        };
        let stats = process_sample(&get_test_pool(), &get_test_tagger(), &settings, &input);
        assert_eq!(stats.status, SampleStatus::Pass);
        assert_eq!(stats.records_out, 9);

        let cleaned_file = get_cleaned_filename(&output_dir, "sample1");
        assert!(cleaned_file.exists());
        assert!(!Utf8PathBuf::from(format!("{cleaned_file}.csi")).exists());
        assert!(!get_coverage_report_filename(&cleaned_file).exists());
    }

    #[test]
    fn test_split_requires_index() {
        let (_tmp, dir) = get_test_dir();
        let input = write_test_bam(&dir, "sample1.bam", &get_test_lines(), false);
        let output_dir = dir.join("cleaned");
        std::fs::create_dir(&output_dir).unwrap();

        let settings = get_test_settings(&output_dir, 100);
        let stats = process_sample(&get_test_pool(), &get_test_tagger(), &settings, &input);
        assert!(matches!(
            stats.status,
            SampleStatus::PipelineFailure {
                stage: PipelineStage::Setup,
                ..
            }
        ));
    }

    /// Tagger which gives every record in a window the same tag, unless the window is set to fail
    struct FixedTagger {
        tag: String,
        failing_window: Option<usize>,
    }

    impl GroupTagger for FixedTagger {
        fn tag(
            &self,
            input_file: &Utf8Path,
            output_file: &Utf8Path,
            window_index: usize,
        ) -> SimpleResult<TagResult> {
            if self.failing_window == Some(window_index) {
                bail!("Simulated tagger failure");
            }
            let mut reader = open_bam_reader(input_file, 1)?;
            let header = bam::Header::from_template(reader.header());
            let mut writer = crate::bam_utils::create_bam_writer(output_file, &header, 1)?;
            let mut record_count = 0;
            for record in reader.records() {
                let mut record = record.unwrap();
                crate::bam_utils::set_group_tag(&mut record, &self.tag)?;
                writer.write(&record).unwrap();
                record_count += 1;
            }
            Ok(TagResult {
                record_count,
                skipped_count: 0,
                group_count: 1,
            })
        }
    }

    /// Tagger which copies its input without adding any group tag
    struct UntaggedTagger;

    impl GroupTagger for UntaggedTagger {
        fn tag(
            &self,
            input_file: &Utf8Path,
            output_file: &Utf8Path,
            _window_index: usize,
        ) -> SimpleResult<TagResult> {
            std::fs::copy(input_file, output_file).unwrap();
            Ok(TagResult {
                record_count: read_test_bam(input_file).len(),
                skipped_count: 0,
                group_count: 0,
            })
        }
    }

    #[test]
    fn test_tag_collision_across_windows() {
        let (_tmp, dir) = get_test_dir();

        // Two windows, each holding two unrelated reads
        let lines = vec![
            sam_line("a1:AAAA", 0, "chr1", 11, ""),
            sam_line("a2:CCCC", 0, "chr1", 51, ""),
            sam_line("b1:GGGG", 0, "chr1", 311, ""),
            sam_line("b2:TTTT", 0, "chr1", 351, ""),
        ];
        let input = write_test_bam(&dir, "sample1.bam", &lines, true);
        let output_dir = dir.join("cleaned");
        std::fs::create_dir(&output_dir).unwrap();

        let settings = get_test_settings(&output_dir, 100);
        let tagger = FixedTagger {
            tag: "G7".to_string(),
            failing_window: None,
        };
        let stats = process_sample(&get_test_pool(), &tagger, &settings, &input);

        // The colliding tag spans both windows with multiplicity 4, so the validator can't see
        // that the groups are unrelated
        assert_eq!(stats.status, SampleStatus::Pass);
        let cleaned_file = get_cleaned_filename(&output_dir, "sample1");
        let tags = read_test_group_tags(&cleaned_file);
        assert_eq!(tags, vec!["G7"; 4]);

        // Window-salted tags keep the windows distinct, and every read is a onesie here
        let settings = CleanSettings {
            clobber: true,
            ..get_test_settings(&output_dir, 100)
        };
        let stats = process_sample(&get_test_pool(), &get_test_tagger(), &settings, &input);
        assert_eq!(stats.status, SampleStatus::Pass);
        assert_eq!(stats.filter_stats.onesie_groups_removed, 4);
        assert_eq!(stats.records_out, 0);
    }

    #[test]
    fn test_window_failure() {
        let (_tmp, dir) = get_test_dir();
        let input = write_test_bam(&dir, "sample1.bam", &get_test_lines(), true);
        let output_dir = dir.join("cleaned");
        std::fs::create_dir(&output_dir).unwrap();

        let settings = get_test_settings(&output_dir, 100);
        let tagger = FixedTagger {
            tag: "G7".to_string(),
            failing_window: Some(3),
        };
        let stats = process_sample(&get_test_pool(), &tagger, &settings, &input);
        assert!(matches!(
            stats.status,
            SampleStatus::PipelineFailure {
                stage: PipelineStage::Tag,
                ..
            }
        ));
        assert!(stats.cleaned_file.is_none());
        assert!(!get_cleaned_filename(&output_dir, "sample1").exists());

        // Intermediates are kept for diagnosis
        let split_dir = get_split_dir(&output_dir, "sample1", 100);
        assert!(split_dir.exists());
        assert!(crate::filenames::get_window_filename(&split_dir, 3).exists());
    }

    #[test]
    fn test_run_clean_batch() {
        let (_tmp, dir) = get_test_dir();
        let input1 = write_test_bam(&dir, "sample1.bam", &get_test_lines(), false);
        let input2 = dir.join("sample2.bam");
        std::fs::write(&input2, "not an alignment file").unwrap();
        let output_dir = dir.join("cleaned");
        std::fs::create_dir(&output_dir).unwrap();

        let shared_settings = crate::cli::SharedSettings {
            thread_count: 2,
            ..Default::default()
        };
        let settings = CleanSettings {
            input_files: vec![input1, input2],
            ..get_test_settings(&output_dir, 0)
        };
        let run_stats = run_clean(&shared_settings, &settings).unwrap();
        assert_eq!(run_stats.samples.len(), 2);
        assert_eq!(run_stats.samples[0].status, SampleStatus::Pass);
        assert_eq!(run_stats.pipeline_failure_count(), 1);
        assert_eq!(run_stats.get_exit_code(), exitcode::SOFTWARE);
        assert!(output_dir.join(crate::filenames::RUN_STATS_FILENAME).exists());
    }
}
