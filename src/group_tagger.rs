//! Assign a UMI group tag to every read of a coordinate-sorted alignment file
//!
//! Reads are bundled by alignment locus, mapping state and strand. A bundle is complete once the
//! input stream has moved past its locus, because no later read in a sorted stream can have an
//! earlier locus. Each complete bundle is clustered by UMI and every cluster is written out with
//! one new group tag. Only reads without a chromosome are pooled by UMI across the whole input.
//!

use std::collections::BTreeMap;

use camino::Utf8Path;
use log::debug;
use rust_htslib::bam::{self, Read};
use simple_error::{SimpleResult, bail, try_with};

use crate::bam_utils::{
    AlignmentLocus, create_bam_writer, get_alignment_locus, get_output_header, get_umi,
    open_bam_reader, set_group_tag,
};
use crate::umi_clustering::{GroupingMethod, UmiClusterer, UmiCount};

pub struct TagResult {
    /// Number of records written to the tagged output
    pub record_count: usize,

    /// Number of input records left out of grouping and the tagged output
    pub skipped_count: usize,

    /// Number of distinct group tags assigned
    pub group_count: usize,
}

/// Transform assigning group tags to an alignment file
///
/// Implementations must write every input record exactly once with exactly one group tag, apart
/// from records reported in `TagResult::skipped_count`, and must be deterministic for the same input. Tags must be unique across windows of the same
/// sample, so `window_index` is expected to be part of each tag value.
///
pub trait GroupTagger: Sync {
    fn tag(
        &self,
        input_file: &Utf8Path,
        output_file: &Utf8Path,
        window_index: usize,
    ) -> SimpleResult<TagResult>;
}

/// Format the group tag for one group in one window
pub fn get_group_tag_value(window_index: usize, group_index: usize) -> String {
    format!("{window_index}-{group_index}")
}

/// Reads sharing a bundle key are candidates for the same UMI group
///
/// The locus must stay the first field, so that bundles are ordered by locus first.
///
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd)]
struct BundleKey {
    locus: AlignmentLocus,
    is_unmapped: bool,
    is_reverse: bool,

    /// Read length, only set when grouping by length
    read_length: usize,
}

impl BundleKey {
    /// Smallest key at `locus`
    fn locus_start(locus: AlignmentLocus) -> Self {
        Self {
            locus,
            ..Default::default()
        }
    }
}

/// All reads at one locus keyed by UMI
type UmiBundle = BTreeMap<Vec<u8>, Vec<bam::Record>>;

struct TaggedBundleWriter<'a> {
    writer: bam::Writer,
    clusterer: &'a dyn UmiClusterer,
    window_index: usize,
    record_count: usize,
    group_count: usize,
}

impl TaggedBundleWriter<'_> {
    fn write_bundle(&mut self, bundle: UmiBundle) -> SimpleResult<()> {
        let bundle = bundle.into_iter().collect::<Vec<_>>();
        let umi_counts = bundle
            .iter()
            .map(|(umi, reads)| UmiCount {
                umi: umi.as_slice(),
                count: reads.len(),
            })
            .collect::<Vec<_>>();
        let groups = self.clusterer.cluster(&umi_counts);

        let mut umi_reads = bundle.into_iter().map(|(_, x)| x).collect::<Vec<_>>();
        for group in groups {
            let group_tag = get_group_tag_value(self.window_index, self.group_count);
            self.group_count += 1;
            for umi_index in group {
                for mut record in std::mem::take(&mut umi_reads[umi_index]) {
                    set_group_tag(&mut record, &group_tag)?;
                    try_with!(self.writer.write(&record), "Failed to write tagged record");
                    self.record_count += 1;
                }
            }
        }
        Ok(())
    }

    /// Write all bundles with a locus before `locus`
    fn write_bundles_before(
        &mut self,
        bundles: &mut BTreeMap<BundleKey, UmiBundle>,
        locus: AlignmentLocus,
    ) -> SimpleResult<()> {
        let remaining = bundles.split_off(&BundleKey::locus_start(locus));
        for (_, bundle) in std::mem::replace(bundles, remaining) {
            self.write_bundle(bundle)?;
        }
        Ok(())
    }
}

/// In-process UMI grouping, with the UMI taken from each read name
///
pub struct UmiGroupTagger {
    separator: String,
    clusterer: Box<dyn UmiClusterer>,
    thread_count: usize,

    /// Add the read length to the bundle key
    group_by_length: bool,

    /// Group only the first read of each pair, the second read is skipped
    r1_only: bool,
}

impl UmiGroupTagger {
    pub fn new(
        separator: &str,
        grouping_method: GroupingMethod,
        max_edits: u32,
        thread_count: usize,
    ) -> Self {
        Self {
            separator: separator.to_string(),
            clusterer: grouping_method.new_clusterer(max_edits),
            thread_count,
            group_by_length: false,
            r1_only: false,
        }
    }

    #[must_use]
    pub fn group_by_length(mut self, enabled: bool) -> Self {
        self.group_by_length = enabled;
        self
    }

    #[must_use]
    pub fn r1_only(mut self, enabled: bool) -> Self {
        self.r1_only = enabled;
        self
    }

    fn is_skipped(&self, record: &bam::Record) -> bool {
        self.r1_only && record.is_paired() && record.is_last_in_template()
    }

    fn get_bundle_key(&self, record: &bam::Record, locus: AlignmentLocus) -> BundleKey {
        let is_unmapped = record.is_unmapped();
        BundleKey {
            locus,
            is_unmapped,
            is_reverse: !is_unmapped && record.is_reverse(),
            read_length: if self.group_by_length {
                record.seq_len()
            } else {
                0
            },
        }
    }
}

impl GroupTagger for UmiGroupTagger {
    fn tag(
        &self,
        input_file: &Utf8Path,
        output_file: &Utf8Path,
        window_index: usize,
    ) -> SimpleResult<TagResult> {
        let mut reader = open_bam_reader(input_file, self.thread_count)?;
        let header = get_output_header(reader.header());
        let mut writer = TaggedBundleWriter {
            writer: create_bam_writer(output_file, &header, self.thread_count)?,
            clusterer: self.clusterer.as_ref(),
            window_index,
            record_count: 0,
            group_count: 0,
        };

        let mut bundles = BTreeMap::new();

        // Reads without a chromosome are grouped by UMI alone once the whole input is read
        let mut unplaced_bundle = UmiBundle::new();

        let mut last_locus = None;
        let mut input_count = 0;
        let mut skipped_count = 0;
        for result in reader.records() {
            let record = try_with!(result, "Failed to parse alignment record from '{input_file}'");
            input_count += 1;

            let umi = match get_umi(record.qname(), &self.separator) {
                Some(x) => x.to_vec(),
                None => bail!(
                    "Can't find UMI after separator '{}' in read name '{}'",
                    self.separator,
                    String::from_utf8_lossy(record.qname())
                ),
            };

            if record.tid() >= 0 {
                let start = AlignmentLocus {
                    chrom_index: record.tid() as usize,
                    pos: record.pos(),
                };
                if let Some(last_locus) = last_locus {
                    if start < last_locus {
                        bail!("Alignment file is not coordinate sorted: '{input_file}'");
                    }
                }
                last_locus = Some(start);
                writer.write_bundles_before(&mut bundles, start)?;
            }

            if self.is_skipped(&record) {
                skipped_count += 1;
                continue;
            }

            match get_alignment_locus(&record) {
                Some(locus) => {
                    let key = self.get_bundle_key(&record, locus);
                    bundles
                        .entry(key)
                        .or_default()
                        .entry(umi)
                        .or_default()
                        .push(record);
                }
                None => {
                    unplaced_bundle.entry(umi).or_default().push(record);
                }
            }
        }

        for (_, bundle) in std::mem::take(&mut bundles) {
            writer.write_bundle(bundle)?;
        }
        if !unplaced_bundle.is_empty() {
            writer.write_bundle(unplaced_bundle)?;
        }

        if writer.record_count + skipped_count != input_count {
            bail!(
                "Tagged record count {} and skipped record count {skipped_count} do not match input record count {input_count}",
                writer.record_count
            );
        }

        debug!(
            "Tagged {} records into {} groups for window {window_index}",
            writer.record_count, writer.group_count
        );

        Ok(TagResult {
            record_count: writer.record_count,
            skipped_count,
            group_count: writer.group_count,
        })
    }
}
