//! Count the records carrying each UMI group tag in an alignment file
//!

use std::collections::{BTreeMap, HashMap, HashSet};

use camino::Utf8Path;
use rust_htslib::bam::{self, Read};
use serde::{Deserialize, Serialize};
use simple_error::{SimpleResult, try_with};

use crate::bam_utils::{get_group_tag, open_bam_reader};

#[derive(Default)]
pub struct GroupTally {
    pub counts: HashMap<String, usize>,

    /// Records found without any group tag
    pub untagged_count: usize,
}

/// Summary of group sizes
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct GroupSizeStats {
    pub group_count: usize,
    pub min_group_size: usize,
    pub max_group_size: usize,
    pub mean_group_size: f64,
}

impl GroupTally {
    pub fn add(&mut self, group_tag: Option<String>) {
        match group_tag {
            Some(x) => *self.counts.entry(x).or_insert(0) += 1,
            None => self.untagged_count += 1,
        }
    }

    /// Tally group tags in one pass over the file
    pub fn from_bam(filename: &Utf8Path, thread_count: usize) -> SimpleResult<Self> {
        let mut reader = open_bam_reader(filename, thread_count)?;
        let mut tally = Self::default();
        let mut record = bam::Record::new();
        while let Some(r) = reader.read(&mut record) {
            try_with!(r, "Failed to parse alignment record from '{filename}'");
            tally.add(get_group_tag(&record)?);
        }
        Ok(tally)
    }

    pub fn tagged_record_count(&self) -> usize {
        self.counts.values().sum()
    }

    /// Group tags observed exactly once
    pub fn get_onesies(&self) -> HashSet<String> {
        self.counts
            .iter()
            .filter(|(_, count)| **count == 1)
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    pub fn onesie_count(&self) -> usize {
        self.counts.values().filter(|x| **x == 1).count()
    }

    /// Map from group size to number of groups of that size
    pub fn get_multiplicity_histogram(&self) -> BTreeMap<usize, usize> {
        let mut hist = BTreeMap::new();
        for count in self.counts.values() {
            *hist.entry(*count).or_insert(0) += 1;
        }
        hist
    }

    pub fn get_group_size_stats(&self) -> GroupSizeStats {
        let group_count = self.counts.len();
        if group_count == 0 {
            return GroupSizeStats::default();
        }
        GroupSizeStats {
            group_count,
            min_group_size: self.counts.values().copied().min().unwrap_or(0),
            max_group_size: self.counts.values().copied().max().unwrap_or(0),
            mean_group_size: self.tagged_record_count() as f64 / group_count as f64,
        }
    }
}
