//! UMI clustering policies applied to all reads sharing one alignment locus
//!

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Named clustering policy used to decide which UMIs at one locus came from the same molecule
///
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, clap::ValueEnum, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum GroupingMethod {
    /// Each distinct UMI forms its own group
    Raw,

    /// Absorb lower count UMIs within the edit threshold, transitively through the absorbed UMIs
    #[default]
    Directional,

    /// Absorb lower count UMIs within the edit threshold of the group's top UMI only
    Acyclic,
}

impl GroupingMethod {
    pub fn new_clusterer(&self, max_edits: u32) -> Box<dyn UmiClusterer> {
        match self {
            Self::Raw => Box::new(RawClusterer),
            Self::Directional => Box::new(DirectionalClusterer {
                max_edits,
                transitive: true,
            }),
            Self::Acyclic => Box::new(DirectionalClusterer {
                max_edits,
                transitive: false,
            }),
        }
    }
}

/// Distinct UMI observed at a locus and the number of reads carrying it
pub struct UmiCount<'a> {
    pub umi: &'a [u8],
    pub count: usize,
}

pub trait UmiClusterer: Send + Sync {
    /// Partition the UMIs into groups
    ///
    /// Returns groups of indices into `umi_counts`. Every index appears in exactly one group.
    /// The result must be deterministic for the same input.
    ///
    fn cluster(&self, umi_counts: &[UmiCount]) -> Vec<Vec<usize>>;
}

/// Get UMI indices ordered from highest to lowest read count, with ties broken by UMI sequence
///
fn get_count_order(umi_counts: &[UmiCount]) -> Vec<usize> {
    let mut order = (0..umi_counts.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        umi_counts[b]
            .count
            .cmp(&umi_counts[a].count)
            .then(umi_counts[a].umi.cmp(umi_counts[b].umi))
    });
    order
}

/// Count mismatched bases between two UMIs
///
/// Returns None when the UMIs differ in length.
///
pub fn count_mismatches(a: &[u8], b: &[u8]) -> Option<usize> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b).filter(|(x, y)| x != y).count())
}

struct RawClusterer;

impl UmiClusterer for RawClusterer {
    fn cluster(&self, umi_counts: &[UmiCount]) -> Vec<Vec<usize>> {
        get_count_order(umi_counts)
            .into_iter()
            .map(|x| vec![x])
            .collect()
    }
}

struct DirectionalClusterer {
    max_edits: u32,

    /// If false, only the group's top UMI can absorb other UMIs
    transitive: bool,
}

impl DirectionalClusterer {
    /// True if UMI `a` can absorb UMI `b`
    fn is_edge(&self, a: &UmiCount, b: &UmiCount) -> bool {
        if a.count < (2 * b.count).saturating_sub(1) {
            return false;
        }
        match count_mismatches(a.umi, b.umi) {
            Some(mismatches) => mismatches > 0 && mismatches <= self.max_edits as usize,
            None => false,
        }
    }
}

impl UmiClusterer for DirectionalClusterer {
    fn cluster(&self, umi_counts: &[UmiCount]) -> Vec<Vec<usize>> {
        let order = get_count_order(umi_counts);
        let mut assigned = vec![false; umi_counts.len()];
        let mut groups = Vec::new();

        for &head in order.iter() {
            if assigned[head] {
                continue;
            }
            assigned[head] = true;
            let mut group = vec![head];
            let mut queue = VecDeque::from([head]);
            while let Some(node) = queue.pop_front() {
                for &other in order.iter() {
                    if assigned[other] || !self.is_edge(&umi_counts[node], &umi_counts[other]) {
                        continue;
                    }
                    assigned[other] = true;
                    group.push(other);
                    if self.transitive {
                        queue.push_back(other);
                    }
                }
            }
            groups.push(group);
        }
        groups
    }
}
