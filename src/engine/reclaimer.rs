//! Entropy-ranked batch reclamation.
//!
//! Classifies tracked stack regions by a composite reclaimability score and
//! frees the lowest-ranked batch in one pass. Scores are a lazy view over
//! the signals the store records; nothing here persists between calls.
//!
//! The score for a region is
//!
//! ```text
//! score = PRIORITY_WEIGHT * priority
//!       + FREQ_WEIGHT     * (1 / (1 + access_count))
//!       + PURITY_WEIGHT   * (1 - purity)
//! ```
//!
//! with lower scores more reclaimable. Scores quantize into rank buckets of
//! [`RANK_BUCKET_WIDTH`]; a `collect` frees every eligible region in the
//! occupied lowest bucket ("rank zero") and compacts the stack.

use crate::engine::store::{Region, Store, DEFAULT_PRIORITY};

/// Weight applied to the explicit priority signal.
pub const PRIORITY_WEIGHT: f32 = 0.5;

/// Weight applied to the inverse access frequency signal.
pub const FREQ_WEIGHT: f32 = 0.3;

/// Weight applied to the impurity (dead bit fraction) signal.
pub const PURITY_WEIGHT: f32 = 0.2;

/// Width of one rank bucket in score units.
pub const RANK_BUCKET_WIDTH: f32 = 0.25;

/// Result of one reclamation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReclaimReport {
    pub bytes_freed: usize,
    pub regions_freed: usize,
}

/// Composite reclaimability score for one region; lower is more
/// reclaimable.
pub fn entropy_score(region: &Region) -> f32 {
    PRIORITY_WEIGHT * f32::from(region.priority())
        + FREQ_WEIGHT * (1.0 / (1.0 + region.access_count() as f32))
        + PURITY_WEIGHT * (1.0 - region.purity())
}

/// Quantizes a score into its rank bucket.
pub fn rank(score: f32) -> u32 {
    (score / RANK_BUCKET_WIDTH) as u32
}

/// Reclamation policy. Selection happens here; the store performs the
/// actual slice surgery.
#[derive(Debug, Default)]
pub struct Reclaimer;

impl Reclaimer {
    pub fn new() -> Self {
        Self
    }

    /// Frees every eligible region in the lowest occupied rank bucket.
    ///
    /// Regions with priority above [`DEFAULT_PRIORITY`] are protected and
    /// skipped unless `force` is set. Runs only when invoked by the epoch
    /// scheduler, the `PURGE_EPOCH` opcode, or the idle trigger; never
    /// implicitly during pushes or pops. Cannot fail: with no eligible
    /// region the report is zero-valued.
    pub fn collect(&self, store: &mut Store, force: bool) -> ReclaimReport {
        let mut candidates: Vec<(usize, u32)> = store
            .regions()
            .iter()
            .enumerate()
            .filter(|(_, region)| force || region.priority() <= DEFAULT_PRIORITY)
            .map(|(idx, region)| (idx, rank(entropy_score(region))))
            .collect();
        let Some(lowest) = candidates.iter().map(|&(_, r)| r).min() else {
            return ReclaimReport::default();
        };
        candidates.retain(|&(_, r)| r == lowest);

        let indices: Vec<usize> = candidates.into_iter().map(|(idx, _)| idx).collect();
        let bytes_freed = store.release(&indices);
        ReclaimReport {
            bytes_freed,
            regions_freed: indices.len(),
        }
    }
}
