//! Gradient accumulation and clipping policies.

use kiln_core::{AccumulateGradBatches, Result, TrainModule};

/// Resolves the accumulation factor for an epoch and decides which batches
/// close an accumulation window.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulationPolicy {
    schedule: AccumulateGradBatches,
}

impl AccumulationPolicy {
    /// Create from the configured value.
    pub fn new(schedule: AccumulateGradBatches) -> Self {
        Self { schedule }
    }

    /// Factor in effect for `epoch` (0-based).
    ///
    /// For a schedule, the entry with the largest key not above `epoch`
    /// applies; epochs before the first key accumulate nothing.
    pub fn factor(&self, epoch: usize) -> usize {
        match &self.schedule {
            AccumulateGradBatches::Fixed(n) => (*n).max(1),
            AccumulateGradBatches::Schedule(schedule) => schedule
                .range(..=epoch)
                .next_back()
                .map(|(_, factor)| (*factor).max(1))
                .unwrap_or(1),
        }
    }

    /// Whether the optimizer steps after `batch_idx`.
    ///
    /// A window closes every `factor` batches and at the last batch of the
    /// epoch, so an epoch of `n` batches takes `ceil(n / factor)` steps.
    pub fn should_step(&self, batch_idx: usize, factor: usize, is_last_batch: bool) -> bool {
        (batch_idx + 1) % factor.max(1) == 0 || is_last_batch
    }
}

/// Norm-based gradient clipping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippingPolicy {
    max_norm: f64,
}

const CLIP_EPS: f64 = 1e-6;

impl ClippingPolicy {
    /// Clip to `max_norm`; zero disables clipping.
    pub fn new(max_norm: f64) -> Self {
        Self { max_norm }
    }

    /// Whether clipping is active.
    pub fn enabled(&self) -> bool {
        self.max_norm > 0.0
    }

    /// Scale factor to apply to gradients with total norm `norm`, if any.
    pub fn coefficient(&self, norm: f64) -> Option<f64> {
        if !self.enabled() {
            return None;
        }
        let coef = self.max_norm / (norm + CLIP_EPS);
        (coef < 1.0).then_some(coef)
    }

    /// Clip the module's gradients in place. Returns the pre-clip norm.
    pub fn clip<M: TrainModule + ?Sized>(&self, model: &mut M) -> Result<Option<f64>> {
        if !self.enabled() {
            return Ok(None);
        }
        let Some(norm) = model.gradient_norm() else {
            return Ok(None);
        };
        if let Some(coef) = self.coefficient(norm) {
            tracing::trace!(norm, coef, "clipping gradients");
            model.scale_gradients(coef)?;
        }
        Ok(Some(norm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn steps_in_epoch(policy: &AccumulationPolicy, epoch: usize, n: usize) -> usize {
        let factor = policy.factor(epoch);
        (0..n)
            .filter(|&i| policy.should_step(i, factor, i + 1 == n))
            .count()
    }

    #[test]
    fn test_fixed_factor_step_count() {
        let policy = AccumulationPolicy::new(AccumulateGradBatches::Fixed(4));
        assert_eq!(steps_in_epoch(&policy, 0, 10), 3);
        assert_eq!(steps_in_epoch(&policy, 0, 8), 2);
        assert_eq!(steps_in_epoch(&policy, 0, 1), 1);
    }

    #[test]
    fn test_schedule_lookup() {
        let schedule = BTreeMap::from([(2, 3), (5, 8)]);
        let policy = AccumulationPolicy::new(AccumulateGradBatches::Schedule(schedule));
        assert_eq!(policy.factor(0), 1);
        assert_eq!(policy.factor(1), 1);
        assert_eq!(policy.factor(2), 3);
        assert_eq!(policy.factor(4), 3);
        assert_eq!(policy.factor(5), 8);
        assert_eq!(policy.factor(100), 8);
    }

    #[test]
    fn test_ceil_property_over_schedule() {
        let schedule = BTreeMap::from([(0, 2), (1, 3), (3, 5)]);
        let policy = AccumulationPolicy::new(AccumulateGradBatches::Schedule(schedule));
        for epoch in 0..5 {
            for n in 1..30 {
                let f = policy.factor(epoch);
                assert_eq!(steps_in_epoch(&policy, epoch, n), n.div_ceil(f));
            }
        }
    }

    #[test]
    fn test_clip_coefficient() {
        let clip = ClippingPolicy::new(1.0);
        assert!(clip.coefficient(0.5).is_none());
        let coef = clip.coefficient(4.0).unwrap();
        assert!((coef - 0.25).abs() < 1e-6);
        assert!(ClippingPolicy::new(0.0).coefficient(100.0).is_none());
    }
}
