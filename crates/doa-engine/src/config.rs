use doa_core::{DomainError, DomainResult, Granularity, Metric, Policy, Polarity, ThresholdKey};
use serde::{Deserialize, Serialize};

/// Salt separating augmentation draws from splitter shuffles seeded with the same value.
const AUGMENTATION_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

/// Move a random share of each outer training partition into its test partition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestAugmentation {
    /// Fraction of the nominal training partition to move, in `(0, 1)`.
    pub fraction: f64,
    /// Base seed of the augmentation draws.
    pub seed: u64,
}

impl TestAugmentation {
    /// Seed of fold `fold_id`'s draw.
    ///
    /// Salted so that a splitter seeded with `seed` never replays the same stream.
    pub fn fold_seed(&self, fold_id: usize) -> u64 {
        (self.seed ^ AUGMENTATION_STREAM).wrapping_add(fold_id as u64)
    }
}

/// Knobs of one assessment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentConfig {
    /// Equal-count bins used for binned thresholds.
    pub bins: usize,
    /// A bin is in-domain iff its CDF miscalibration area is below this.
    pub bin_area_cutoff: f64,
    /// One minimum-precision policy per target.
    pub precision_targets: Vec<f64>,
    /// Splitter whose records fit the calibration model.
    pub calibration_role: String,
    pub test_augmentation: Option<TestAugmentation>,
    /// Worker threads for outer folds. `None` uses every core.
    pub threads: Option<usize>,
}

impl Default for AssessmentConfig {
    fn default() -> Self {
        Self {
            bins: 10,
            bin_area_cutoff: 0.05,
            precision_targets: vec![0.95],
            calibration_role: "calibration".to_string(),
            test_augmentation: None,
            threads: None,
        }
    }
}

impl AssessmentConfig {
    pub fn validate(&self) -> DomainResult<()> {
        if self.bins < 1 {
            return Err(DomainError::InvalidConfig("bins must be at least 1".to_string()));
        }
        if !(self.bin_area_cutoff > 0.0) {
            return Err(DomainError::InvalidConfig(format!(
                "bin_area_cutoff must be positive, got {}",
                self.bin_area_cutoff
            )));
        }
        if let Some(bad) = self
            .precision_targets
            .iter()
            .find(|t| !(**t > 0.0 && **t <= 1.0))
        {
            return Err(DomainError::InvalidConfig(format!(
                "precision target {} is outside (0, 1]",
                bad
            )));
        }
        if let Some(aug) = &self.test_augmentation {
            if !(aug.fraction > 0.0 && aug.fraction < 1.0) {
                return Err(DomainError::InvalidConfig(format!(
                    "test augmentation fraction {} is outside (0, 1)",
                    aug.fraction
                )));
            }
        }
        if self.threads == Some(0) {
            return Err(DomainError::InvalidConfig("threads must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn policies(&self) -> Vec<Policy> {
        std::iter::once(Policy::MaxF1)
            .chain(self.precision_targets.iter().map(|t| Policy::MinPrecision(*t)))
            .collect()
    }

    /// Every threshold key a fitted model can hold, in a stable order.
    pub fn threshold_keys(&self) -> Vec<ThresholdKey> {
        let policies = self.policies();
        let mut keys = Vec::new();
        for granularity in [Granularity::Point, Granularity::Binned] {
            for metric in Metric::ALL {
                for polarity in Polarity::ALL {
                    for policy in &policies {
                        keys.push(ThresholdKey {
                            metric,
                            polarity,
                            policy: *policy,
                            granularity,
                        });
                    }
                }
            }
        }
        keys
    }
}
