use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Residual-to-sigma ratio below which a sample counts as in-domain.
pub const IN_DOMAIN_CUTOFF: f64 = 1.0;

/// Ground-truth domain label: `|y - y_pred| / sigma_y < 1`.
///
/// A zero or non-finite `sigma_y` yields `false`.
pub fn ground_truth_in_domain(y: f64, y_pred: f64, sigma_y: f64) -> bool {
    (y - y_pred).abs() / sigma_y < IN_DOMAIN_CUTOFF
}

/// Features, targets and group labels sharing one index domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    x: Vec<Vec<f64>>,
    y: Vec<f64>,
    g: Vec<String>,
}

impl Dataset {
    /// Build a dataset, rejecting mismatched lengths and ragged rows.
    ///
    /// When `g` is `None` every sample is placed in the same group.
    pub fn new(x: Vec<Vec<f64>>, y: Vec<f64>, g: Option<Vec<String>>) -> DomainResult<Self> {
        if x.is_empty() {
            return Err(DomainError::DataShape("dataset has no samples".to_string()));
        }
        let g = g.unwrap_or_else(|| vec!["0".to_string(); x.len()]);
        if x.len() != y.len() || x.len() != g.len() {
            return Err(DomainError::DataShape(format!(
                "len(X)={}, len(y)={}, len(g)={} must match",
                x.len(),
                y.len(),
                g.len()
            )));
        }

        let width = x[0].len();
        if width == 0 {
            return Err(DomainError::DataShape("feature rows are empty".to_string()));
        }
        if let Some((row, bad)) = x.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(DomainError::DataShape(format!(
                "row {} has {} features, expected {}",
                row,
                bad.len(),
                width
            )));
        }

        Ok(Self { x, y, g })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.x.first().map(|r| r.len()).unwrap_or(0)
    }

    pub fn x(&self) -> &[Vec<f64>] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn g(&self) -> &[String] {
        &self.g
    }

    pub fn rows(&self, indices: &[usize]) -> Vec<Vec<f64>> {
        indices.iter().map(|&i| self.x[i].clone()).collect()
    }

    pub fn targets(&self, indices: &[usize]) -> Vec<f64> {
        indices.iter().map(|&i| self.y[i]).collect()
    }

    /// A new dataset holding `indices` in order; local index `k` maps to `indices[k]`.
    pub fn subset(&self, indices: &[usize]) -> DomainResult<Dataset> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(DomainError::DegenerateSplit(format!(
                "index {} out of range for dataset of {} samples",
                bad,
                self.len()
            )));
        }
        Dataset::new(
            self.rows(indices),
            self.targets(indices),
            Some(indices.iter().map(|&i| self.g[i].clone()).collect()),
        )
    }
}

/// One train/test partition produced by a splitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
    pub fold_id: usize,
}

impl Split {
    pub fn new(train: Vec<usize>, test: Vec<usize>, fold_id: usize) -> Self {
        Self {
            train,
            test,
            fold_id,
        }
    }

    /// Check both partitions are non-empty, disjoint and inside `0..n`.
    pub fn validate(&self, n: usize) -> DomainResult<()> {
        if self.train.is_empty() || self.test.is_empty() {
            return Err(DomainError::DegenerateSplit(format!(
                "split {} has {} train and {} test samples",
                self.fold_id,
                self.train.len(),
                self.test.len()
            )));
        }
        if let Some(&bad) = self.train.iter().chain(&self.test).find(|&&i| i >= n) {
            return Err(DomainError::DegenerateSplit(format!(
                "split {} references index {} outside 0..{}",
                self.fold_id, bad, n
            )));
        }
        let train: HashSet<usize> = self.train.iter().copied().collect();
        if let Some(&leak) = self.test.iter().find(|i| train.contains(i)) {
            return Err(DomainError::DegenerateSplit(format!(
                "split {} leaks index {} into both train and test",
                self.fold_id, leak
            )));
        }
        Ok(())
    }
}

/// Which resampling level produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitRole {
    Cv,
    Test,
}

impl fmt::Display for SplitRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitRole::Cv => write!(f, "cv"),
            SplitRole::Test => write!(f, "test"),
        }
    }
}

impl FromStr for SplitRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cv" => Ok(SplitRole::Cv),
            "test" => Ok(SplitRole::Test),
            other => Err(DomainError::Serialization(format!("unknown split role '{}'", other))),
        }
    }
}

/// Score a domain decision is made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    /// Dissimilarity of a sample to the training distribution.
    Dissimilarity,
    /// Calibrated uncertainty divided by the target scale.
    NormalizedUncertainty,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::Dissimilarity, Metric::NormalizedUncertainty];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Dissimilarity => "dissimilarity",
            Metric::NormalizedUncertainty => "normalized_uncertainty",
        }
    }
}

/// Which end of a score range means in-domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Polarity {
    InDomainIsLow,
    InDomainIsHigh,
}

impl Polarity {
    pub const ALL: [Polarity; 2] = [Polarity::InDomainIsLow, Polarity::InDomainIsHigh];

    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::InDomainIsLow => "id_low",
            Polarity::InDomainIsHigh => "id_high",
        }
    }

    /// Orient a score so that higher means more likely in-domain.
    pub fn orient(&self, score: f64) -> f64 {
        match self {
            Polarity::InDomainIsLow => -score,
            Polarity::InDomainIsHigh => score,
        }
    }

    /// Inverse of [`Polarity::orient`].
    pub fn restore(&self, oriented: f64) -> f64 {
        match self {
            Polarity::InDomainIsLow => -oriented,
            Polarity::InDomainIsHigh => oriented,
        }
    }
}

/// Rule used to pick a threshold on the precision-recall curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Policy {
    MaxF1,
    MinPrecision(f64),
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::MaxF1 => write!(f, "max_f1"),
            Policy::MinPrecision(target) => write!(f, "min_precision@{}", target),
        }
    }
}

/// Whether thresholds were searched on individual samples or on quantile bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    Point,
    Binned,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Point => "point",
            Granularity::Binned => "binned",
        }
    }
}

/// Typed identity of a threshold: `(metric, polarity, policy, granularity)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdKey {
    pub metric: Metric,
    pub polarity: Polarity,
    pub policy: Policy,
    pub granularity: Granularity,
}

impl fmt::Display for ThresholdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.metric.as_str(),
            self.polarity.as_str(),
            self.policy,
            self.granularity.as_str()
        )
    }
}

impl FromStr for ThresholdKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DomainError::Serialization(format!("malformed threshold key '{}'", s));
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 4 {
            return Err(bad());
        }

        let metric = Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == parts[0])
            .ok_or_else(bad)?;
        let polarity = Polarity::ALL
            .into_iter()
            .find(|p| p.as_str() == parts[1])
            .ok_or_else(bad)?;
        let policy = match parts[2] {
            "max_f1" => Policy::MaxF1,
            other => {
                let target = other
                    .strip_prefix("min_precision@")
                    .and_then(|t| t.parse::<f64>().ok())
                    .ok_or_else(bad)?;
                Policy::MinPrecision(target)
            }
        };
        let granularity = match parts[3] {
            "point" => Granularity::Point,
            "binned" => Granularity::Binned,
            _ => return Err(bad()),
        };

        Ok(Self {
            metric,
            polarity,
            policy,
            granularity,
        })
    }
}

/// A fitted decision threshold and the curve point it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdEntry {
    pub key: ThresholdKey,
    /// Threshold in the original score orientation.
    pub threshold: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl ThresholdEntry {
    /// Apply the threshold to a raw score.
    pub fn is_in_domain(&self, score: f64) -> bool {
        match self.key.polarity {
            Polarity::InDomainIsLow => score <= self.threshold,
            Polarity::InDomainIsHigh => score >= self.threshold,
        }
    }
}

/// Boolean domain verdict for one threshold key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainPrediction {
    pub key: ThresholdKey,
    pub in_domain: bool,
}

/// One evaluated sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub index: usize,
    pub y: f64,
    pub y_pred: f64,
    pub y_std_raw: f64,
    pub y_std_calibrated: f64,
    pub dissimilarity: f64,
    /// Scale of the training target the prediction was evaluated against.
    pub sigma_y: f64,
    pub fold_id: usize,
    pub split_role: SplitRole,
    /// Name of the splitter that produced the row.
    pub splitter: String,
    pub ground_truth_in_domain: bool,
    #[serde(default)]
    pub domain_predictions: Vec<DomainPrediction>,
}

impl AssessmentRecord {
    pub fn residual(&self) -> f64 {
        self.y - self.y_pred
    }

    /// Residual in units of calibrated uncertainty.
    pub fn z(&self) -> f64 {
        self.residual() / self.y_std_calibrated
    }

    /// Residual in units of the target scale.
    pub fn scaled_residual(&self) -> f64 {
        self.residual() / self.sigma_y
    }

    pub fn normalized_uncertainty(&self) -> f64 {
        self.y_std_calibrated / self.sigma_y
    }

    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Dissimilarity => self.dissimilarity,
            Metric::NormalizedUncertainty => self.normalized_uncertainty(),
        }
    }

    /// Re-derive the ground-truth label from the stored fields.
    pub fn refresh_ground_truth(&mut self) {
        self.ground_truth_in_domain = ground_truth_in_domain(self.y, self.y_pred, self.sigma_y);
    }

    pub fn prediction_for(&self, key: &ThresholdKey) -> Option<bool> {
        self.domain_predictions
            .iter()
            .find(|p| &p.key == key)
            .map(|p| p.in_domain)
    }
}

/// Output of a frozen model on new inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub y_pred: f64,
    pub y_std_raw: f64,
    pub y_std_calibrated: f64,
    pub normalized_uncertainty: f64,
    pub dissimilarity: f64,
    pub domain_predictions: Vec<DomainPrediction>,
}

impl PredictionRecord {
    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Dissimilarity => self.dissimilarity,
            Metric::NormalizedUncertainty => self.normalized_uncertainty,
        }
    }

    pub fn prediction_for(&self, key: &ThresholdKey) -> Option<bool> {
        self.domain_predictions
            .iter()
            .find(|p| &p.key == key)
            .map(|p| p.in_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_dataset_rejects_mismatched_lengths() {
        let err = Dataset::new(vec![vec![1.0], vec![2.0]], vec![1.0], None).unwrap_err();
        assert!(matches!(err, DomainError::DataShape(_)));

        let err = Dataset::new(
            vec![vec![1.0], vec![2.0]],
            vec![1.0, 2.0],
            Some(vec!["a".to_string()]),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::DataShape(_)));
    }

    #[test]
    fn test_dataset_rejects_ragged_rows() {
        let err = Dataset::new(vec![vec![1.0, 2.0], vec![2.0]], vec![1.0, 2.0], None).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_subset_preserves_order() {
        let ds = Dataset::new(
            vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]],
            vec![10.0, 11.0, 12.0, 13.0],
            Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]),
        )
        .unwrap();
        let sub = ds.subset(&[3, 1]).unwrap();
        assert_eq!(sub.y(), &[13.0, 11.0]);
        assert_eq!(sub.g(), &["d".to_string(), "b".to_string()]);
        assert!(ds.subset(&[4]).is_err());
    }

    #[test]
    fn test_split_validation() {
        assert!(Split::new(vec![0, 1], vec![2], 0).validate(3).is_ok());
        assert!(Split::new(vec![0, 1], vec![1], 0).validate(3).is_err());
        assert!(Split::new(vec![0, 1], vec![], 0).validate(3).is_err());
        assert!(Split::new(vec![0, 5], vec![1], 0).validate(3).is_err());
    }

    #[test]
    fn test_threshold_key_round_trip() {
        let key = ThresholdKey {
            metric: Metric::NormalizedUncertainty,
            polarity: Polarity::InDomainIsLow,
            policy: Policy::MinPrecision(0.95),
            granularity: Granularity::Binned,
        };
        let text = key.to_string();
        assert_eq!(text, "normalized_uncertainty/id_low/min_precision@0.95/binned");
        assert_eq!(text.parse::<ThresholdKey>().unwrap(), key);
        assert!("dissimilarity/id_low/max_f1".parse::<ThresholdKey>().is_err());
    }

    #[test]
    fn test_threshold_entry_respects_polarity() {
        let mut entry = ThresholdEntry {
            key: ThresholdKey {
                metric: Metric::Dissimilarity,
                polarity: Polarity::InDomainIsLow,
                policy: Policy::MaxF1,
                granularity: Granularity::Point,
            },
            threshold: 2.0,
            precision: 1.0,
            recall: 1.0,
            f1: 1.0,
        };
        assert!(entry.is_in_domain(1.5));
        assert!(entry.is_in_domain(2.0));
        assert!(!entry.is_in_domain(2.5));

        entry.key.polarity = Polarity::InDomainIsHigh;
        assert!(!entry.is_in_domain(1.5));
        assert!(entry.is_in_domain(2.5));
    }

    #[test]
    fn test_ground_truth_zero_sigma_is_out_of_domain() {
        assert!(!ground_truth_in_domain(1.0, 1.0, 0.0));
        assert!(!ground_truth_in_domain(1.0, 0.0, 0.0));
        assert!(ground_truth_in_domain(1.0, 0.5, 1.0));
        assert!(!ground_truth_in_domain(2.0, 1.0, 1.0));
    }

    proptest! {
        #[test]
        fn prop_ground_truth_matches_rule(
            y in -1e3f64..1e3,
            y_pred in -1e3f64..1e3,
            sigma in 1e-3f64..1e3,
        ) {
            let expected = (y - y_pred).abs() / sigma < 1.0;
            prop_assert_eq!(ground_truth_in_domain(y, y_pred, sigma), expected);
        }

        #[test]
        fn prop_orientation_round_trip(score in proptest::num::f64::NORMAL) {
            for polarity in Polarity::ALL {
                prop_assert_eq!(polarity.restore(polarity.orient(score)), score);
            }
        }
    }
}
