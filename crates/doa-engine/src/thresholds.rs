//! Precision-recall threshold search.
//!
//! Scores are oriented so that higher means more likely in-domain before the
//! curve is built; in-domain is always the positive class. Returned
//! thresholds are converted back to the caller's orientation.

use doa_core::{
    DomainPrediction, Granularity, Metric, Polarity, Policy, ThresholdEntry, ThresholdKey,
};
use serde::{Deserialize, Serialize};

/// Precision-recall curve in ascending-threshold order.
///
/// The last point is the conventional `(precision = 1, recall = 0)` and has
/// no threshold, so `thresholds.len() == precision.len() - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct PrCurve {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub thresholds: Vec<f64>,
}

impl PrCurve {
    /// Build the curve over every distinct oriented score.
    ///
    /// Returns `None` unless both classes are present.
    pub fn compute(oriented: &[f64], labels: &[bool]) -> Option<Self> {
        let positives = labels.iter().filter(|l| **l).count();
        if positives == 0 || positives == labels.len() {
            return None;
        }

        let mut order: Vec<usize> = (0..oriented.len()).collect();
        order.sort_by(|&a, &b| oriented[b].total_cmp(&oriented[a]));

        // Descending sweep; one curve point per distinct score
        let mut tps = Vec::new();
        let mut fps = Vec::new();
        let mut thresholds = Vec::new();
        let mut tp = 0usize;
        for (pos, &i) in order.iter().enumerate() {
            if labels[i] {
                tp += 1;
            }
            let last_of_run = order
                .get(pos + 1)
                .map(|&next| oriented[next] != oriented[i])
                .unwrap_or(true);
            if last_of_run {
                tps.push(tp as f64);
                fps.push((pos + 1 - tp) as f64);
                thresholds.push(oriented[i]);
            }
        }

        let total_pos = positives as f64;
        let mut precision: Vec<f64> = tps.iter().zip(&fps).map(|(t, f)| t / (t + f)).collect();
        let mut recall: Vec<f64> = tps.iter().map(|t| t / total_pos).collect();

        precision.reverse();
        recall.reverse();
        thresholds.reverse();
        precision.push(1.0);
        recall.push(0.0);

        Some(Self {
            precision,
            recall,
            thresholds,
        })
    }

    /// F1 per curve point, zero where precision and recall are both zero.
    pub fn f1(&self) -> Vec<f64> {
        self.precision
            .iter()
            .zip(&self.recall)
            .map(|(p, r)| {
                let den = p + r;
                if den != 0.0 {
                    2.0 * p * r / den
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Step-wise area under the curve.
    pub fn average_precision(&self) -> f64 {
        self.recall
            .windows(2)
            .zip(&self.precision)
            .map(|(r, p)| (r[0] - r[1]) * p)
            .sum()
    }
}

/// Outcome of one threshold search for a `(metric, polarity, granularity)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrSummary {
    pub metric: Metric,
    pub polarity: Polarity,
    pub granularity: Granularity,
    pub count: usize,
    /// Share of in-domain labels.
    #[serde(with = "doa_core::nan_as_null")]
    pub baseline: f64,
    /// NaN when only one class is present.
    #[serde(with = "doa_core::nan_as_null")]
    pub average_precision: f64,
    /// `(AP - baseline) / (1 - baseline)`; NaN when only one class is present.
    #[serde(with = "doa_core::nan_as_null")]
    pub relative_auc: f64,
    pub entries: Vec<ThresholdEntry>,
}

impl PrSummary {
    pub fn is_degenerate(&self) -> bool {
        self.average_precision.is_nan()
    }
}

fn first_argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Search decision thresholds on `scores` against `labels`.
///
/// Single-class input is not an error: the summary carries the baseline,
/// NaN area statistics and no entries.
pub fn search(
    scores: &[f64],
    labels: &[bool],
    metric: Metric,
    polarity: Polarity,
    granularity: Granularity,
    policies: &[Policy],
) -> PrSummary {
    let total = labels.len();
    let (scores, labels): (Vec<f64>, Vec<bool>) = scores
        .iter()
        .zip(labels)
        .filter(|(s, _)| !s.is_nan())
        .map(|(s, l)| (*s, *l))
        .unzip();
    if labels.len() < total {
        tracing::warn!(
            "Dropping {} of {} NaN {} scores before the threshold search",
            total - labels.len(),
            total,
            metric.as_str()
        );
    }
    let labels = labels.as_slice();
    let count = labels.len();
    let positives = labels.iter().filter(|l| **l).count();
    let baseline = if count > 0 {
        positives as f64 / count as f64
    } else {
        f64::NAN
    };

    let oriented: Vec<f64> = scores.iter().map(|s| polarity.orient(*s)).collect();
    let curve = match PrCurve::compute(&oriented, labels) {
        Some(curve) => curve,
        None => {
            tracing::warn!(
                "Single-class labels for {}/{}/{} ({} of {} in-domain), skipping thresholds",
                metric.as_str(),
                polarity.as_str(),
                granularity.as_str(),
                positives,
                count
            );
            return PrSummary {
                metric,
                polarity,
                granularity,
                count,
                baseline,
                average_precision: f64::NAN,
                relative_auc: f64::NAN,
                entries: Vec::new(),
            };
        }
    };

    let f1 = curve.f1();
    let average_precision = curve.average_precision();
    let relative_auc = if baseline < 1.0 {
        (average_precision - baseline) / (1.0 - baseline)
    } else {
        0.0
    };

    let mut entries = Vec::with_capacity(policies.len());
    for policy in policies {
        let index = match policy {
            Policy::MaxF1 => Some(first_argmax(&f1)),
            Policy::MinPrecision(target) => {
                let found = curve.precision[..curve.thresholds.len()]
                    .iter()
                    .position(|p| p >= target);
                if found.is_none() {
                    tracing::warn!(
                        "No threshold reaches precision {} for {}/{}/{}",
                        target,
                        metric.as_str(),
                        polarity.as_str(),
                        granularity.as_str()
                    );
                }
                found
            }
        };
        let Some(index) = index else { continue };

        // The appended curve end has no threshold of its own
        let oriented_threshold = curve
            .thresholds
            .get(index)
            .copied()
            .unwrap_or_else(|| curve.thresholds.iter().copied().fold(f64::NEG_INFINITY, f64::max));

        entries.push(ThresholdEntry {
            key: ThresholdKey {
                metric,
                polarity,
                policy: *policy,
                granularity,
            },
            threshold: polarity.restore(oriented_threshold),
            precision: curve.precision[index],
            recall: curve.recall[index],
            f1: f1[index],
        });
    }

    tracing::debug!(
        "PR search {}/{}/{}: n={}, baseline={:.3}, AP={:.3}, {} thresholds",
        metric.as_str(),
        polarity.as_str(),
        granularity.as_str(),
        count,
        baseline,
        average_precision,
        entries.len()
    );

    PrSummary {
        metric,
        polarity,
        granularity,
        count,
        baseline,
        average_precision,
        relative_auc,
        entries,
    }
}

/// Every threshold search of one fitted model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTable {
    pub summaries: Vec<PrSummary>,
}

impl ThresholdTable {
    pub fn entries(&self) -> impl Iterator<Item = &ThresholdEntry> {
        self.summaries.iter().flat_map(|s| s.entries.iter())
    }

    pub fn get(&self, key: &ThresholdKey) -> Option<&ThresholdEntry> {
        self.entries().find(|e| &e.key == key)
    }

    pub fn summary(
        &self,
        metric: Metric,
        polarity: Polarity,
        granularity: Granularity,
    ) -> Option<&PrSummary> {
        self.summaries
            .iter()
            .find(|s| s.metric == metric && s.polarity == polarity && s.granularity == granularity)
    }

    /// Apply every stored threshold to one sample's metric values.
    pub fn apply(&self, metric_value: impl Fn(Metric) -> f64) -> Vec<DomainPrediction> {
        self.entries()
            .map(|e| DomainPrediction {
                key: e.key,
                in_domain: e.is_in_domain(metric_value(e.key.metric)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const POLICIES: [Policy; 2] = [Policy::MaxF1, Policy::MinPrecision(0.95)];

    #[test]
    fn test_curve_matches_reference_values() {
        let curve = PrCurve::compute(&[0.1, 0.4, 0.35, 0.8], &[false, false, true, true]).unwrap();
        assert_eq!(curve.thresholds, vec![0.1, 0.35, 0.4, 0.8]);
        assert_eq!(curve.recall, vec![1.0, 1.0, 0.5, 0.5, 0.0]);
        let expected_precision = [0.5, 2.0 / 3.0, 0.5, 1.0, 1.0];
        for (p, e) in curve.precision.iter().zip(expected_precision) {
            assert!((p - e).abs() < 1e-12);
        }
        assert!((curve.average_precision() - 0.833_333_333_333_333_4).abs() < 1e-12);
    }

    #[test]
    fn test_ties_share_one_curve_point() {
        let curve = PrCurve::compute(&[1.0, 1.0, 2.0], &[true, false, true]).unwrap();
        assert_eq!(curve.thresholds, vec![1.0, 2.0]);
        assert_eq!(curve.precision.len(), 3);
    }

    #[test]
    fn test_nan_scores_are_left_out_of_the_curve() {
        let clean = search(
            &[0.1, 0.2, 2.0, 3.0],
            &[true, true, false, false],
            Metric::NormalizedUncertainty,
            Polarity::InDomainIsLow,
            Granularity::Point,
            &POLICIES,
        );
        let noisy = search(
            &[f64::NAN, 0.1, 0.2, f64::NAN, 2.0, 3.0],
            &[false, true, true, true, false, false],
            Metric::NormalizedUncertainty,
            Polarity::InDomainIsLow,
            Granularity::Point,
            &POLICIES,
        );

        assert_eq!(noisy.count, 4);
        assert_eq!(noisy.baseline, 0.5);
        assert_eq!(noisy.entries, clean.entries);
        assert!(noisy.entries.iter().all(|e| e.threshold.is_finite()));
    }

    #[test]
    fn test_low_polarity_threshold_separates_classes() {
        // In-domain samples have small dissimilarity
        let scores = [0.1, 0.2, 0.3, 0.4, 2.0, 3.0];
        let labels = [true, true, true, true, false, false];
        let summary = search(
            &scores,
            &labels,
            Metric::Dissimilarity,
            Polarity::InDomainIsLow,
            Granularity::Point,
            &POLICIES,
        );

        let max_f1 = &summary.entries[0];
        assert_eq!(max_f1.threshold, 0.4);
        assert_eq!(max_f1.f1, 1.0);
        for (s, l) in scores.iter().zip(labels) {
            assert_eq!(max_f1.is_in_domain(*s), l);
        }
        assert!((summary.relative_auc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_min_precision_takes_most_inclusive_threshold() {
        let scores = [5.0, 4.0, 3.0, 2.0, 1.0];
        let labels = [true, true, false, true, false];
        let summary = search(
            &scores,
            &labels,
            Metric::NormalizedUncertainty,
            Polarity::InDomainIsHigh,
            Granularity::Point,
            &[Policy::MinPrecision(0.75)],
        );
        // Precision by ascending threshold: 3/5, 3/4, 2/3, 1, 1
        let entry = &summary.entries[0];
        assert_eq!(entry.threshold, 2.0);
        assert_eq!(entry.precision, 0.75);
        assert_eq!(entry.recall, 1.0);
    }

    #[test]
    fn test_unreachable_precision_target_is_omitted() {
        let scores = [1.0, 2.0, 3.0, 4.0];
        let labels = [false, true, false, true];
        let summary = search(
            &scores,
            &labels,
            Metric::Dissimilarity,
            Polarity::InDomainIsLow,
            Granularity::Point,
            &POLICIES,
        );
        assert_eq!(summary.entries.len(), 1);
        assert_eq!(summary.entries[0].key.policy, Policy::MaxF1);
    }

    #[test]
    fn test_single_class_is_degenerate_not_error() {
        let summary = search(
            &[0.1, 0.5, 0.9],
            &[true, true, true],
            Metric::Dissimilarity,
            Polarity::InDomainIsLow,
            Granularity::Binned,
            &POLICIES,
        );
        assert!(summary.is_degenerate());
        assert_eq!(summary.baseline, 1.0);
        assert!(summary.entries.is_empty());
        assert!(summary.relative_auc.is_nan());
    }

    #[test]
    fn test_table_applies_entries() {
        let summary = search(
            &[0.1, 0.2, 5.0],
            &[true, true, false],
            Metric::Dissimilarity,
            Polarity::InDomainIsLow,
            Granularity::Point,
            &[Policy::MaxF1],
        );
        let table = ThresholdTable {
            summaries: vec![summary],
        };
        let preds = table.apply(|_| 0.15);
        assert_eq!(preds.len(), 1);
        assert!(preds[0].in_domain);
        assert!(!table.apply(|_| 4.0)[0].in_domain);
    }

    proptest! {
        #[test]
        fn prop_search_is_idempotent(
            data in proptest::collection::vec((-10.0f64..10.0, any::<bool>()), 2..60),
        ) {
            let scores: Vec<f64> = data.iter().map(|d| d.0).collect();
            let labels: Vec<bool> = data.iter().map(|d| d.1).collect();
            for polarity in Polarity::ALL {
                let a = search(&scores, &labels, Metric::Dissimilarity, polarity, Granularity::Point, &POLICIES);
                let b = search(&scores, &labels, Metric::Dissimilarity, polarity, Granularity::Point, &POLICIES);
                prop_assert_eq!(a.entries.len(), b.entries.len());
                for (x, y) in a.entries.iter().zip(&b.entries) {
                    prop_assert_eq!(x.threshold.to_bits(), y.threshold.to_bits());
                }
            }
        }

        #[test]
        fn prop_max_f1_threshold_reproduces_its_recall(
            data in proptest::collection::vec((-10.0f64..10.0, any::<bool>()), 2..60),
        ) {
            let scores: Vec<f64> = data.iter().map(|d| d.0).collect();
            let labels: Vec<bool> = data.iter().map(|d| d.1).collect();
            let positives = labels.iter().filter(|l| **l).count();
            prop_assume!(positives > 0 && positives < labels.len());

            for polarity in Polarity::ALL {
                let summary = search(&scores, &labels, Metric::Dissimilarity, polarity, Granularity::Point, &[Policy::MaxF1]);
                let entry = &summary.entries[0];
                let hits = scores
                    .iter()
                    .zip(&labels)
                    .filter(|(s, l)| **l && entry.is_in_domain(**s))
                    .count();
                prop_assert!((hits as f64 / positives as f64 - entry.recall).abs() < 1e-12);
            }
        }
    }
}
