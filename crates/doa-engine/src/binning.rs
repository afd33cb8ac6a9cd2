//! Binned ground truth.
//!
//! Records are cut into equal-count bins by a decision metric. A bin is
//! in-domain when its standardized residuals look like a standard normal,
//! measured by the CDF miscalibration area.

use doa_core::{AssessmentRecord, Metric};
use serde::{Deserialize, Serialize};

use crate::stats::{mean, miscalibration_area, quantile_bins, rms, sample_variance};

/// Statistics of one quantile bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinStats {
    #[serde(with = "doa_core::nan_as_null")]
    pub metric_mean: f64,
    #[serde(with = "doa_core::nan_as_null")]
    pub metric_min: f64,
    #[serde(with = "doa_core::nan_as_null")]
    pub metric_max: f64,
    #[serde(with = "doa_core::nan_as_null")]
    pub z_mean: f64,
    /// NaN for bins with a single record.
    #[serde(with = "doa_core::nan_as_null")]
    pub z_var: f64,
    /// Root mean square of `residual / sigma_y`.
    #[serde(with = "doa_core::nan_as_null")]
    pub rmse_over_sigma: f64,
    pub count: usize,
    #[serde(with = "doa_core::nan_as_null")]
    pub miscalibration_area: f64,
    pub in_domain: bool,
}

/// Bins of one decision metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinnedTruth {
    pub metric: Metric,
    pub bins: Vec<BinStats>,
}

impl BinnedTruth {
    pub fn scores(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.metric_max).collect()
    }

    pub fn labels(&self) -> Vec<bool> {
        self.bins.iter().map(|b| b.in_domain).collect()
    }
}

/// Cut `records` into `bins` equal-count bins by `metric`.
///
/// Ties in the metric are broken by `z`, then by scaled residual. Records with
/// a NaN metric are left out. Bins left empty by small inputs are dropped.
pub fn binned_truth(
    records: &[AssessmentRecord],
    metric: Metric,
    bins: usize,
    area_cutoff: f64,
) -> BinnedTruth {
    let mut rows: Vec<(f64, f64, f64)> = records
        .iter()
        .map(|r| (r.metric(metric), r.z(), r.scaled_residual()))
        .filter(|r| !r.0.is_nan())
        .collect();
    if rows.len() < records.len() {
        tracing::warn!(
            "Binning {} without {} records whose value is NaN",
            metric.as_str(),
            records.len() - rows.len()
        );
    }
    rows.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then(a.1.total_cmp(&b.1))
            .then(a.2.total_cmp(&b.2))
    });

    let assignment = quantile_bins(rows.len(), bins);
    let mut grouped: Vec<Vec<(f64, f64, f64)>> = vec![Vec::new(); bins.max(1)];
    for (row, bin) in rows.into_iter().zip(assignment) {
        grouped[bin].push(row);
    }

    let bins = grouped
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(|group| {
            let values: Vec<f64> = group.iter().map(|r| r.0).collect();
            let z: Vec<f64> = group.iter().map(|r| r.1).collect();
            let scaled: Vec<f64> = group.iter().map(|r| r.2).collect();
            let area = miscalibration_area(&z).parity;

            BinStats {
                metric_mean: mean(&values),
                metric_min: values.iter().copied().fold(f64::INFINITY, f64::min),
                metric_max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                z_mean: mean(&z),
                z_var: sample_variance(&z),
                rmse_over_sigma: rms(&scaled),
                count: group.len(),
                miscalibration_area: area,
                // NaN areas compare false, so single-record bins are out of domain
                in_domain: area < area_cutoff,
            }
        })
        .collect();

    BinnedTruth { metric, bins }
}
