//! Pure reductions over assessment records. Nothing here refits a model.

use std::collections::BTreeMap;

use doa_core::{AssessmentRecord, SplitRole};
use serde::{Deserialize, Serialize};

use crate::binning::BinnedTruth;
use crate::builder::derive_thresholds;
use crate::config::AssessmentConfig;
use crate::stats::{mean, sem, RegressionMetrics};
use crate::thresholds::ThresholdTable;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanSem {
    #[serde(with = "doa_core::nan_as_null")]
    pub mean: f64,
    #[serde(with = "doa_core::nan_as_null")]
    pub sem: f64,
}

impl MeanSem {
    pub fn of(values: &[f64]) -> Self {
        Self {
            mean: mean(values),
            sem: sem(values),
        }
    }
}

/// Mean and standard error of the record columns within one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub count: usize,
    pub y: MeanSem,
    pub y_pred: MeanSem,
    pub y_std_calibrated: MeanSem,
    pub dissimilarity: MeanSem,
    pub normalized_uncertainty: MeanSem,
    pub abs_residual: MeanSem,
    pub z: MeanSem,
}

impl ColumnStats {
    pub fn of(records: &[&AssessmentRecord]) -> Self {
        let column = |f: fn(&AssessmentRecord) -> f64| -> MeanSem {
            MeanSem::of(&records.iter().map(|r| f(r)).collect::<Vec<_>>())
        };
        Self {
            count: records.len(),
            y: column(|r| r.y),
            y_pred: column(|r| r.y_pred),
            y_std_calibrated: column(|r| r.y_std_calibrated),
            dissimilarity: column(|r| r.dissimilarity),
            normalized_uncertainty: column(|r| r.normalized_uncertainty()),
            abs_residual: column(|r| r.residual().abs()),
            z: column(|r| r.z()),
        }
    }
}

/// Statistics for one `(run, split_role, fold_id, ground_truth_in_domain)` group.
///
/// `run` is the ordinal of the pooled run, always 0 for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub run: usize,
    pub split_role: SplitRole,
    pub fold_id: usize,
    pub ground_truth_in_domain: bool,
    pub stats: ColumnStats,
}

/// Statistics for one sample across every fold and repeat it appeared in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub split_role: SplitRole,
    pub index: usize,
    pub stats: ColumnStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldMetrics {
    pub run: usize,
    pub fold_id: usize,
    pub metrics: RegressionMetrics,
}

/// Regression metrics per fold plus their mean/SEM across folds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleMetrics {
    pub split_role: SplitRole,
    pub per_fold: Vec<FoldMetrics>,
    pub rmse: MeanSem,
    pub rmse_over_sigma: MeanSem,
    pub mae: MeanSem,
    pub r2: MeanSem,
}

/// Regression metrics of the cv records produced by one named splitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitterMetrics {
    pub splitter: String,
    pub metrics: RegressionMetrics,
}

/// Thresholds recomputed on all records of one role, for reporting only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleThresholds {
    pub split_role: SplitRole,
    pub thresholds: ThresholdTable,
    pub binned: Vec<BinnedTruth>,
}

/// Everything reported about a set of assessment records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentSummary {
    pub records: usize,
    pub groups: Vec<GroupStats>,
    pub roles: Vec<RoleMetrics>,
    pub splitters: Vec<SplitterMetrics>,
    pub thresholds: Vec<RoleThresholds>,
}

/// Records paired with the ordinal of the run they came from.
fn tagged<'a>(runs: &[&'a [AssessmentRecord]]) -> Vec<(usize, &'a AssessmentRecord)> {
    runs.iter()
        .enumerate()
        .flat_map(|(run, &records)| records.iter().map(move |r| (run, r)))
        .collect()
}

fn grouped_stats(rows: &[(usize, &AssessmentRecord)]) -> Vec<GroupStats> {
    let mut groups: BTreeMap<(usize, SplitRole, usize, bool), Vec<&AssessmentRecord>> = BTreeMap::new();
    for &(run, r) in rows {
        groups
            .entry((run, r.split_role, r.fold_id, r.ground_truth_in_domain))
            .or_default()
            .push(r);
    }
    groups
        .into_iter()
        .map(|((run, split_role, fold_id, ground_truth_in_domain), rows)| GroupStats {
            run,
            split_role,
            fold_id,
            ground_truth_in_domain,
            stats: ColumnStats::of(&rows),
        })
        .collect()
}

pub fn group_stats(records: &[AssessmentRecord]) -> Vec<GroupStats> {
    grouped_stats(&tagged(&[records]))
}

/// Per-sample statistics; the same index is pooled across runs.
pub fn index_stats(records: &[AssessmentRecord]) -> Vec<IndexStats> {
    let mut groups: BTreeMap<(SplitRole, usize), Vec<&AssessmentRecord>> = BTreeMap::new();
    for r in records {
        groups.entry((r.split_role, r.index)).or_default().push(r);
    }
    groups
        .into_iter()
        .map(|((split_role, index), rows)| IndexStats {
            split_role,
            index,
            stats: ColumnStats::of(&rows),
        })
        .collect()
}

fn metrics_of(rows: &[&AssessmentRecord]) -> RegressionMetrics {
    let y: Vec<f64> = rows.iter().map(|r| r.y).collect();
    let y_pred: Vec<f64> = rows.iter().map(|r| r.y_pred).collect();
    RegressionMetrics::compute(&y, &y_pred)
}

fn fold_metrics(rows: &[(usize, &AssessmentRecord)]) -> Vec<RoleMetrics> {
    let mut folds: BTreeMap<(SplitRole, usize, usize), Vec<&AssessmentRecord>> = BTreeMap::new();
    for &(run, r) in rows {
        folds.entry((r.split_role, run, r.fold_id)).or_default().push(r);
    }

    let mut roles: BTreeMap<SplitRole, Vec<FoldMetrics>> = BTreeMap::new();
    for ((role, run, fold_id), rows) in folds {
        roles.entry(role).or_default().push(FoldMetrics {
            run,
            fold_id,
            metrics: metrics_of(&rows),
        });
    }

    roles
        .into_iter()
        .map(|(split_role, per_fold)| {
            let column = |f: fn(&RegressionMetrics) -> f64| -> MeanSem {
                MeanSem::of(&per_fold.iter().map(|m| f(&m.metrics)).collect::<Vec<_>>())
            };
            RoleMetrics {
                split_role,
                rmse: column(|m| m.rmse),
                rmse_over_sigma: column(|m| m.rmse_over_sigma),
                mae: column(|m| m.mae),
                r2: column(|m| m.r2),
                per_fold,
            }
        })
        .collect()
}

pub fn role_metrics(records: &[AssessmentRecord]) -> Vec<RoleMetrics> {
    fold_metrics(&tagged(&[records]))
}

pub fn splitter_metrics(records: &[AssessmentRecord]) -> Vec<SplitterMetrics> {
    let mut groups: BTreeMap<&str, Vec<&AssessmentRecord>> = BTreeMap::new();
    for r in records.iter().filter(|r| r.split_role == SplitRole::Cv) {
        groups.entry(r.splitter.as_str()).or_default().push(r);
    }
    groups
        .into_iter()
        .map(|(splitter, rows)| SplitterMetrics {
            splitter: splitter.to_string(),
            metrics: metrics_of(&rows),
        })
        .collect()
}

/// Group statistics, regression metrics and pooled reporting thresholds.
pub fn summarize(records: &[AssessmentRecord], config: &AssessmentConfig) -> AssessmentSummary {
    summarize_runs(&[records], config)
}

/// [`summarize`] over several runs.
///
/// Groups and folds are keyed by run ordinal (position in `runs`), so fold 0
/// of one run never merges with fold 0 of another. Thresholds and splitter
/// metrics pool every run.
pub fn summarize_runs(runs: &[&[AssessmentRecord]], config: &AssessmentConfig) -> AssessmentSummary {
    let rows = tagged(runs);
    let pooled: Vec<AssessmentRecord> = rows.iter().map(|(_, r)| (*r).clone()).collect();

    let thresholds = [SplitRole::Cv, SplitRole::Test]
        .into_iter()
        .filter_map(|role| {
            let role_rows: Vec<AssessmentRecord> = pooled
                .iter()
                .filter(|r| r.split_role == role)
                .cloned()
                .collect();
            if role_rows.is_empty() {
                return None;
            }
            let (thresholds, binned) = derive_thresholds(&role_rows, config);
            Some(RoleThresholds {
                split_role: role,
                thresholds,
                binned,
            })
        })
        .collect();

    AssessmentSummary {
        records: pooled.len(),
        groups: grouped_stats(&rows),
        roles: fold_metrics(&rows),
        splitters: splitter_metrics(&pooled),
        thresholds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, fold_id: usize, role: SplitRole, y: f64, y_pred: f64) -> AssessmentRecord {
        let mut r = AssessmentRecord {
            index,
            y,
            y_pred,
            y_std_raw: 1.0,
            y_std_calibrated: 1.0,
            dissimilarity: index as f64,
            sigma_y: 1.0,
            fold_id,
            split_role: role,
            splitter: if index % 2 == 0 { "calibration" } else { "groups" }.to_string(),
            ground_truth_in_domain: false,
            domain_predictions: Vec::new(),
        };
        r.refresh_ground_truth();
        r
    }

    fn records() -> Vec<AssessmentRecord> {
        vec![
            record(0, 0, SplitRole::Cv, 1.0, 1.5),
            record(1, 0, SplitRole::Cv, 2.0, 4.0),
            record(2, 0, SplitRole::Test, 3.0, 3.2),
            record(0, 1, SplitRole::Cv, 1.0, 0.8),
            record(2, 1, SplitRole::Test, 3.0, 2.6),
            record(3, 1, SplitRole::Test, 4.0, 4.4),
        ]
    }

    #[test]
    fn test_group_stats_keys_and_counts() {
        let groups = group_stats(&records());
        assert!(groups.iter().all(|g| g.run == 0));
        let keys: Vec<(SplitRole, usize, bool, usize)> = groups
            .iter()
            .map(|g| (g.split_role, g.fold_id, g.ground_truth_in_domain, g.stats.count))
            .collect();
        assert_eq!(
            keys,
            vec![
                (SplitRole::Cv, 0, false, 1),
                (SplitRole::Cv, 0, true, 1),
                (SplitRole::Cv, 1, true, 1),
                (SplitRole::Test, 0, true, 1),
                (SplitRole::Test, 1, true, 2),
            ]
        );
        let last = &groups[4].stats;
        assert!((last.y.mean - 3.5).abs() < 1e-12);
        assert!((last.y.sem - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_index_stats_pool_folds() {
        let stats = index_stats(&records());
        let cv0 = stats
            .iter()
            .find(|s| s.split_role == SplitRole::Cv && s.index == 0)
            .unwrap();
        assert_eq!(cv0.stats.count, 2);
        assert!((cv0.stats.y_pred.mean - 1.15).abs() < 1e-12);
    }

    #[test]
    fn test_role_metrics_span_folds() {
        let roles = role_metrics(&records());
        assert_eq!(roles.len(), 2);
        let test = &roles[1];
        assert_eq!(test.split_role, SplitRole::Test);
        assert_eq!(test.per_fold.len(), 2);
        // Single-row fold has no sigma
        assert!(test.per_fold[0].metrics.rmse_over_sigma.is_nan());
        assert!((test.per_fold[1].metrics.rmse - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_splitter_metrics_only_cover_cv() {
        let metrics = splitter_metrics(&records());
        let names: Vec<&str> = metrics.iter().map(|m| m.splitter.as_str()).collect();
        assert_eq!(names, vec!["calibration", "groups"]);
        assert_eq!(metrics[0].metrics.count, 2);
    }

    #[test]
    fn test_summary_serializes_with_nan() {
        let summary = summarize(&records(), &AssessmentConfig::default());
        assert_eq!(summary.records, 6);
        assert_eq!(summary.thresholds.len(), 2);
        let json = serde_json::to_string(&summary).unwrap();
        let back: AssessmentSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.groups.len(), summary.groups.len());
    }

    #[test]
    fn test_runs_keep_their_own_folds() {
        let a = records();
        let b = records();
        let summary = summarize_runs(&[a.as_slice(), b.as_slice()], &AssessmentConfig::default());

        assert_eq!(summary.records, 12);
        assert_eq!(summary.groups.len(), 10);
        let keys: Vec<(usize, SplitRole, usize, bool)> = summary
            .groups
            .iter()
            .map(|g| (g.run, g.split_role, g.fold_id, g.ground_truth_in_domain))
            .collect();
        let mut unique = keys.clone();
        unique.dedup();
        assert_eq!(unique, keys);
        assert!(summary.groups.iter().all(|g| g.stats.count <= 2));

        let test = summary.roles.iter().find(|r| r.split_role == SplitRole::Test).unwrap();
        let folds: Vec<(usize, usize)> = test.per_fold.iter().map(|f| (f.run, f.fold_id)).collect();
        assert_eq!(folds, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }
}
