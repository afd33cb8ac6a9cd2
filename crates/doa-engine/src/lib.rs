//! Domain-of-applicability assessment engine.
//!
//! A [`ModelBuilder`] fits the estimator, distance and calibration
//! collaborators, gathers leakage-free inner cross-validation records and
//! derives precision-recall thresholds on them. [`NestedCv`] repeats that
//! inside every outer fold to measure how well the thresholds transfer.

pub mod aggregate;
pub mod binning;
pub mod builder;
pub mod config;
pub mod inner;
pub mod nested;
pub mod persist;
pub mod stats;
pub mod thresholds;

pub use aggregate::{summarize, summarize_runs, AssessmentSummary, FoldMetrics, GroupStats, IndexStats, MeanSem};
pub use binning::{binned_truth, BinStats, BinnedTruth};
pub use builder::{derive_thresholds, FittedModel, ModelArtifact, ModelBuilder};
pub use config::{AssessmentConfig, TestAugmentation};
pub use inner::run_inner_loop;
pub use nested::{Fold, NestedCv, NestedCvOutput, RecordedFold};
pub use persist::{aggregate_runs, load_model, save_run, AggregatedRuns, RunArtifacts, RunManifest};
pub use stats::{miscalibration_area, MiscalibrationArea, RegressionMetrics};
pub use thresholds::{search, PrCurve, PrSummary, ThresholdTable};
