//! On-disk layout of an assessment run.
//!
//! ```text
//! <dir>/manifest.json
//! <dir>/model/{X,y,g}.csv
//! <dir>/model/train.csv
//! <dir>/model/model.json
//! <dir>/model/stats.json
//! <dir>/assessment/assessment.csv
//! <dir>/assessment/group_stats.json
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use doa_core::{
    AssessmentRecord, Dataset, DomainError, DomainPrediction, DomainResult, ModelRestorer,
    SplitRole, ThresholdKey,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::aggregate::{
    index_stats, role_metrics, summarize, summarize_runs, AssessmentSummary, IndexStats, RoleMetrics,
};
use crate::builder::{FittedModel, ModelArtifact};
use crate::config::AssessmentConfig;

pub const MODEL_DIR: &str = "model";
pub const ASSESSMENT_DIR: &str = "assessment";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const MODEL_FILE: &str = "model.json";
pub const TRAIN_FILE: &str = "train.csv";
pub const STATS_FILE: &str = "stats.json";
pub const ASSESSMENT_FILE: &str = "assessment.csv";
pub const GROUP_STATS_FILE: &str = "group_stats.json";

/// Columns written before the per-threshold verdict columns.
const RECORD_COLUMNS: [&str; 13] = [
    "index",
    "fold_id",
    "split_role",
    "splitter",
    "y",
    "y_pred",
    "y_std_raw",
    "y_std_calibrated",
    "dissimilarity",
    "sigma_y",
    "normalized_uncertainty",
    "z",
    "ground_truth_in_domain",
];

fn csv_error(err: csv::Error) -> DomainError {
    DomainError::Serialization(err.to_string())
}

fn parse_field<T: std::str::FromStr>(record: &csv::StringRecord, i: usize, name: &str) -> DomainResult<T> {
    let raw = record.get(i).unwrap_or("").trim();
    raw.parse().map_err(|_| {
        DomainError::Serialization(format!("cannot parse column '{}' value '{}'", name, raw))
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> DomainResult<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> DomainResult<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Write features, targets and groups as three CSVs with a leading `index` column.
pub fn write_dataset(dir: &Path, data: &Dataset) -> DomainResult<()> {
    fs::create_dir_all(dir)?;

    let mut x = csv::Writer::from_path(dir.join("X.csv")).map_err(csv_error)?;
    let mut header = vec!["index".to_string()];
    header.extend((0..data.n_features()).map(|j| format!("x{}", j)));
    x.write_record(&header).map_err(csv_error)?;
    for (i, row) in data.x().iter().enumerate() {
        let mut fields = vec![i.to_string()];
        fields.extend(row.iter().map(|v| v.to_string()));
        x.write_record(&fields).map_err(csv_error)?;
    }
    x.flush()?;

    let mut y = csv::Writer::from_path(dir.join("y.csv")).map_err(csv_error)?;
    y.write_record(["index", "y"]).map_err(csv_error)?;
    for (i, v) in data.y().iter().enumerate() {
        y.write_record([i.to_string(), v.to_string()]).map_err(csv_error)?;
    }
    y.flush()?;

    let mut g = csv::Writer::from_path(dir.join("g.csv")).map_err(csv_error)?;
    g.write_record(["index", "g"]).map_err(csv_error)?;
    for (i, v) in data.g().iter().enumerate() {
        g.write_record([i.to_string(), v.clone()]).map_err(csv_error)?;
    }
    g.flush()?;
    Ok(())
}

/// Read a dataset from one CSV table.
///
/// Every column other than `target` and `group` is a feature. Without a
/// group column all samples share one group.
pub fn read_table(path: &Path, target: &str, group: Option<&str>) -> DomainResult<Dataset> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();

    let target_col = headers
        .iter()
        .position(|h| h.trim() == target)
        .ok_or_else(|| DomainError::DataShape(format!("no target column '{}'", target)))?;
    let group_col = match group {
        Some(name) => Some(
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| DomainError::DataShape(format!("no group column '{}'", name)))?,
        ),
        None => None,
    };
    let feature_cols: Vec<usize> = (0..headers.len())
        .filter(|c| *c != target_col && Some(*c) != group_col)
        .collect();

    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut g = Vec::new();
    for result in reader.records() {
        let record = result.map_err(csv_error)?;
        let row = feature_cols
            .iter()
            .map(|&c| parse_field::<f64>(&record, c, &headers[c]))
            .collect::<DomainResult<Vec<f64>>>()?;
        x.push(row);
        y.push(parse_field::<f64>(&record, target_col, target)?);
        if let Some(c) = group_col {
            g.push(record.get(c).unwrap_or("").trim().to_string());
        }
    }

    tracing::info!(
        "Loaded {} samples with {} features from {}",
        y.len(),
        feature_cols.len(),
        path.display()
    );
    Dataset::new(x, y, group_col.map(|_| g))
}

/// Threshold keys in first-seen order across `records`.
fn record_keys(records: &[AssessmentRecord]) -> Vec<ThresholdKey> {
    let mut keys: Vec<ThresholdKey> = Vec::new();
    for p in records.iter().flat_map(|r| r.domain_predictions.iter()) {
        if !keys.contains(&p.key) {
            keys.push(p.key);
        }
    }
    keys
}

/// Write records with one boolean column per threshold key.
///
/// A record without a verdict for some key leaves that cell empty.
pub fn write_records(path: &Path, records: &[AssessmentRecord]) -> DomainResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let keys = record_keys(records);

    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    let mut header: Vec<String> = RECORD_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(keys.iter().map(|k| k.to_string()));
    writer.write_record(&header).map_err(csv_error)?;

    for r in records {
        let mut fields = vec![
            r.index.to_string(),
            r.fold_id.to_string(),
            r.split_role.to_string(),
            r.splitter.clone(),
            r.y.to_string(),
            r.y_pred.to_string(),
            r.y_std_raw.to_string(),
            r.y_std_calibrated.to_string(),
            r.dissimilarity.to_string(),
            r.sigma_y.to_string(),
            r.normalized_uncertainty().to_string(),
            r.z().to_string(),
            r.ground_truth_in_domain.to_string(),
        ];
        fields.extend(
            keys.iter()
                .map(|k| r.prediction_for(k).map(|v| v.to_string()).unwrap_or_default()),
        );
        writer.write_record(&fields).map_err(csv_error)?;
    }
    writer.flush()?;

    tracing::debug!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}

/// Header of a records CSV.
pub fn read_header(path: &Path) -> DomainResult<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error)?;
    Ok(reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(|h| h.to_string())
        .collect())
}

/// Read records written by [`write_records`]. Derived columns are recomputed.
pub fn read_records(path: &Path) -> DomainResult<Vec<AssessmentRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();

    if headers.len() < RECORD_COLUMNS.len()
        || headers.iter().zip(RECORD_COLUMNS).any(|(h, c)| h != c)
    {
        return Err(DomainError::Serialization(format!(
            "{} is not an assessment table",
            path.display()
        )));
    }
    let keys = headers
        .iter()
        .skip(RECORD_COLUMNS.len())
        .map(|h| h.parse::<ThresholdKey>())
        .collect::<DomainResult<Vec<_>>>()?;

    let mut records = Vec::new();
    for result in reader.records() {
        let record = result.map_err(csv_error)?;
        let mut domain_predictions = Vec::with_capacity(keys.len());
        for (offset, key) in keys.iter().enumerate() {
            let col = RECORD_COLUMNS.len() + offset;
            if record.get(col).map(|v| v.trim().is_empty()).unwrap_or(true) {
                continue;
            }
            domain_predictions.push(DomainPrediction {
                key: *key,
                in_domain: parse_field(&record, col, &headers[col])?,
            });
        }

        records.push(AssessmentRecord {
            index: parse_field(&record, 0, RECORD_COLUMNS[0])?,
            fold_id: parse_field(&record, 1, RECORD_COLUMNS[1])?,
            split_role: parse_field::<SplitRole>(&record, 2, RECORD_COLUMNS[2])?,
            splitter: record.get(3).unwrap_or("").to_string(),
            y: parse_field(&record, 4, RECORD_COLUMNS[4])?,
            y_pred: parse_field(&record, 5, RECORD_COLUMNS[5])?,
            y_std_raw: parse_field(&record, 6, RECORD_COLUMNS[6])?,
            y_std_calibrated: parse_field(&record, 7, RECORD_COLUMNS[7])?,
            dissimilarity: parse_field(&record, 8, RECORD_COLUMNS[8])?,
            sigma_y: parse_field(&record, 9, RECORD_COLUMNS[9])?,
            ground_truth_in_domain: parse_field(&record, 12, RECORD_COLUMNS[12])?,
            domain_predictions,
        });
    }
    Ok(records)
}

/// Shape and settings of a saved run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub created_at: DateTime<Utc>,
    pub config: AssessmentConfig,
    pub samples: usize,
    pub features: usize,
    pub groups: usize,
    pub folds: usize,
    pub outer_splitter: String,
    pub sub_splitters: Vec<String>,
}

/// Training-set fit quality of the final model.
///
/// These describe how well the final model fits its own data, not how it
/// generalizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub description: String,
    pub summary: AssessmentSummary,
}

/// Everything a run writes to disk.
pub struct RunArtifacts<'a> {
    pub data: &'a Dataset,
    pub model: &'a FittedModel,
    /// Cv records of the final model fit on all data.
    pub train_records: &'a [AssessmentRecord],
    /// Nested cross-validation records of both roles.
    pub assessment: &'a [AssessmentRecord],
    pub config: &'a AssessmentConfig,
    pub outer_splitter: &'a str,
    pub sub_splitters: Vec<String>,
}

/// Write a run under `dir` and return its manifest.
pub fn save_run(dir: &Path, run: &RunArtifacts<'_>) -> DomainResult<RunManifest> {
    let model_dir = dir.join(MODEL_DIR);
    let assessment_dir = dir.join(ASSESSMENT_DIR);
    fs::create_dir_all(&model_dir)?;
    fs::create_dir_all(&assessment_dir)?;

    write_dataset(&model_dir, run.data)?;
    write_records(&model_dir.join(TRAIN_FILE), run.train_records)?;
    write_json(&model_dir.join(MODEL_FILE), &run.model.to_artifact()?)?;
    write_json(
        &model_dir.join(STATS_FILE),
        &TrainingStats {
            description: "training-set fit quality of the final model".to_string(),
            summary: summarize(run.train_records, run.config),
        },
    )?;

    write_records(&assessment_dir.join(ASSESSMENT_FILE), run.assessment)?;
    write_json(
        &assessment_dir.join(GROUP_STATS_FILE),
        &summarize(run.assessment, run.config),
    )?;

    let mut folds: Vec<usize> = run
        .assessment
        .iter()
        .filter(|r| r.split_role == SplitRole::Test)
        .map(|r| r.fold_id)
        .collect();
    folds.sort_unstable();
    folds.dedup();

    let mut groups: Vec<&String> = run.data.g().iter().collect();
    groups.sort_unstable();
    groups.dedup();

    let manifest = RunManifest {
        created_at: Utc::now(),
        config: run.config.clone(),
        samples: run.data.len(),
        features: run.data.n_features(),
        groups: groups.len(),
        folds: folds.len(),
        outer_splitter: run.outer_splitter.to_string(),
        sub_splitters: run.sub_splitters.clone(),
    };
    write_json(&dir.join(MANIFEST_FILE), &manifest)?;

    tracing::info!(
        "Saved run to {} ({} assessment rows, {} folds)",
        dir.display(),
        run.assessment.len(),
        manifest.folds
    );
    Ok(manifest)
}

/// Rebuild the final model of a saved run.
pub fn load_model(dir: &Path, restorer: &dyn ModelRestorer) -> DomainResult<FittedModel> {
    let artifact: ModelArtifact = read_json(&dir.join(MODEL_DIR).join(MODEL_FILE))?;
    FittedModel::from_artifact(artifact, restorer)
}

/// Regression metrics of one run within an aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run: usize,
    pub path: PathBuf,
    pub records: usize,
    pub roles: Vec<RoleMetrics>,
}

/// Pooled statistics over several saved runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRuns {
    pub runs: Vec<RunMetrics>,
    pub summary: AssessmentSummary,
    pub indices: Vec<IndexStats>,
}

/// Pool the assessment tables of several runs and recompute their statistics.
///
/// Every table must carry the same header. Runs are tagged with their
/// position in `dirs`, which keeps group and fold keys unique. Nothing is refit.
pub fn aggregate_runs(dirs: &[PathBuf], config: &AssessmentConfig) -> DomainResult<AggregatedRuns> {
    if dirs.is_empty() {
        return Err(DomainError::InvalidConfig("no runs to aggregate".to_string()));
    }

    let mut expected_header: Option<Vec<String>> = None;
    let mut by_run: Vec<Vec<AssessmentRecord>> = Vec::with_capacity(dirs.len());
    let mut runs = Vec::with_capacity(dirs.len());
    for (run, dir) in dirs.iter().enumerate() {
        let path = dir.join(ASSESSMENT_DIR).join(ASSESSMENT_FILE);
        let header = read_header(&path)?;
        match &expected_header {
            Some(expected) if expected != &header => {
                return Err(DomainError::DataShape(format!(
                    "{} has a different header than {}",
                    path.display(),
                    dirs[0].display()
                )));
            }
            Some(_) => {}
            None => expected_header = Some(header),
        }

        let records = read_records(&path)?;
        tracing::info!("Run {}: {} records from {}", run, records.len(), path.display());
        runs.push(RunMetrics {
            run,
            path: dir.clone(),
            records: records.len(),
            roles: role_metrics(&records),
        });
        by_run.push(records);
    }

    let tables: Vec<&[AssessmentRecord]> = by_run.iter().map(|r| r.as_slice()).collect();
    let pooled: Vec<AssessmentRecord> = by_run.iter().flatten().cloned().collect();
    Ok(AggregatedRuns {
        runs,
        summary: summarize_runs(&tables, config),
        indices: index_stats(&pooled),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use doa_core::{Granularity, Metric, Polarity, Policy};

    fn key(policy: Policy) -> ThresholdKey {
        ThresholdKey {
            metric: Metric::Dissimilarity,
            polarity: Polarity::InDomainIsLow,
            policy,
            granularity: Granularity::Point,
        }
    }

    fn records() -> Vec<AssessmentRecord> {
        (0..6)
            .map(|i| AssessmentRecord {
                index: i,
                y: i as f64 * 0.3,
                y_pred: i as f64 * 0.25 + 0.1,
                y_std_raw: 0.2,
                y_std_calibrated: 0.25,
                dissimilarity: i as f64 / 7.0,
                sigma_y: 1.0 / 3.0,
                fold_id: i % 2,
                split_role: if i < 4 { SplitRole::Cv } else { SplitRole::Test },
                splitter: "inner".to_string(),
                ground_truth_in_domain: i % 3 != 0,
                domain_predictions: if i == 5 {
                    vec![DomainPrediction {
                        key: key(Policy::MaxF1),
                        in_domain: true,
                    }]
                } else {
                    vec![
                        DomainPrediction {
                            key: key(Policy::MaxF1),
                            in_domain: i % 2 == 0,
                        },
                        DomainPrediction {
                            key: key(Policy::MinPrecision(0.95)),
                            in_domain: false,
                        },
                    ]
                },
            })
            .collect()
    }

    #[test]
    fn test_records_round_trip_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assessment").join("assessment.csv");
        let original = records();
        write_records(&path, &original).unwrap();

        let header = read_header(&path).unwrap();
        assert_eq!(header.len(), RECORD_COLUMNS.len() + 2);
        assert_eq!(header[13], "dissimilarity/id_low/max_f1/point");

        let back = read_records(&path).unwrap();
        assert_eq!(back, original);
        assert_eq!(back[5].domain_predictions.len(), 1);
    }

    #[test]
    fn test_read_rejects_foreign_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.csv");
        fs::write(&path, "a,b\n1,2\n").unwrap();
        assert!(matches!(read_records(&path), Err(DomainError::Serialization(_))));
    }

    #[test]
    fn test_read_table_splits_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        fs::write(&path, "a,target,b,site\n1,10,2,x\n3,30,4,y\n5,50,6,x\n").unwrap();

        let data = read_table(&path, "target", Some("site")).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data.x()[1], vec![3.0, 4.0]);
        assert_eq!(data.y(), &[10.0, 30.0, 50.0]);
        assert_eq!(data.g()[2], "x");

        assert!(matches!(
            read_table(&path, "missing", None),
            Err(DomainError::DataShape(_))
        ));
    }

    #[test]
    fn test_write_dataset_indexes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let data = Dataset::new(
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            vec![0.5, 1.5],
            Some(vec!["a".to_string(), "b".to_string()]),
        )
        .unwrap();
        write_dataset(dir.path(), &data).unwrap();

        let x = fs::read_to_string(dir.path().join("X.csv")).unwrap();
        assert_eq!(x, "index,x0,x1\n0,1,2\n1,3,4\n");
        let g = fs::read_to_string(dir.path().join("g.csv")).unwrap();
        assert_eq!(g, "index,g\n0,a\n1,b\n");
    }

    #[test]
    fn test_aggregate_requires_matching_headers() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let c = tempfile::tempdir().unwrap();
        let table = |d: &Path| d.join(ASSESSMENT_DIR).join(ASSESSMENT_FILE);

        write_records(&table(a.path()), &records()).unwrap();
        write_records(&table(b.path()), &records()).unwrap();
        write_records(&table(c.path()), &records()[..1]).unwrap();

        let dirs = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let aggregated = aggregate_runs(&dirs, &AssessmentConfig::default()).unwrap();
        assert_eq!(aggregated.runs.len(), 2);
        assert_eq!(aggregated.summary.records, 12);
        let index0 = aggregated
            .indices
            .iter()
            .find(|s| s.split_role == SplitRole::Cv && s.index == 0)
            .unwrap();
        assert_eq!(index0.stats.count, 2);

        let mut keys: Vec<(usize, SplitRole, usize, bool)> = aggregated
            .summary
            .groups
            .iter()
            .map(|g| (g.run, g.split_role, g.fold_id, g.ground_truth_in_domain))
            .collect();
        let total = keys.len();
        keys.dedup();
        assert_eq!(keys.len(), total);
        assert_eq!(
            aggregated.summary.groups.iter().map(|g| g.stats.count).sum::<usize>(),
            12
        );
        assert!(aggregated.summary.groups.iter().any(|g| g.run == 1));

        // Run c lacks the min-precision column
        let dirs = vec![a.path().to_path_buf(), c.path().to_path_buf()];
        assert!(matches!(
            aggregate_runs(&dirs, &AssessmentConfig::default()),
            Err(DomainError::DataShape(_))
        ));
    }
}
