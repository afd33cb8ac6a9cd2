//! Model builder: one full fit cycle and the frozen model it produces.

use doa_core::{
    ensure_len, ground_truth_in_domain, AssessmentRecord, CalibrationFactory, CalibrationModel, Dataset,
    DistanceFactory, DistanceModel, DomainError, DomainResult, Estimator, EstimatorFactory,
    Granularity, Metric, ModelRestorer, ModelState, NamedSplitter, Polarity, PredictionRecord,
    SplitRole,
};
use serde::{Deserialize, Serialize};

use crate::binning::{binned_truth, BinnedTruth};
use crate::config::AssessmentConfig;
use crate::inner::run_inner_loop;
use crate::stats::population_std;
use crate::thresholds::{search, ThresholdTable};

/// Factories and resampling plan used to fit a [`FittedModel`].
pub struct ModelBuilder {
    estimator: Box<dyn EstimatorFactory>,
    distance: Box<dyn DistanceFactory>,
    calibration: Box<dyn CalibrationFactory>,
    splitters: Vec<NamedSplitter>,
    config: AssessmentConfig,
}

impl ModelBuilder {
    pub fn new(
        estimator: impl EstimatorFactory + 'static,
        distance: impl DistanceFactory + 'static,
        calibration: impl CalibrationFactory + 'static,
        splitters: Vec<NamedSplitter>,
        config: AssessmentConfig,
    ) -> Self {
        Self {
            estimator: Box::new(estimator),
            distance: Box::new(distance),
            calibration: Box::new(calibration),
            splitters,
            config,
        }
    }

    pub fn config(&self) -> &AssessmentConfig {
        &self.config
    }

    pub fn splitters(&self) -> &[NamedSplitter] {
        &self.splitters
    }

    /// Fit every collaborator on `data` and derive thresholds from leakage-free
    /// inner-loop records.
    ///
    /// The returned cv records are indexed locally to `data` and carry
    /// `fold_id = 0`.
    pub fn fit(&self, data: &Dataset) -> DomainResult<(FittedModel, Vec<AssessmentRecord>)> {
        self.config.validate()?;

        let mut estimator = self.estimator.build();
        estimator.fit(data.x(), data.y())?;
        let mut distance = self.distance.build();
        let transformed = estimator.transform(data.x())?;
        ensure_len(estimator.name(), "transform", transformed.len(), data.len())?;
        distance.fit(&transformed, data.y())?;

        let mut records = run_inner_loop(data, &self.splitters, &*self.estimator, &*self.distance)?;
        if records.is_empty() {
            return Err(DomainError::DegenerateSplit(
                "inner resampling produced no cv records".to_string(),
            ));
        }

        let calibration = self.fit_calibration(&records)?;
        let raw: Vec<f64> = records.iter().map(|r| r.y_std_raw).collect();
        let calibrated = calibration.predict(&raw)?;
        ensure_len(calibration.name(), "calibrated std", calibrated.len(), raw.len())?;
        for (record, calibrated) in records.iter_mut().zip(calibrated) {
            record.y_std_calibrated = calibrated;
        }

        let (thresholds, binned) = derive_thresholds(&records, &self.config);
        for record in records.iter_mut() {
            let predictions = thresholds.apply(|m| record.metric(m));
            record.domain_predictions = predictions;
        }

        let ystd = population_std(data.y());
        tracing::debug!(
            "Fitted model on {} samples: {} cv records, {} thresholds, ystd={:.4}",
            data.len(),
            records.len(),
            thresholds.entries().count(),
            ystd
        );

        let model = FittedModel {
            estimator,
            distance,
            calibration,
            ystd,
            thresholds,
            binned,
        };
        Ok((model, records))
    }

    fn fit_calibration(&self, records: &[AssessmentRecord]) -> DomainResult<Box<dyn CalibrationModel>> {
        let role = &self.config.calibration_role;
        let mut subset: Vec<&AssessmentRecord> = records.iter().filter(|r| &r.splitter == role).collect();
        if subset.is_empty() {
            tracing::warn!(
                "No records from calibration splitter '{}', calibrating on all {} cv records",
                role,
                records.len()
            );
            subset = records.iter().collect();
        }

        let y: Vec<f64> = subset.iter().map(|r| r.y).collect();
        let y_pred: Vec<f64> = subset.iter().map(|r| r.y_pred).collect();
        let raw: Vec<f64> = subset.iter().map(|r| r.y_std_raw).collect();

        let mut calibration = self.calibration.build();
        calibration.fit(&y, &y_pred, &raw)?;
        Ok(calibration)
    }
}

/// Point and binned threshold searches over calibrated cv records.
pub fn derive_thresholds(
    records: &[AssessmentRecord],
    config: &AssessmentConfig,
) -> (ThresholdTable, Vec<BinnedTruth>) {
    let policies = config.policies();
    let labels: Vec<bool> = records.iter().map(|r| r.ground_truth_in_domain).collect();

    let mut table = ThresholdTable::default();
    let mut binned = Vec::with_capacity(Metric::ALL.len());

    for metric in Metric::ALL {
        let scores: Vec<f64> = records.iter().map(|r| r.metric(metric)).collect();
        let bins = binned_truth(records, metric, config.bins, config.bin_area_cutoff);
        let bin_scores = bins.scores();
        let bin_labels = bins.labels();

        for polarity in Polarity::ALL {
            table
                .summaries
                .push(search(&scores, &labels, metric, polarity, Granularity::Point, &policies));
            table.summaries.push(search(
                &bin_scores,
                &bin_labels,
                metric,
                polarity,
                Granularity::Binned,
                &policies,
            ));
        }
        binned.push(bins);
    }

    (table, binned)
}

/// Frozen estimator, distance and calibration models plus their thresholds.
pub struct FittedModel {
    estimator: Box<dyn Estimator>,
    distance: Box<dyn DistanceModel>,
    calibration: Box<dyn CalibrationModel>,
    ystd: f64,
    thresholds: ThresholdTable,
    binned: Vec<BinnedTruth>,
}

impl std::fmt::Debug for FittedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FittedModel")
            .field("estimator", &self.estimator.name())
            .field("distance", &self.distance.name())
            .field("calibration", &self.calibration.name())
            .field("ystd", &self.ystd)
            .field("thresholds", &self.thresholds.entries().count())
            .finish()
    }
}

impl FittedModel {
    pub fn ystd(&self) -> f64 {
        self.ystd
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    pub fn binned_truth(&self) -> &[BinnedTruth] {
        &self.binned
    }

    /// Predict, calibrate, score dissimilarity and apply every threshold.
    pub fn predict(&self, x: &[Vec<f64>]) -> DomainResult<Vec<PredictionRecord>> {
        let n = x.len();
        let y_pred = self.estimator.predict(x)?;
        ensure_len(self.estimator.name(), "prediction", y_pred.len(), n)?;
        let raw = self.estimator.ensemble_spread(x)?;
        ensure_len(self.estimator.name(), "spread", raw.len(), n)?;
        let calibrated = self.calibration.predict(&raw)?;
        ensure_len(self.calibration.name(), "calibrated std", calibrated.len(), n)?;
        let transformed = self.estimator.transform(x)?;
        ensure_len(self.estimator.name(), "transform", transformed.len(), n)?;
        let dissimilarity = self.distance.predict(&transformed)?;
        ensure_len(self.distance.name(), "dissimilarity", dissimilarity.len(), n)?;

        Ok((0..n)
            .map(|i| {
                let mut record = PredictionRecord {
                    y_pred: y_pred[i],
                    y_std_raw: raw[i],
                    y_std_calibrated: calibrated[i],
                    normalized_uncertainty: calibrated[i] / self.ystd,
                    dissimilarity: dissimilarity[i],
                    domain_predictions: Vec::new(),
                };
                let predictions = self.thresholds.apply(|m| record.metric(m));
                record.domain_predictions = predictions;
                record
            })
            .collect())
    }

    /// Test-role records for `indices` of `data`, judged against this model's `ystd`.
    pub fn assess(
        &self,
        data: &Dataset,
        indices: &[usize],
        fold_id: usize,
        splitter: &str,
    ) -> DomainResult<Vec<AssessmentRecord>> {
        let predictions = self.predict(&data.rows(indices))?;
        let y = data.targets(indices);

        Ok(indices
            .iter()
            .zip(predictions)
            .zip(y)
            .map(|((&index, p), y)| AssessmentRecord {
                index,
                y,
                y_pred: p.y_pred,
                y_std_raw: p.y_std_raw,
                y_std_calibrated: p.y_std_calibrated,
                dissimilarity: p.dissimilarity,
                sigma_y: self.ystd,
                fold_id,
                split_role: SplitRole::Test,
                splitter: splitter.to_string(),
                ground_truth_in_domain: ground_truth_in_domain(y, p.y_pred, self.ystd),
                domain_predictions: p.domain_predictions,
            })
            .collect())
    }

    pub fn to_artifact(&self) -> DomainResult<ModelArtifact> {
        Ok(ModelArtifact {
            estimator: self.estimator.snapshot()?,
            distance: self.distance.snapshot()?,
            calibration: self.calibration.snapshot()?,
            ystd: self.ystd,
            thresholds: self.thresholds.clone(),
            binned: self.binned.clone(),
        })
    }

    pub fn from_artifact(artifact: ModelArtifact, restorer: &dyn ModelRestorer) -> DomainResult<Self> {
        Ok(Self {
            estimator: restorer.estimator(&artifact.estimator)?,
            distance: restorer.distance(&artifact.distance)?,
            calibration: restorer.calibration(&artifact.calibration)?,
            ystd: artifact.ystd,
            thresholds: artifact.thresholds,
            binned: artifact.binned,
        })
    }
}

/// Serializable form of a [`FittedModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub estimator: ModelState,
    pub distance: ModelState,
    pub calibration: ModelState,
    pub ystd: f64,
    pub thresholds: ThresholdTable,
    pub binned: Vec<BinnedTruth>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use doa_core::{Policy, ThresholdKey};
    use doa_models::{
        BaggedRidge, BaggedRidgeConfig, CalibrationMethod, KdeDistance, ReferenceRestorer,
        RepeatedKFold, UncertaintyCalibrator,
    };
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noisy_linear(n: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let x: Vec<Vec<f64>> = (0..n)
            .map(|_| vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)])
            .collect();
        let y = x
            .iter()
            .map(|r| 2.0 * r[0] - r[1] + rng.gen_range(-0.3..0.3))
            .collect();
        Dataset::new(x, y, None).unwrap()
    }

    fn builder() -> ModelBuilder {
        ModelBuilder::new(
            BaggedRidge::factory(BaggedRidgeConfig {
                n_estimators: 8,
                alpha: 1e-2,
                seed: 1,
            }),
            KdeDistance::factory(),
            UncertaintyCalibrator::factory(CalibrationMethod::Scale),
            vec![NamedSplitter::new("calibration", RepeatedKFold::new(4, 1, 3))],
            AssessmentConfig {
                bins: 4,
                ..Default::default()
            },
        )
    }

    /// Drops the first calibrated value when given fewer than `short_below` rows.
    struct ShortCalibration {
        short_below: usize,
    }

    impl CalibrationModel for ShortCalibration {
        fn name(&self) -> &str {
            "short_calibration"
        }

        fn fit(&mut self, _y: &[f64], _y_pred: &[f64], _raw_std: &[f64]) -> DomainResult<()> {
            Ok(())
        }

        fn predict(&self, raw_std: &[f64]) -> DomainResult<Vec<f64>> {
            if raw_std.len() >= self.short_below {
                return Ok(raw_std.to_vec());
            }
            Ok(raw_std.iter().skip(1).copied().collect())
        }
    }

    fn builder_with_calibration(short_below: usize) -> ModelBuilder {
        ModelBuilder::new(
            BaggedRidge::factory(BaggedRidgeConfig {
                n_estimators: 8,
                alpha: 1e-2,
                seed: 1,
            }),
            KdeDistance::factory(),
            move || -> Box<dyn CalibrationModel> { Box::new(ShortCalibration { short_below }) },
            vec![NamedSplitter::new("calibration", RepeatedKFold::new(4, 1, 3))],
            AssessmentConfig {
                bins: 4,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_short_calibration_output_fails_fit() {
        let err = builder_with_calibration(usize::MAX).fit(&noisy_linear(20, 8)).unwrap_err();
        assert!(matches!(err, DomainError::DataShape(_)));
        assert!(err.to_string().contains("short_calibration"));
    }

    #[test]
    fn test_short_calibration_output_fails_predict() {
        let data = noisy_linear(20, 9);
        let (model, _) = builder_with_calibration(10).fit(&data).unwrap();

        assert_eq!(model.predict(data.x()).unwrap().len(), 20);
        let err = model.predict(&data.x()[..5]).unwrap_err();
        assert!(matches!(err, DomainError::DataShape(_)));
        assert!(model.assess(&data, &[0, 1, 2], 0, "outer").is_err());
    }

    #[test]
    fn test_fit_calibrates_every_cv_record() {
        let data = noisy_linear(40, 2);
        let (model, records) = builder().fit(&data).unwrap();

        assert_eq!(records.len(), 40);
        assert!(records.iter().all(|r| r.split_role == SplitRole::Cv));
        assert!(records.iter().all(|r| r.y_std_calibrated.is_finite()));
        assert!(records.iter().any(|r| r.y_std_calibrated != r.y_std_raw));
        for r in &records {
            assert_eq!(
                r.ground_truth_in_domain,
                (r.y - r.y_pred).abs() / r.sigma_y < 1.0
            );
        }
        assert_eq!(model.binned_truth().len(), 2);
        assert!((model.ystd() - population_std(data.y())).abs() < 1e-12);
    }

    #[test]
    fn test_predict_applies_stored_thresholds() {
        let data = noisy_linear(40, 4);
        let (model, _) = builder().fit(&data).unwrap();
        let preds = model.predict(&data.x()[..5]).unwrap();

        assert_eq!(preds.len(), 5);
        let n_entries = model.thresholds().entries().count();
        for p in &preds {
            assert_eq!(p.domain_predictions.len(), n_entries);
            assert!((p.normalized_uncertainty - p.y_std_calibrated / model.ystd()).abs() < 1e-12);
            for d in &p.domain_predictions {
                let entry = model.thresholds().get(&d.key).unwrap();
                assert_eq!(d.in_domain, entry.is_in_domain(p.metric(d.key.metric)));
            }
        }
    }

    #[test]
    fn test_missing_calibration_role_falls_back_to_all_records() {
        let mut b = builder();
        b.config.calibration_role = "absent".to_string();
        let (_, records) = b.fit(&noisy_linear(30, 5)).unwrap();
        assert!(records.iter().all(|r| r.y_std_calibrated.is_finite()));
    }

    #[test]
    fn test_artifact_round_trip_predicts_identically() {
        let data = noisy_linear(32, 6);
        let (model, _) = builder().fit(&data).unwrap();

        let json = serde_json::to_string(&model.to_artifact().unwrap()).unwrap();
        let artifact: ModelArtifact = serde_json::from_str(&json).unwrap();
        let restored = FittedModel::from_artifact(artifact, &ReferenceRestorer).unwrap();

        let key = ThresholdKey {
            metric: Metric::Dissimilarity,
            polarity: Polarity::InDomainIsLow,
            policy: Policy::MaxF1,
            granularity: Granularity::Point,
        };
        let a = model.predict(data.x()).unwrap();
        let b = restored.predict(data.x()).unwrap();
        for (p, q) in a.iter().zip(&b) {
            assert!((p.y_pred - q.y_pred).abs() < 1e-9);
            assert!((p.dissimilarity - q.dissimilarity).abs() < 1e-9);
            assert_eq!(p.prediction_for(&key), q.prediction_for(&key));
        }
    }

    #[test]
    fn test_assess_tags_test_rows() {
        let data = noisy_linear(30, 7);
        let (model, _) = builder().fit(&data).unwrap();
        let rows = model.assess(&data, &[3, 7], 2, "outer").unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].index, 7);
        assert_eq!(rows[1].y, data.y()[7]);
        assert!(rows.iter().all(|r| r.fold_id == 2 && r.split_role == SplitRole::Test));
        assert!(rows.iter().all(|r| r.sigma_y == model.ystd()));
    }
}
