//! Rebuild the reference collaborators from persisted model artifacts.

use doa_core::{
    CalibrationModel, DistanceModel, DomainError, DomainResult, Estimator, ModelRestorer,
    ModelState,
};
use serde::de::DeserializeOwned;

use crate::calibration::UncertaintyCalibrator;
use crate::distance::{KdeDistance, KnnDistance};
use crate::ensemble::BaggedRidge;

/// Restorer for every collaborator shipped in this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceRestorer;

fn decode<T: DeserializeOwned>(state: &ModelState) -> DomainResult<T> {
    serde_json::from_value(state.state.clone()).map_err(|e| {
        DomainError::Serialization(format!("cannot restore '{}': {}", state.kind, e))
    })
}

fn unknown(role: &str, state: &ModelState) -> DomainError {
    DomainError::Serialization(format!("unknown {} kind '{}'", role, state.kind))
}

impl ModelRestorer for ReferenceRestorer {
    fn estimator(&self, state: &ModelState) -> DomainResult<Box<dyn Estimator>> {
        match state.kind.as_str() {
            BaggedRidge::KIND => Ok(Box::new(decode::<BaggedRidge>(state)?)),
            _ => Err(unknown("estimator", state)),
        }
    }

    fn distance(&self, state: &ModelState) -> DomainResult<Box<dyn DistanceModel>> {
        match state.kind.as_str() {
            KdeDistance::KIND => Ok(Box::new(decode::<KdeDistance>(state)?)),
            KnnDistance::KIND => Ok(Box::new(decode::<KnnDistance>(state)?)),
            _ => Err(unknown("distance model", state)),
        }
    }

    fn calibration(&self, state: &ModelState) -> DomainResult<Box<dyn CalibrationModel>> {
        match state.kind.as_str() {
            UncertaintyCalibrator::KIND => Ok(Box::new(decode::<UncertaintyCalibrator>(state)?)),
            _ => Err(unknown("calibration model", state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationMethod;
    use crate::ensemble::BaggedRidgeConfig;

    #[test]
    fn test_restored_estimator_predicts_identically() {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64, (i % 3) as f64]).collect();
        let y: Vec<f64> = x.iter().map(|r| r[0] * 0.5 - r[1]).collect();
        let mut model = BaggedRidge::new(BaggedRidgeConfig {
            n_estimators: 5,
            ..Default::default()
        });
        model.fit(&x, &y).unwrap();

        let restored = ReferenceRestorer.estimator(&model.snapshot().unwrap()).unwrap();
        assert_eq!(restored.predict(&x).unwrap(), model.predict(&x).unwrap());
        assert_eq!(
            restored.ensemble_spread(&x).unwrap(),
            model.ensemble_spread(&x).unwrap()
        );
    }

    #[test]
    fn test_restores_distance_and_calibration() {
        let x = vec![vec![0.0], vec![1.0], vec![2.0]];
        let mut kde = KdeDistance::new();
        kde.fit(&x, &[]).unwrap();
        let restored = ReferenceRestorer.distance(&kde.snapshot().unwrap()).unwrap();
        assert_eq!(restored.predict(&x).unwrap(), kde.predict(&x).unwrap());

        let mut cal = UncertaintyCalibrator::new(CalibrationMethod::Scale);
        cal.fit(&[1.0, -1.0], &[0.0, 0.0], &[0.5, 0.5]).unwrap();
        let restored = ReferenceRestorer.calibration(&cal.snapshot().unwrap()).unwrap();
        assert_eq!(restored.predict(&[1.0]).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let state = ModelState {
            kind: "gaussian_process".to_string(),
            state: serde_json::Value::Null,
        };
        assert!(ReferenceRestorer.estimator(&state).is_err());
        assert!(ReferenceRestorer.distance(&state).is_err());
    }
}
