use serde::{Deserialize, Serialize};

use crate::{Dataset, DomainError, DomainResult, Split};

/// Serialized state of a collaborator, tagged with the kind that can restore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub kind: String,
    pub state: serde_json::Value,
}

/// Regression model with optional ensemble spread.
pub trait Estimator: Send {
    fn name(&self) -> &str;

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> DomainResult<()>;

    fn predict(&self, x: &[Vec<f64>]) -> DomainResult<Vec<f64>>;

    /// Features after the estimator's internal preprocessing.
    fn transform(&self, x: &[Vec<f64>]) -> DomainResult<Vec<Vec<f64>>> {
        Ok(x.to_vec())
    }

    /// Per-sample standard deviation across ensemble members.
    fn ensemble_spread(&self, _x: &[Vec<f64>]) -> DomainResult<Vec<f64>> {
        Err(DomainError::UnsupportedCapability(format!(
            "estimator '{}' does not expose an ensemble spread",
            self.name()
        )))
    }

    fn snapshot(&self) -> DomainResult<ModelState> {
        Err(DomainError::UnsupportedCapability(format!(
            "estimator '{}' cannot be persisted",
            self.name()
        )))
    }
}

/// Dissimilarity of query points to a training distribution.
pub trait DistanceModel: Send {
    fn name(&self) -> &str;

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> DomainResult<()>;

    fn predict(&self, x: &[Vec<f64>]) -> DomainResult<Vec<f64>>;

    fn snapshot(&self) -> DomainResult<ModelState> {
        Err(DomainError::UnsupportedCapability(format!(
            "distance model '{}' cannot be persisted",
            self.name()
        )))
    }
}

/// Maps raw uncertainty to calibrated uncertainty.
pub trait CalibrationModel: Send {
    fn name(&self) -> &str;

    fn fit(&mut self, y: &[f64], y_pred: &[f64], raw_std: &[f64]) -> DomainResult<()>;

    fn predict(&self, raw_std: &[f64]) -> DomainResult<Vec<f64>>;

    fn snapshot(&self) -> DomainResult<ModelState> {
        Err(DomainError::UnsupportedCapability(format!(
            "calibration model '{}' cannot be persisted",
            self.name()
        )))
    }
}

/// Deterministic (given its seed) generator of train/test partitions.
pub trait Splitter: Send + Sync {
    fn split(&self, data: &Dataset) -> DomainResult<Vec<Split>>;
}

/// Builds a fresh, unfitted estimator for every fit.
pub trait EstimatorFactory: Send + Sync {
    fn build(&self) -> Box<dyn Estimator>;
}

impl<F> EstimatorFactory for F
where
    F: Fn() -> Box<dyn Estimator> + Send + Sync,
{
    fn build(&self) -> Box<dyn Estimator> {
        self()
    }
}

/// Builds a fresh, unfitted distance model for every fit.
pub trait DistanceFactory: Send + Sync {
    fn build(&self) -> Box<dyn DistanceModel>;
}

impl<F> DistanceFactory for F
where
    F: Fn() -> Box<dyn DistanceModel> + Send + Sync,
{
    fn build(&self) -> Box<dyn DistanceModel> {
        self()
    }
}

/// Builds a fresh, unfitted calibration model for every fit.
pub trait CalibrationFactory: Send + Sync {
    fn build(&self) -> Box<dyn CalibrationModel>;
}

impl<F> CalibrationFactory for F
where
    F: Fn() -> Box<dyn CalibrationModel> + Send + Sync,
{
    fn build(&self) -> Box<dyn CalibrationModel> {
        self()
    }
}

/// Rebuilds live collaborators from their persisted [`ModelState`].
pub trait ModelRestorer: Send + Sync {
    fn estimator(&self, state: &ModelState) -> DomainResult<Box<dyn Estimator>>;

    fn distance(&self, state: &ModelState) -> DomainResult<Box<dyn DistanceModel>>;

    fn calibration(&self, state: &ModelState) -> DomainResult<Box<dyn CalibrationModel>>;
}

/// A splitter tagged with the role name propagated into its records.
pub struct NamedSplitter {
    pub name: String,
    pub splitter: Box<dyn Splitter>,
}

impl NamedSplitter {
    pub fn new(name: impl Into<String>, splitter: impl Splitter + 'static) -> Self {
        Self {
            name: name.into(),
            splitter: Box::new(splitter),
        }
    }
}

impl std::fmt::Debug for NamedSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSplitter").field("name", &self.name).finish()
    }
}
