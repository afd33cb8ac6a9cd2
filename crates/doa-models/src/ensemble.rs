//! Bootstrap-aggregated ridge regression.
//!
//! Each member is fit on a bootstrap resample of the standardised training
//! set. The spread of member predictions is the raw uncertainty estimate.

use doa_core::{DomainError, DomainResult, Estimator, EstimatorFactory, ModelState};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::scaler::StandardScaler;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaggedRidgeConfig {
    pub n_estimators: usize,
    /// L2 penalty; must be positive so every member's system is solvable.
    pub alpha: f64,
    pub seed: u64,
}

impl Default for BaggedRidgeConfig {
    fn default() -> Self {
        Self {
            n_estimators: 50,
            alpha: 1e-3,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RidgeMember {
    coef: Vec<f64>,
    intercept: f64,
}

impl RidgeMember {
    fn predict(&self, row: &[f64]) -> f64 {
        self.intercept + row.iter().zip(&self.coef).map(|(x, w)| x * w).sum::<f64>()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaggedRidge {
    config: BaggedRidgeConfig,
    scaler: Option<StandardScaler>,
    members: Vec<RidgeMember>,
}

impl BaggedRidge {
    pub const KIND: &'static str = "bagged_ridge";

    pub fn new(config: BaggedRidgeConfig) -> Self {
        Self {
            config,
            scaler: None,
            members: Vec::new(),
        }
    }

    /// Factory producing a fresh, unfitted ensemble per call.
    pub fn factory(config: BaggedRidgeConfig) -> impl EstimatorFactory {
        move || -> Box<dyn Estimator> { Box::new(BaggedRidge::new(config.clone())) }
    }

    fn scaler(&self) -> DomainResult<&StandardScaler> {
        self.scaler
            .as_ref()
            .ok_or_else(|| DomainError::NotFitted(Self::KIND.to_string()))
    }

    /// Predictions of every member, indexed `[member][sample]`.
    fn member_predictions(&self, x: &[Vec<f64>]) -> DomainResult<Vec<Vec<f64>>> {
        let xt = self.scaler()?.transform(x)?;
        Ok(self
            .members
            .iter()
            .map(|m| xt.iter().map(|row| m.predict(row)).collect())
            .collect())
    }
}

fn fit_member(x: &[Vec<f64>], y: &[f64], sample: &[usize], alpha: f64) -> DomainResult<RidgeMember> {
    let n = sample.len();
    let d = x[0].len();

    let mut x_mean = vec![0.0; d];
    let mut y_mean = 0.0;
    for &i in sample {
        for (m, v) in x_mean.iter_mut().zip(&x[i]) {
            *m += v;
        }
        y_mean += y[i];
    }
    x_mean.iter_mut().for_each(|m| *m /= n as f64);
    y_mean /= n as f64;

    let a = DMatrix::from_fn(n, d, |r, c| x[sample[r]][c] - x_mean[c]);
    let b = DVector::from_fn(n, |r, _| y[sample[r]] - y_mean);

    let mut gram = a.transpose() * &a;
    for i in 0..d {
        gram[(i, i)] += alpha;
    }
    let rhs = a.transpose() * b;

    let coef = gram
        .cholesky()
        .ok_or_else(|| DomainError::Numeric("ridge normal equations are not positive definite".to_string()))?
        .solve(&rhs);

    let intercept = y_mean - coef.iter().zip(&x_mean).map(|(w, m)| w * m).sum::<f64>();

    Ok(RidgeMember {
        coef: coef.iter().copied().collect(),
        intercept,
    })
}

impl Estimator for BaggedRidge {
    fn name(&self) -> &str {
        Self::KIND
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> DomainResult<()> {
        if x.len() != y.len() || x.is_empty() {
            return Err(DomainError::DataShape(format!(
                "cannot fit on {} rows and {} targets",
                x.len(),
                y.len()
            )));
        }
        if self.config.n_estimators == 0 || self.config.alpha <= 0.0 {
            return Err(DomainError::InvalidConfig(format!(
                "bagged ridge needs n_estimators > 0 and alpha > 0, got {:?}",
                self.config
            )));
        }

        let scaler = StandardScaler::fit(x)?;
        let xt = scaler.transform(x)?;
        let n = xt.len();
        let alpha = self.config.alpha;
        let seed = self.config.seed;

        // Each member seeds its own generator, so the result is independent of scheduling
        let members: DomainResult<Vec<RidgeMember>> = (0..self.config.n_estimators)
            .into_par_iter()
            .map(|m| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(m as u64));
                let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                fit_member(&xt, y, &sample, alpha)
            })
            .collect();

        self.members = members?;
        self.scaler = Some(scaler);
        Ok(())
    }

    fn predict(&self, x: &[Vec<f64>]) -> DomainResult<Vec<f64>> {
        let preds = self.member_predictions(x)?;
        let k = preds.len() as f64;
        Ok((0..x.len())
            .map(|i| preds.iter().map(|p| p[i]).sum::<f64>() / k)
            .collect())
    }

    fn transform(&self, x: &[Vec<f64>]) -> DomainResult<Vec<Vec<f64>>> {
        self.scaler()?.transform(x)
    }

    fn ensemble_spread(&self, x: &[Vec<f64>]) -> DomainResult<Vec<f64>> {
        let preds = self.member_predictions(x)?;
        let k = preds.len() as f64;
        Ok((0..x.len())
            .map(|i| {
                let mean = preds.iter().map(|p| p[i]).sum::<f64>() / k;
                let var = preds.iter().map(|p| (p[i] - mean).powi(2)).sum::<f64>() / k;
                var.sqrt()
            })
            .collect())
    }

    fn snapshot(&self) -> DomainResult<ModelState> {
        Ok(ModelState {
            kind: Self::KIND.to_string(),
            state: serde_json::to_value(self)?,
        })
    }
}
