//! Uncertainty Calibration
//!
//! Maps raw ensemble spreads onto calibrated standard deviations by fitting
//! a correction on held-out residuals.

use argmin::core::{CostFunction, Executor, State, TerminationReason};
use argmin::solver::neldermead::NelderMead;
use doa_core::{CalibrationFactory, CalibrationModel, DomainError, DomainResult, ModelState};
use serde::{Deserialize, Serialize};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Cost returned where the likelihood is undefined.
const UNDEFINED_COST: f64 = 1e10;
const SIMPLEX_SD_TOLERANCE: f64 = 1e-8;

/// Method used for calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationMethod {
    /// `|c0 + c1*s + c2*s^2 + ...|`, coefficients maximise the Gaussian
    /// log-likelihood of the residuals. Holds the starting coefficients.
    Polynomial(Vec<f64>),
    /// `a * s` with the closed-form maximum-likelihood `a`.
    Scale,
    /// No calibration applied
    Identity,
}

impl Default for CalibrationMethod {
    fn default() -> Self {
        CalibrationMethod::Polynomial(vec![0.0, 1.0])
    }
}

/// Statistics about the fitted calibration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationStats {
    /// Mean Gaussian log-likelihood of residuals under raw uncertainties
    pub raw_log_likelihood: f64,
    /// Mean Gaussian log-likelihood of residuals under calibrated uncertainties
    pub calibrated_log_likelihood: f64,
    /// Number of residuals used for calibration
    pub sample_size: usize,
    /// Whether the optimiser met its tolerance (always true for closed forms)
    pub converged: bool,
}

/// Uncertainty calibrator fit on cross-validated residuals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyCalibrator {
    method: CalibrationMethod,
    /// Fitted coefficients, lowest order first
    params: Vec<f64>,
    is_fitted: bool,
    #[serde(skip)]
    stats: Option<CalibrationStats>,
}

impl Default for UncertaintyCalibrator {
    fn default() -> Self {
        Self::new(CalibrationMethod::default())
    }
}

/// Mean Gaussian log-likelihood of `residuals` under standard deviations `std`.
pub fn mean_log_likelihood(residuals: &[f64], std: &[f64]) -> f64 {
    let total: f64 = residuals
        .iter()
        .zip(std)
        .map(|(r, s)| {
            let var = s * s;
            -0.5 * (LN_2PI + var.ln() + r * r / var)
        })
        .sum();
    total / residuals.len() as f64
}

fn polynomial(params: &[f64], s: f64) -> f64 {
    params
        .iter()
        .rev()
        .fold(0.0, |acc, c| acc * s + c)
        .abs()
}

/// Negative mean log-likelihood of the residuals under polynomial-mapped spreads.
struct PolynomialLikelihood {
    residuals: Vec<f64>,
    raw_std: Vec<f64>,
}

impl CostFunction for PolynomialLikelihood {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, coefficients: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let std: Vec<f64> = self.raw_std.iter().map(|s| polynomial(coefficients, *s)).collect();
        let cost = -mean_log_likelihood(&self.residuals, &std);
        Ok(if cost.is_finite() { cost } else { UNDEFINED_COST })
    }
}

/// Starting simplex: 5% perturbation per coordinate, small absolute step for zeros.
fn initial_simplex(start: &[f64]) -> Vec<Vec<f64>> {
    std::iter::once(start.to_vec())
        .chain((0..start.len()).map(|i| {
            let mut vertex = start.to_vec();
            vertex[i] = if vertex[i] != 0.0 { vertex[i] * 1.05 } else { 0.00025 };
            vertex
        }))
        .collect()
}

impl UncertaintyCalibrator {
    pub const KIND: &'static str = "uncertainty_calibrator";

    pub fn new(method: CalibrationMethod) -> Self {
        Self {
            method,
            params: Vec::new(),
            is_fitted: false,
            stats: None,
        }
    }

    pub fn factory(method: CalibrationMethod) -> impl CalibrationFactory {
        move || -> Box<dyn CalibrationModel> { Box::new(UncertaintyCalibrator::new(method.clone())) }
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn stats(&self) -> Option<&CalibrationStats> {
        self.stats.as_ref()
    }

    pub fn is_fitted(&self) -> bool {
        self.is_fitted
    }

    fn apply(&self, s: f64) -> f64 {
        match self.method {
            CalibrationMethod::Polynomial(_) => polynomial(&self.params, s),
            CalibrationMethod::Scale => self.params[0] * s,
            CalibrationMethod::Identity => s,
        }
    }

    fn fit_polynomial(&mut self, start: &[f64], residuals: &[f64], raw_std: &[f64]) -> DomainResult<bool> {
        if start.is_empty() {
            return Err(DomainError::InvalidConfig(
                "polynomial calibration needs at least one starting coefficient".to_string(),
            ));
        }

        let solver = NelderMead::new(initial_simplex(start))
            .with_sd_tolerance(SIMPLEX_SD_TOLERANCE)
            .map_err(|e| DomainError::Numeric(format!("invalid simplex tolerance: {}", e)))?;
        let problem = PolynomialLikelihood {
            residuals: residuals.to_vec(),
            raw_std: raw_std.to_vec(),
        };
        let max_iters = 200 * start.len() as u64;
        let result = Executor::new(problem, solver)
            .configure(|state| state.max_iters(max_iters))
            .run()
            .map_err(|e| DomainError::Numeric(format!("polynomial calibration failed: {}", e)))?;

        let state = result.state();
        let best = state.get_best_cost();
        let Some(coefficients) = state.get_best_param().cloned() else {
            return Err(DomainError::Numeric(
                "polynomial calibration returned no coefficients".to_string(),
            ));
        };
        if !best.is_finite() || best >= UNDEFINED_COST {
            return Err(DomainError::Numeric(
                "polynomial calibration produced a non-finite likelihood".to_string(),
            ));
        }
        let converged = matches!(state.get_termination_reason(), Some(TerminationReason::SolverConverged));
        if !converged {
            tracing::warn!(
                "Polynomial calibration stopped after {} iterations without converging",
                state.get_iter()
            );
        }

        self.params = coefficients;
        Ok(converged)
    }

    fn fit_scale(&mut self, residuals: &[f64], raw_std: &[f64]) -> DomainResult<()> {
        let ratios: Vec<f64> = residuals
            .iter()
            .zip(raw_std)
            .filter(|(_, s)| **s > 0.0)
            .map(|(r, s)| (r / s).powi(2))
            .collect();
        if ratios.is_empty() {
            return Err(DomainError::Numeric(
                "scale calibration needs at least one positive raw uncertainty".to_string(),
            ));
        }
        self.params = vec![(ratios.iter().sum::<f64>() / ratios.len() as f64).sqrt()];
        Ok(())
    }
}

impl CalibrationModel for UncertaintyCalibrator {
    fn name(&self) -> &str {
        Self::KIND
    }

    fn fit(&mut self, y: &[f64], y_pred: &[f64], raw_std: &[f64]) -> DomainResult<()> {
        if y.len() != y_pred.len() || y.len() != raw_std.len() {
            return Err(DomainError::DataShape(format!(
                "calibration inputs have lengths {}, {}, {}",
                y.len(),
                y_pred.len(),
                raw_std.len()
            )));
        }
        if y.is_empty() {
            return Err(DomainError::DataShape("calibration needs at least one residual".to_string()));
        }

        let residuals: Vec<f64> = y.iter().zip(y_pred).map(|(a, b)| a - b).collect();

        let converged = match self.method.clone() {
            CalibrationMethod::Polynomial(start) => self.fit_polynomial(&start, &residuals, raw_std)?,
            CalibrationMethod::Scale => {
                self.fit_scale(&residuals, raw_std)?;
                true
            }
            CalibrationMethod::Identity => {
                self.params = Vec::new();
                true
            }
        };
        self.is_fitted = true;

        let calibrated: Vec<f64> = raw_std.iter().map(|s| self.apply(*s)).collect();
        self.stats = Some(CalibrationStats {
            raw_log_likelihood: mean_log_likelihood(&residuals, raw_std),
            calibrated_log_likelihood: mean_log_likelihood(&residuals, &calibrated),
            sample_size: residuals.len(),
            converged,
        });

        tracing::debug!(
            "Calibrated {} residuals with {:?}: params={:?}",
            residuals.len(),
            self.method,
            self.params
        );
        Ok(())
    }

    fn predict(&self, raw_std: &[f64]) -> DomainResult<Vec<f64>> {
        if !self.is_fitted {
            return Err(DomainError::NotFitted(Self::KIND.to_string()));
        }
        Ok(raw_std.iter().map(|s| self.apply(*s)).collect())
    }

    fn snapshot(&self) -> DomainResult<ModelState> {
        Ok(ModelState {
            kind: Self::KIND.to_string(),
            state: serde_json::to_value(self)?,
        })
    }
}
