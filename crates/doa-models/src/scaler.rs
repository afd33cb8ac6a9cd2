//! Column standardisation used as the preprocessing step of estimators.

use doa_core::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};

/// Zero-mean, unit-variance scaling per feature column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StandardScaler {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(x: &[Vec<f64>]) -> DomainResult<Self> {
        let n = x.len();
        if n == 0 {
            return Err(DomainError::DataShape("cannot fit scaler on zero rows".to_string()));
        }
        let d = x[0].len();

        let mut means = vec![0.0; d];
        for row in x {
            for (m, v) in means.iter_mut().zip(row) {
                *m += v;
            }
        }
        means.iter_mut().for_each(|m| *m /= n as f64);

        let mut scales = vec![0.0; d];
        for row in x {
            for ((s, v), m) in scales.iter_mut().zip(row).zip(&means) {
                *s += (v - m).powi(2);
            }
        }
        // Constant columns are left unscaled
        for s in scales.iter_mut() {
            let std = (*s / n as f64).sqrt();
            *s = if std > 1e-12 { std } else { 1.0 };
        }

        Ok(Self { means, scales })
    }

    pub fn n_features(&self) -> usize {
        self.means.len()
    }

    pub fn transform(&self, x: &[Vec<f64>]) -> DomainResult<Vec<Vec<f64>>> {
        x.iter()
            .enumerate()
            .map(|(i, row)| {
                if row.len() != self.means.len() {
                    return Err(DomainError::DataShape(format!(
                        "row {} has {} features, scaler was fit on {}",
                        i,
                        row.len(),
                        self.means.len()
                    )));
                }
                Ok(row
                    .iter()
                    .zip(&self.means)
                    .zip(&self.scales)
                    .map(|((v, m), s)| (v - m) / s)
                    .collect())
            })
            .collect()
    }
}
