//! Dissimilarity models scored on the estimator's transformed feature space.

use doa_core::{DistanceFactory, DistanceModel, DomainError, DomainResult, ModelState};
use serde::{Deserialize, Serialize};

const LN_2PI: f64 = 1.837_877_066_409_345_5;
const MIN_BANDWIDTH: f64 = 1e-3;

/// Negative log-likelihood under a Gaussian kernel density estimate.
///
/// Bandwidths follow Scott's rule per dimension: `sigma_j * n^(-1/(d+4))`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KdeDistance {
    points: Vec<Vec<f64>>,
    bandwidths: Vec<f64>,
}

impl KdeDistance {
    pub const KIND: &'static str = "kde";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> impl DistanceFactory {
        || -> Box<dyn DistanceModel> { Box::new(KdeDistance::new()) }
    }

    pub fn bandwidths(&self) -> &[f64] {
        &self.bandwidths
    }

    fn log_density(&self, row: &[f64]) -> f64 {
        let log_norm: f64 = self
            .bandwidths
            .iter()
            .map(|h| -h.ln() - 0.5 * LN_2PI)
            .sum();

        let terms: Vec<f64> = self
            .points
            .iter()
            .map(|p| {
                let q: f64 = p
                    .iter()
                    .zip(row)
                    .zip(&self.bandwidths)
                    .map(|((a, b), h)| ((a - b) / h).powi(2))
                    .sum();
                log_norm - 0.5 * q
            })
            .collect();

        // log-sum-exp to keep far-away points from underflowing to -inf
        let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = terms.iter().map(|t| (t - max).exp()).sum();
        max + sum.ln() - (self.points.len() as f64).ln()
    }
}

impl DistanceModel for KdeDistance {
    fn name(&self) -> &str {
        Self::KIND
    }

    fn fit(&mut self, x: &[Vec<f64>], _y: &[f64]) -> DomainResult<()> {
        if x.is_empty() {
            return Err(DomainError::DataShape("cannot fit KDE on zero rows".to_string()));
        }
        let n = x.len() as f64;
        let d = x[0].len();
        let factor = n.powf(-1.0 / (d as f64 + 4.0));

        self.bandwidths = (0..d)
            .map(|j| {
                let mean = x.iter().map(|r| r[j]).sum::<f64>() / n;
                let var = if x.len() > 1 {
                    x.iter().map(|r| (r[j] - mean).powi(2)).sum::<f64>() / (n - 1.0)
                } else {
                    0.0
                };
                (var.sqrt() * factor).max(MIN_BANDWIDTH)
            })
            .collect();
        self.points = x.to_vec();
        Ok(())
    }

    fn predict(&self, x: &[Vec<f64>]) -> DomainResult<Vec<f64>> {
        if self.points.is_empty() {
            return Err(DomainError::NotFitted(Self::KIND.to_string()));
        }
        Ok(x.iter().map(|row| -self.log_density(row)).collect())
    }

    fn snapshot(&self) -> DomainResult<ModelState> {
        Ok(ModelState {
            kind: Self::KIND.to_string(),
            state: serde_json::to_value(self)?,
        })
    }
}

/// Mean Euclidean distance to the `k` nearest training points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnDistance {
    k: usize,
    points: Vec<Vec<f64>>,
}

impl KnnDistance {
    pub const KIND: &'static str = "knn";

    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(1),
            points: Vec::new(),
        }
    }

    pub fn factory(k: usize) -> impl DistanceFactory {
        move || -> Box<dyn DistanceModel> { Box::new(KnnDistance::new(k)) }
    }
}

impl DistanceModel for KnnDistance {
    fn name(&self) -> &str {
        Self::KIND
    }

    fn fit(&mut self, x: &[Vec<f64>], _y: &[f64]) -> DomainResult<()> {
        if x.is_empty() {
            return Err(DomainError::DataShape("cannot fit kNN on zero rows".to_string()));
        }
        self.points = x.to_vec();
        Ok(())
    }

    fn predict(&self, x: &[Vec<f64>]) -> DomainResult<Vec<f64>> {
        if self.points.is_empty() {
            return Err(DomainError::NotFitted(Self::KIND.to_string()));
        }
        let k = self.k.min(self.points.len());
        Ok(x
            .iter()
            .map(|row| {
                let mut dists: Vec<f64> = self
                    .points
                    .iter()
                    .map(|p| {
                        p.iter()
                            .zip(row)
                            .map(|(a, b)| (a - b).powi(2))
                            .sum::<f64>()
                            .sqrt()
                    })
                    .collect();
                dists.sort_by(|a, b| a.total_cmp(b));
                dists[..k].iter().sum::<f64>() / k as f64
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
