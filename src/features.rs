// src/features.rs

use ndarray::{Array2, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{KoopmanError, Result};

/// Lifts a batch of lookback windows (n_windows, lookback_len, features) to a
/// feature matrix (n_windows, d).
pub trait FeatureMap {
    fn map(&self, windows: ArrayView3<f64>) -> Result<Array2<f64>>;
}

/// Identity lifting: each window is flattened in time-major order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenFeatureMap;

impl FeatureMap for FlattenFeatureMap {
    fn map(&self, windows: ArrayView3<f64>) -> Result<Array2<f64>> {
        let (n_windows, lookback_len, n_features) = windows.dim();
        Array2::from_shape_vec(
            (n_windows, lookback_len * n_features),
            windows.iter().copied().collect(),
        )
        .map_err(|e| KoopmanError::DimensionMismatch(e.to_string()))
    }
}

/// Monomials of the most recent snapshot of each window, up to `degree`,
/// including the constant term. Terms are ordered by degree, then
/// lexicographically in the feature indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolynomialFeatureMap {
    pub degree: usize,
}

impl PolynomialFeatureMap {
    pub fn new(degree: usize) -> Self {
        PolynomialFeatureMap { degree }
    }

    /// Number of output features for `n_features` state variables.
    pub fn output_dim(&self, n_features: usize) -> usize {
        monomial_terms(n_features, self.degree).len()
    }
}

/// Non-decreasing index tuples of every length `0..=degree`.
fn monomial_terms(n_features: usize, degree: usize) -> Vec<Vec<usize>> {
    let mut terms = vec![Vec::new()];
    let mut previous_degree = vec![Vec::new()];
    for _ in 0..degree {
        let mut current_degree = Vec::new();
        for term in &previous_degree {
            let first = term.last().copied().unwrap_or(0);
            for idx in first..n_features {
                let mut extended: Vec<usize> = term.clone();
                extended.push(idx);
                current_degree.push(extended);
            }
        }
        terms.extend(current_degree.iter().cloned());
        previous_degree = current_degree;
    }
    terms
}

impl FeatureMap for PolynomialFeatureMap {
    fn map(&self, windows: ArrayView3<f64>) -> Result<Array2<f64>> {
        let (n_windows, lookback_len, n_features) = windows.dim();
        if lookback_len == 0 {
            return Err(KoopmanError::InvalidContext("empty lookback windows".to_string()));
        }
        let latest = windows.index_axis(Axis(1), lookback_len - 1);
        let terms = monomial_terms(n_features, self.degree);
        let mut features = Array2::<f64>::zeros((n_windows, terms.len()));
        for (state, mut row) in latest.axis_iter(Axis(0)).zip(features.axis_iter_mut(Axis(0))) {
            for (entry, term) in row.iter_mut().zip(terms.iter()) {
                *entry = term.iter().map(|&idx| state[idx]).product();
            }
        }
        Ok(features)
    }
}

/// Empirical (cross-)covariance `phi_x^T phi_y / n`.
pub fn covariance(phi_x: ArrayView2<f64>, phi_y: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n_samples = phi_x.nrows();
    if n_samples == 0 || phi_y.nrows() != n_samples {
        return Err(KoopmanError::DimensionMismatch(format!(
            "covariance needs matching non-empty sample counts, got {} and {}",
            n_samples,
            phi_y.nrows()
        )));
    }
    Ok(phi_x.t().dot(&phi_y) / n_samples as f64)
}
