// src/predict.rs

use log::debug;
use ndarray::{Array2, ArrayView2};

use crate::error::{KoopmanError, Result};
use crate::linalg::matrix_power;
use crate::spectral::{check_operator_inputs, finite_operator};

/// Forecasts an observable `num_steps` steps ahead of the initial conditions.
///
/// Uses `G^n = U (U^T C_XY U)^{n-1} U^T C_XY` for the fitted operator
/// `G = U U^T C_XY`, so only the rank x rank operator is ever raised to a
/// power. `observables` holds the observable at the training lookforward
/// states, one row per row of `phi_x`.
///
/// Returns an array of shape (n_init, observable dimension).
pub fn predict(
    num_steps: usize,
    projection: ArrayView2<f64>,
    cov_xy: ArrayView2<f64>,
    phi_x_init: ArrayView2<f64>,
    phi_x: ArrayView2<f64>,
    observables: ArrayView2<f64>,
) -> Result<Array2<f64>> {
    if num_steps == 0 {
        return Err(KoopmanError::InvalidTimeSteps(num_steps));
    }
    let (dim, rank) = check_operator_inputs(projection, cov_xy)?;
    if phi_x_init.ncols() != dim || phi_x.ncols() != dim {
        return Err(KoopmanError::DimensionMismatch(format!(
            "feature matrices have {} and {} columns, expected {}",
            phi_x_init.ncols(),
            phi_x.ncols(),
            dim
        )));
    }
    let n_train = phi_x.nrows();
    if n_train == 0 || observables.nrows() != n_train {
        return Err(KoopmanError::DimensionMismatch(format!(
            "{} observable rows for {} training points",
            observables.nrows(),
            n_train
        )));
    }
    debug!(
        "Predicting {} steps ahead for {} initial conditions (rank {}).",
        num_steps,
        phi_x_init.nrows(),
        rank
    );

    let init_projected = phi_x_init.dot(&projection);
    let operator_power = matrix_power(finite_operator(projection, cov_xy).view(), num_steps - 1);
    let readout = projection.t().dot(&phi_x.t().dot(&observables)) / n_train as f64;
    Ok(init_projected.dot(&operator_power).dot(&readout))
}
