// src/spectral.rs

use log::{debug, trace};
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis, Zip};
use ndarray_linalg::c64;
use rayon::prelude::*;

use crate::error::{check_square, KoopmanError, Result};
use crate::linalg_backends::{BackendEig, BackendSVD, EigOutput, LinAlgBackendProvider};

/// Eigentriplets of a fitted operator, in feature space.
///
/// Column `i` of `left` and `right` belongs to `eigenvalues[i]`. Eigenvalues
/// are sorted ascending by real part, then imaginary part. Right eigenvectors
/// have unit Euclidean norm; left eigenvectors are scaled so that
/// `sum(left[:, i] * right[:, i]) == 1` (bilinear, no conjugation).
#[derive(Clone, Debug)]
pub struct Eigendecomposition {
    pub eigenvalues: Array1<c64>,
    pub left: Array2<c64>,
    pub right: Array2<c64>,
}

/// Eigenvalues of a fitted operator together with its mode tensor.
///
/// `modes[[i, j, k]]` is the contribution of eigenvalue `i`, evaluated at
/// initial condition `j`, of training point `k`. Contracting the last axis
/// with an observable on the training lookforward states and weighting mode
/// `i` by `eigenvalues[i]^t` gives the `t`-step forecast.
#[derive(Clone, Debug)]
pub struct ModeDecomposition {
    pub eigenvalues: Array1<c64>,
    /// Shape (rank, n_init, n_train).
    pub modes: Array3<c64>,
}

impl ModeDecomposition {
    /// Modes weighted by `eigenvalues^t` and summed over eigenvalues.
    pub fn forecast(&self, t: usize) -> Array2<c64> {
        let (_, n_init, n_cols) = self.modes.dim();
        let mut total = Array2::<c64>::zeros((n_init, n_cols));
        for (eigenvalue, mode) in self.eigenvalues.iter().zip(self.modes.axis_iter(Axis(0))) {
            total.scaled_add(complex_power(*eigenvalue, t), &mode);
        }
        total
    }
}

/// `base^exponent` by repeated squaring, like [`matrix_power`](crate::linalg::matrix_power).
fn complex_power(base: c64, exponent: usize) -> c64 {
    let mut result = c64::new(1.0, 0.0);
    let mut base = base;
    let mut remaining = exponent;
    while remaining > 0 {
        if remaining & 1 == 1 {
            result *= base;
        }
        remaining >>= 1;
        if remaining > 0 {
            base *= base;
        }
    }
    result
}

pub(crate) fn to_complex(matrix: ArrayView2<f64>) -> Array2<c64> {
    matrix.mapv(|x| c64::new(x, 0.0))
}

fn column_norm(column: ndarray::ArrayView1<c64>) -> f64 {
    column.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt()
}

/// Checks U (d x rank) against C_XY (d x d) and returns (d, rank).
pub(crate) fn check_operator_inputs(
    projection: ArrayView2<f64>,
    cov_xy: ArrayView2<f64>,
) -> Result<(usize, usize)> {
    let dim = check_square("cross-covariance", cov_xy.dim())?;
    if projection.nrows() != dim {
        return Err(KoopmanError::DimensionMismatch(format!(
            "projection has {} rows, cross-covariance has dimension {}",
            projection.nrows(),
            dim
        )));
    }
    Ok((dim, projection.ncols()))
}

fn check_features(name: &str, features: ArrayView2<f64>, dim: usize) -> Result<()> {
    if features.ncols() != dim {
        return Err(KoopmanError::DimensionMismatch(format!(
            "{} have {} columns, expected feature dimension {}",
            name,
            features.ncols(),
            dim
        )));
    }
    Ok(())
}

/// `U^T C_XY U`, the operator restricted to the span of U.
pub fn finite_operator(projection: ArrayView2<f64>, cov_xy: ArrayView2<f64>) -> Array2<f64> {
    projection.t().dot(&cov_xy.dot(&projection))
}

/// Order of `values` ascending by (real, imaginary).
fn ascending_order(values: &Array1<c64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .re
            .total_cmp(&values[b].re)
            .then_with(|| values[a].im.total_cmp(&values[b].im))
    });
    order
}

/// For each target eigenvalue, the index of the closest not yet used candidate.
fn match_eigenvalues(targets: &Array1<c64>, candidates: &Array1<c64>) -> Vec<usize> {
    let mut used = vec![false; candidates.len()];
    targets
        .iter()
        .map(|target| {
            let mut best: Option<(usize, f64)> = None;
            for (idx, candidate) in candidates.iter().enumerate() {
                if used[idx] {
                    continue;
                }
                let distance = (candidate - target).norm();
                if best.map_or(true, |(_, d)| distance < d) {
                    best = Some((idx, distance));
                }
            }
            // Both inputs have the same length, so a candidate is always left.
            let idx = best.map_or(0, |(idx, _)| idx);
            used[idx] = true;
            idx
        })
        .collect()
}

/// Small-space eigenvectors kept alongside the feature-space ones; the mode
/// decomposition needs the normalized small left vectors.
struct Eigentriplets {
    values: Array1<c64>,
    left_small: Array2<c64>,
    left: Array2<c64>,
    right: Array2<c64>,
}

fn eigentriplets(projection: ArrayView2<f64>, cov_xy: ArrayView2<f64>) -> Result<Eigentriplets> {
    let (dim, rank) = check_operator_inputs(projection, cov_xy)?;
    if rank == 0 {
        return Ok(Eigentriplets {
            values: Array1::zeros(0),
            left_small: Array2::zeros((0, 0)),
            left: Array2::zeros((dim, 0)),
            right: Array2::zeros((dim, 0)),
        });
    }
    let operator = finite_operator(projection, cov_xy);
    let backend = LinAlgBackendProvider::<f64>::new();

    let EigOutput { eigenvalues: raw_values, eigenvectors: raw_right } = backend
        .eig_right(&operator)
        .map_err(|e| KoopmanError::solver("eigendecomposition of the finite operator", e))?;
    let EigOutput { eigenvalues: transposed_values, eigenvectors: raw_left } = backend
        .eig_right(&operator.t().to_owned())
        .map_err(|e| {
            KoopmanError::solver("eigendecomposition of the transposed finite operator", e)
        })?;

    let right_order = ascending_order(&raw_values);
    let values = raw_values.select(Axis(0), &right_order);
    let right_small = raw_right.select(Axis(1), &right_order);
    let left_order = match_eigenvalues(&values, &transposed_values);
    let mut left_small = raw_left.select(Axis(1), &left_order);
    trace!("Finite operator spectrum (rank {}): {:?}", rank, values);

    let mut right = to_complex(projection).dot(&right_small);
    for mut column in right.axis_iter_mut(Axis(1)) {
        let norm = column_norm(column.view());
        if norm > 0.0 {
            column.mapv_inplace(|z| z / norm);
        }
    }

    let mut left = to_complex(cov_xy.t().dot(&projection).view()).dot(&left_small);
    let tolerance = f64::EPSILON.sqrt();
    for index in 0..rank {
        let pairing: c64 = Zip::from(left.column(index))
            .and(right.column(index))
            .fold(c64::new(0.0, 0.0), |acc, l, r| acc + l * r);
        let scale = column_norm(left.column(index)) * column_norm(right.column(index));
        if !pairing.is_finite() || !(pairing.norm() > tolerance * scale) {
            return Err(KoopmanError::DegenerateSpectrum { index, pairing: pairing.norm() });
        }
        left.column_mut(index).mapv_inplace(|z| z / pairing);
        left_small.column_mut(index).mapv_inplace(|z| z / pairing);
    }

    Ok(Eigentriplets { values, left_small, left, right })
}

/// Eigenvalues and biorthogonal left/right eigenvectors of the operator
/// `U U^T C_XY` restricted to the span of U.
///
/// Left eigenvectors are taken from `(U^T C_XY U)^T` and paired with the
/// sorted right eigenvalues by nearest eigenvalue. A pairing that vanishes is
/// reported as `DegenerateSpectrum`. Zero columns of a padded projection
/// give vanishing pairings; pass
/// [`Projection::active_view`](crate::Projection::active_view) instead.
pub fn estimator_eig(
    projection: ArrayView2<f64>,
    cov_xy: ArrayView2<f64>,
) -> Result<Eigendecomposition> {
    let Eigentriplets { values, left, right, .. } = eigentriplets(projection, cov_xy)?;
    debug!("Computed {} eigentriplets of the fitted operator.", values.len());
    Ok(Eigendecomposition { eigenvalues: values, left, right })
}

/// Mode decomposition of the fitted operator.
///
/// `phi_x` are the training input features (n_train x d), `phi_x_init` the
/// features of the initial conditions (n_init x d).
pub fn estimator_modes(
    projection: ArrayView2<f64>,
    cov_xy: ArrayView2<f64>,
    phi_x: ArrayView2<f64>,
    phi_x_init: ArrayView2<f64>,
) -> Result<ModeDecomposition> {
    let (dim, rank) = check_operator_inputs(projection, cov_xy)?;
    check_features("training features", phi_x, dim)?;
    check_features("initial-condition features", phi_x_init, dim)?;
    let n_train = phi_x.nrows();
    if n_train == 0 {
        return Err(KoopmanError::DimensionMismatch("no training features".to_string()));
    }

    let Eigentriplets { values, left_small, right, .. } = eigentriplets(projection, cov_xy)?;

    // (n_init, rank)
    let right_at_init = to_complex(phi_x_init).dot(&right);
    // (n_train, rank)
    let scaled_projected = phi_x.dot(&projection) / n_train as f64;
    let left_at_train = to_complex(scaled_projected.view()).dot(&left_small);

    let mut modes = Array3::<c64>::zeros((rank, phi_x_init.nrows(), n_train));
    modes
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(mode_idx, mut mode)| {
            let right_col = right_at_init.column(mode_idx);
            let left_col = left_at_train.column(mode_idx);
            Zip::indexed(&mut mode).for_each(|(init_idx, train_idx), entry| {
                *entry = right_col[init_idx] * left_col[train_idx];
            });
        });

    Ok(ModeDecomposition { eigenvalues: values, modes })
}

/// Evaluates eigenfunctions at new points: `phi @ eigenvectors`.
pub fn evaluate_eigenfunction(
    phi: ArrayView2<f64>,
    eigenvectors: ArrayView2<c64>,
) -> Result<Array2<c64>> {
    if phi.ncols() != eigenvectors.nrows() {
        return Err(KoopmanError::DimensionMismatch(format!(
            "features have {} columns, eigenvectors have {} rows",
            phi.ncols(),
            eigenvectors.nrows()
        )));
    }
    Ok(to_complex(phi).dot(&eigenvectors))
}

/// Singular values of `U U^T C_XY`, descending.
pub fn svdvals(projection: ArrayView2<f64>, cov_xy: ArrayView2<f64>) -> Result<Array1<f64>> {
    check_operator_inputs(projection, cov_xy)?;
    let operator = projection.dot(&projection.t().dot(&cov_xy));
    let output = LinAlgBackendProvider::<f64>::new()
        .svd(&operator, false, false)
        .map_err(|e| KoopmanError::solver("singular values of the fitted operator", e))?;
    Ok(output.s)
}
