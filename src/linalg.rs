// src/linalg.rs
//
// Dense linear-algebra building blocks shared by the fitters and the spectral
// routines. Every LAPACK call goes through `LinAlgBackendProvider`.

use log::{debug, trace, warn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_rand::RandomExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{check_square, KoopmanError, Result};
use crate::linalg_backends::{
    BackendCholesky, BackendEigh, BackendQR, BackendSVD, EighOutput, LinAlgBackendProvider,
};

/// Default threshold below which eigenvalues count as numerically zero.
pub const DEFAULT_RCOND: f64 = 2.2e-16;

/// Which symmetric eigensolver the fitters use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SolverMode {
    /// Full dense symmetric eigendecomposition.
    #[default]
    Exact,
    /// Leading eigenpairs only, via block subspace iteration.
    Iterative,
}

/// Parameters of the iterative low-rank symmetric eigensolver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterativeSolverConfig {
    /// Iteration cap before the solver reports `SolverFailure`.
    pub max_iterations: usize,
    /// Residual tolerance, relative to the spread of the Ritz values.
    pub tolerance: f64,
    /// Seed of the start block.
    pub seed: u64,
    /// Block columns carried beyond the requested count to speed up convergence.
    pub extra_block_columns: usize,
}

impl Default for IterativeSolverConfig {
    fn default() -> Self {
        IterativeSolverConfig {
            max_iterations: 1000,
            tolerance: 1e-10,
            seed: 2025,
            extra_block_columns: 10,
        }
    }
}

/// Indices of the `k` largest entries of `values`, largest first.
///
/// Equal values keep their input order. NaNs sort last.
pub fn topk(values: ArrayView1<f64>, k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        let (va, vb) = (values[a], values[b]);
        match (va.is_nan(), vb.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => vb.partial_cmp(&va).unwrap_or(std::cmp::Ordering::Equal),
        }
    });
    order.truncate(k);
    order
}

/// Column norms of `vectors` under the metric `metric`: `sqrt(diag(V^T M V))`.
pub fn weighted_norm(vectors: ArrayView2<f64>, metric: ArrayView2<f64>) -> Array1<f64> {
    let weighted = metric.dot(&vectors);
    (&vectors * &weighted)
        .sum_axis(Axis(0))
        .mapv(|sq| sq.max(0.0).sqrt())
}

/// `A^p` for a symmetric positive semi-definite `A`, by eigendecomposition.
///
/// Eigenvalues at or below `cutoff` (default `10 * dim * eps`) are treated as
/// zero and map to zero, so negative powers of singular matrices stay finite.
pub fn spd_neg_pow(
    matrix: ArrayView2<f64>,
    exponent: f64,
    cutoff: Option<f64>,
) -> Result<Array2<f64>> {
    let dim = check_square("spd_neg_pow input", matrix.dim())?;
    let cutoff = cutoff.unwrap_or(10.0 * dim as f64 * f64::EPSILON);
    let backend = LinAlgBackendProvider::<f64>::new();
    let EighOutput { eigenvalues, eigenvectors } = backend
        .eigh_upper(&matrix.to_owned())
        .map_err(|e| KoopmanError::solver("eigendecomposition in spd_neg_pow", e))?;

    let n_dropped = eigenvalues.iter().filter(|&&w| w <= cutoff).count();
    if n_dropped > 0 {
        debug!(
            "spd_neg_pow: {} of {} eigenvalues at or below cutoff {:e} were zeroed.",
            n_dropped, dim, cutoff
        );
    }
    let powered = eigenvalues.mapv(|w| if w > cutoff { w.powf(exponent) } else { 0.0 });
    let scaled_vectors = &eigenvectors * &powered.view().insert_axis(Axis(0));
    Ok(scaled_vectors.dot(&eigenvectors.t()))
}

/// Solves `A X = B` for symmetric positive-definite `A` by Cholesky.
///
/// A matrix that is not positive definite is reported as `SolverFailure`.
pub fn spd_solve(matrix: ArrayView2<f64>, rhs: ArrayView2<f64>) -> Result<Array2<f64>> {
    let dim = check_square("SPD system matrix", matrix.dim())?;
    if rhs.nrows() != dim {
        return Err(KoopmanError::DimensionMismatch(format!(
            "right-hand side has {} rows, system has dimension {}",
            rhs.nrows(),
            dim
        )));
    }
    let backend = LinAlgBackendProvider::<f64>::new();
    let lower = backend
        .cholesky_lower(&matrix.to_owned())
        .map_err(|e| KoopmanError::solver("Cholesky factorization of SPD system", e))?;
    let forward = backend
        .solve_lower(&lower, &rhs.to_owned())
        .map_err(|e| KoopmanError::solver("forward substitution", e))?;
    backend
        .solve_lower_transposed(&lower, &forward)
        .map_err(|e| KoopmanError::solver("backward substitution", e))
}

/// Reduces `A x = w M x` to a standard symmetric problem `C y = w y` with
/// `C = L^-1 A L^-T`, `M = L L^T`. Returns `(C, L)`.
fn cholesky_reduce(
    matrix: ArrayView2<f64>,
    metric: ArrayView2<f64>,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let backend = LinAlgBackendProvider::<f64>::new();
    let lower = backend
        .cholesky_lower(&metric.to_owned())
        .map_err(|e| KoopmanError::solver("Cholesky factorization of metric", e))?;
    let half = backend
        .solve_lower(&lower, &matrix.to_owned())
        .map_err(|e| KoopmanError::solver("metric reduction (left)", e))?;
    let reduced = backend
        .solve_lower(&lower, &half.t().to_owned())
        .map_err(|e| KoopmanError::solver("metric reduction (right)", e))?;
    let symmetric = (&reduced + &reduced.t()) * 0.5;
    Ok((symmetric, lower))
}

/// Generalized symmetric-definite eigenproblem `A x = w M x`.
///
/// Eigenvalues ascending; eigenvectors are `M`-orthonormal.
pub fn generalized_eigh(
    matrix: ArrayView2<f64>,
    metric: ArrayView2<f64>,
) -> Result<EighOutput<f64>> {
    let dim = check_square("generalized eigenproblem matrix", matrix.dim())?;
    if metric.dim() != (dim, dim) {
        return Err(KoopmanError::DimensionMismatch(format!(
            "metric is {:?}, matrix is {}x{}",
            metric.dim(),
            dim,
            dim
        )));
    }
    let (reduced, lower) = cholesky_reduce(matrix, metric)?;
    let backend = LinAlgBackendProvider::<f64>::new();
    let EighOutput { eigenvalues, eigenvectors } = backend
        .eigh_upper(&reduced)
        .map_err(|e| KoopmanError::solver("eigendecomposition of reduced problem", e))?;
    let eigenvectors = backend
        .solve_lower_transposed(&lower, &eigenvectors)
        .map_err(|e| KoopmanError::solver("back-transformation of eigenvectors", e))?;
    Ok(EighOutput { eigenvalues, eigenvectors })
}

/// Dense symmetric eigendecomposition, optionally against a metric.
pub fn dense_eigh(
    matrix: ArrayView2<f64>,
    metric: Option<ArrayView2<f64>>,
) -> Result<EighOutput<f64>> {
    match metric {
        Some(metric) => generalized_eigh(matrix, metric),
        None => {
            check_square("symmetric eigenproblem matrix", matrix.dim())?;
            LinAlgBackendProvider::<f64>::new()
                .eigh_upper(&matrix.to_owned())
                .map_err(|e| KoopmanError::solver("dense symmetric eigendecomposition", e))
        }
    }
}

/// The `num_eigenpairs` eigenpairs of largest modulus of a symmetric matrix,
/// optionally against a positive-definite metric, by block subspace iteration
/// with Rayleigh-Ritz extraction.
///
/// Eigenvalues come back ascending; eigenvectors are (metric-)orthonormal.
/// Requests beyond the dimension are clamped with a warning. Iteration stops
/// once every wanted Ritz residual is below `tolerance` times the spread of
/// the Ritz values, or at round-off level.
pub fn iterative_eigh(
    matrix: ArrayView2<f64>,
    metric: Option<ArrayView2<f64>>,
    num_eigenpairs: usize,
    config: &IterativeSolverConfig,
) -> Result<EighOutput<f64>> {
    let dim = check_square("symmetric eigenproblem matrix", matrix.dim())?;
    let k = if num_eigenpairs > dim {
        warn!(
            "Iterative eigensolver: {} eigenpairs requested for a {}-dimensional problem; \
             clamping to {}.",
            num_eigenpairs, dim, dim
        );
        dim
    } else {
        num_eigenpairs
    };
    if k == 0 {
        return Ok(EighOutput {
            eigenvalues: Array1::zeros(0),
            eigenvectors: Array2::zeros((dim, 0)),
        });
    }

    let (operator, lower) = match metric {
        Some(metric) => {
            if metric.dim() != (dim, dim) {
                return Err(KoopmanError::DimensionMismatch(format!(
                    "metric is {:?}, matrix is {}x{}",
                    metric.dim(),
                    dim,
                    dim
                )));
            }
            let (reduced, lower) = cholesky_reduce(matrix, metric)?;
            (reduced, Some(lower))
        }
        None => (matrix.to_owned(), None),
    };

    let block_size = (k + config.extra_block_columns).min(dim);
    debug!(
        "Iterative eigensolver: dim={}, requested={}, block size={}, max_iterations={}",
        dim, k, block_size, config.max_iterations
    );

    let backend = LinAlgBackendProvider::<f64>::new();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let start_block = Array2::<f64>::random_using((dim, block_size), StandardNormal, &mut rng);
    let mut basis = backend
        .qr_q_factor(&start_block)
        .map_err(|e| KoopmanError::solver("QR of iterative start block", e))?;

    for iteration in 0..config.max_iterations.max(1) {
        let image = operator.dot(&basis);
        let projected = basis.t().dot(&image);
        let projected = (&projected + &projected.t()) * 0.5;
        let ritz = backend
            .eigh_upper(&projected)
            .map_err(|e| KoopmanError::solver("Rayleigh-Ritz eigendecomposition", e))?;

        // Largest modulus first.
        let mut order: Vec<usize> = (0..ritz.eigenvalues.len()).collect();
        order.sort_by(|&a, &b| {
            ritz.eigenvalues[b]
                .abs()
                .partial_cmp(&ritz.eigenvalues[a].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let leading = &order[..k];
        let (lowest, highest) = ritz
            .eigenvalues
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &w| (lo.min(w), hi.max(w)));
        let magnitude = lowest.abs().max(highest.abs());
        let threshold = (config.tolerance * (highest - lowest))
            .max(dim as f64 * f64::EPSILON * magnitude)
            .max(f64::MIN_POSITIVE);

        let coefficients = ritz.eigenvectors.select(Axis(1), leading);
        let values = ritz.eigenvalues.select(Axis(0), leading);
        let ritz_vectors = basis.dot(&coefficients);
        let residual =
            image.dot(&coefficients) - &ritz_vectors * &values.view().insert_axis(Axis(0));
        let worst_residual = residual
            .axis_iter(Axis(1))
            .map(|col| col.dot(&col).sqrt())
            .fold(0.0_f64, f64::max);
        trace!(
            "Iterative eigensolver iteration {}: worst residual {:e}, threshold {:e}",
            iteration + 1,
            worst_residual,
            threshold
        );

        if worst_residual <= threshold || block_size == dim {
            let mut ascending: Vec<usize> = (0..k).collect();
            ascending.sort_by(|&a, &b| {
                values[a].partial_cmp(&values[b]).unwrap_or(std::cmp::Ordering::Equal)
            });
            let eigenvalues = values.select(Axis(0), &ascending);
            let mut eigenvectors = ritz_vectors.select(Axis(1), &ascending);
            if let Some(lower) = lower.as_ref() {
                eigenvectors = backend
                    .solve_lower_transposed(lower, &eigenvectors)
                    .map_err(|e| KoopmanError::solver("back-transformation of Ritz vectors", e))?;
            }
            debug!("Iterative eigensolver converged after {} iterations.", iteration + 1);
            return Ok(EighOutput { eigenvalues, eigenvectors });
        }

        basis = backend
            .qr_q_factor(&image)
            .map_err(|e| KoopmanError::solver("QR in subspace iteration", e))?;
    }

    Err(KoopmanError::SolverFailure(format!(
        "iterative eigensolver did not converge in {} iterations ({} eigenpairs, dimension {})",
        config.max_iterations, k, dim
    )))
}

/// Symmetric eigensolve dispatched on `mode`.
pub(crate) fn symmetric_eigh(
    mode: SolverMode,
    matrix: ArrayView2<f64>,
    metric: Option<ArrayView2<f64>>,
    num_eigenpairs: usize,
    config: &IterativeSolverConfig,
) -> Result<EighOutput<f64>> {
    match mode {
        SolverMode::Exact => dense_eigh(matrix, metric),
        SolverMode::Iterative => iterative_eigh(matrix, metric, num_eigenpairs, config),
    }
}

/// Integer power of a square matrix by repeated squaring.
/// `exponent == 0` is the identity.
pub fn matrix_power(matrix: ArrayView2<f64>, exponent: usize) -> Array2<f64> {
    let mut result = Array2::<f64>::eye(matrix.nrows());
    let mut base = matrix.to_owned();
    let mut remaining = exponent;
    while remaining > 0 {
        if remaining & 1 == 1 {
            result = result.dot(&base);
        }
        remaining >>= 1;
        if remaining > 0 {
            base = base.dot(&base);
        }
    }
    result
}

/// Output of `randomized_svd`: leading left singular vectors and singular values.
#[derive(Debug)]
pub struct RandomizedSvdOutput {
    /// Shape: (nrows, k)
    pub u: Array2<f64>,
    /// Descending, length k.
    pub s: Array1<f64>,
}

/// Randomized truncated SVD (Halko, Martinsson, Tropp, 2011) with QR-normalized
/// power iterations.
///
/// The Gaussian test matrix is drawn from `rng`; the sketch width is
/// `k + n_oversamples`, clamped to the smaller matrix dimension.
pub fn randomized_svd<R: Rng + ?Sized>(
    matrix: ArrayView2<f64>,
    k: usize,
    n_oversamples: usize,
    n_power_iterations: usize,
    rng: &mut R,
) -> Result<RandomizedSvdOutput> {
    let (n_rows, n_cols) = matrix.dim();
    let max_rank = n_rows.min(n_cols);
    if k == 0 || max_rank == 0 {
        return Ok(RandomizedSvdOutput {
            u: Array2::zeros((n_rows, 0)),
            s: Array1::zeros(0),
        });
    }
    let sketch_width = (k + n_oversamples).min(max_rank);
    trace!(
        "Randomized SVD: {}x{} input, target k={}, sketch width={}, power iterations={}",
        n_rows, n_cols, k, sketch_width, n_power_iterations
    );

    let backend = LinAlgBackendProvider::<f64>::new();
    let omega = Array2::<f64>::random_using((n_cols, sketch_width), StandardNormal, rng);
    let mut q_basis = backend
        .qr_q_factor(&matrix.dot(&omega))
        .map_err(|e| KoopmanError::solver("QR of initial randomized sketch", e))?;

    for iteration in 0..n_power_iterations {
        let stage = format!("QR in power iteration {}", iteration + 1);
        let q_tilde = backend
            .qr_q_factor(&matrix.t().dot(&q_basis))
            .map_err(|e| KoopmanError::solver(&stage, e))?;
        q_basis = backend
            .qr_q_factor(&matrix.dot(&q_tilde))
            .map_err(|e| KoopmanError::solver(&stage, e))?;
    }

    let projected = q_basis.t().dot(&matrix);
    let svd_output = backend
        .svd(&projected, true, false)
        .map_err(|e| KoopmanError::solver("SVD of projected sketch", e))?;
    let u_small = svd_output.u.ok_or_else(|| {
        KoopmanError::SolverFailure("SVD of projected sketch returned no U".to_string())
    })?;

    let n_keep = k.min(svd_output.s.len());
    let u = q_basis.dot(&u_small.slice(s![.., ..n_keep]));
    let s = svd_output.s.slice(s![..n_keep]).to_owned();
    Ok(RandomizedSvdOutput { u, s })
}
