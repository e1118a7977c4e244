// src/regression.rs
//
// Estimators of the projection matrix U (d x rank) of a rank-constrained
// Koopman/transfer operator from the input covariance C_X and the
// cross-covariance C_XY. All four estimators return a `Projection` whose
// columns are orthonormal under C_X + lambda I; columns beyond the numerical
// rank are zero.

use log::{debug, info};
use ndarray::{s, Array2, ArrayView2, Axis};
use ndarray_rand::RandomExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{check_rank, check_regularization, check_square, KoopmanError, Result};
use crate::linalg::{
    dense_eigh, generalized_eigh, iterative_eigh, randomized_svd, spd_neg_pow, spd_solve,
    symmetric_eigh, topk, weighted_norm, IterativeSolverConfig, RandomizedSvdOutput, SolverMode,
    DEFAULT_RCOND,
};
use crate::linalg_backends::{BackendQR, EighOutput, LinAlgBackendProvider};
use crate::rank::{truncate, TruncatedEigenpairs};

/// Extra eigenpairs requested from the iterative solver in the reduced-rank
/// paths. Ritz pairs at the edge of the requested block converge last.
const ITERATIVE_SAFETY_MARGIN: usize = 3;

/// Fitted projection matrix together with the rank it actually achieved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// Shape (d, rank). Columns `numerical_rank..` are zero.
    pub matrix: Array2<f64>,
    pub numerical_rank: usize,
}

impl Projection {
    /// Requested rank, i.e. the number of columns.
    pub fn rank(&self) -> usize {
        self.matrix.ncols()
    }

    /// Feature dimension d.
    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_rank_deficient(&self) -> bool {
        self.numerical_rank < self.rank()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    /// The first `numerical_rank` columns, without the zero padding.
    pub fn active_view(&self) -> ArrayView2<'_, f64> {
        self.matrix.slice(s![.., ..self.numerical_rank])
    }

    pub fn into_matrix(self) -> Array2<f64> {
        self.matrix
    }
}

/// Sketching parameters of the randomized estimators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandomizedConfig {
    /// Sketch columns drawn beyond the target rank.
    pub n_oversamples: usize,
    /// Number of power iterations sharpening the sketch.
    pub iterated_power: usize,
    /// Seed of the sketch; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for RandomizedConfig {
    fn default() -> Self {
        RandomizedConfig {
            n_oversamples: 10,
            iterated_power: 2,
            seed: None,
        }
    }
}

impl RandomizedConfig {
    /// Random source for one fit.
    pub fn rng(&self) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        }
    }
}

/// Estimator family and its solver parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Strategy {
    ReducedRank { solver: SolverMode },
    RandomizedReducedRank(RandomizedConfig),
    PrincipalComponent { solver: SolverMode },
    RandomizedPrincipalComponent(RandomizedConfig),
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::ReducedRank { solver: SolverMode::Exact }
    }
}

/// Full configuration of a projection fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegressionConfig {
    pub rank: usize,
    pub tikhonov_reg: f64,
    pub strategy: Strategy,
    /// Eigenvalues at or below this are treated as numerically zero.
    pub rcond: f64,
    pub iterative: IterativeSolverConfig,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        RegressionConfig {
            rank: 5,
            tikhonov_reg: 0.0,
            strategy: Strategy::default(),
            rcond: DEFAULT_RCOND,
            iterative: IterativeSolverConfig::default(),
        }
    }
}

impl RegressionConfig {
    /// Runs the configured estimator. Randomized strategies draw their sketch
    /// from [`RandomizedConfig::rng`].
    pub fn fit(&self, cov_x: ArrayView2<f64>, cov_xy: ArrayView2<f64>) -> Result<Projection> {
        match &self.strategy {
            Strategy::ReducedRank { solver } => fit_reduced_rank_regression(
                cov_x,
                cov_xy,
                self.tikhonov_reg,
                self.rank,
                *solver,
                &self.iterative,
                self.rcond,
            ),
            Strategy::RandomizedReducedRank(randomized) => fit_rand_reduced_rank_regression(
                cov_x,
                cov_xy,
                self.tikhonov_reg,
                self.rank,
                randomized.n_oversamples,
                randomized.iterated_power,
                &mut randomized.rng(),
            ),
            Strategy::PrincipalComponent { solver } => {
                check_cross_covariance(cov_x, cov_xy)?;
                fit_principal_component_regression(
                    cov_x,
                    self.tikhonov_reg,
                    self.rank,
                    *solver,
                    &self.iterative,
                    self.rcond,
                )
            }
            Strategy::RandomizedPrincipalComponent(randomized) => {
                check_cross_covariance(cov_x, cov_xy)?;
                fit_rand_principal_component_regression(
                    cov_x,
                    self.tikhonov_reg,
                    self.rank,
                    randomized.n_oversamples,
                    randomized.iterated_power,
                    self.rcond,
                    &mut randomized.rng(),
                )
            }
        }
    }
}

fn check_cross_covariance(cov_x: ArrayView2<f64>, cov_xy: ArrayView2<f64>) -> Result<()> {
    if cov_xy.dim() != cov_x.dim() {
        return Err(KoopmanError::DimensionMismatch(format!(
            "cross-covariance is {:?}, covariance is {:?}",
            cov_xy.dim(),
            cov_x.dim()
        )));
    }
    Ok(())
}

/// Validates (C_X, rank, lambda) and returns d.
fn check_fit_inputs(cov_x: ArrayView2<f64>, tikhonov_reg: f64, rank: usize) -> Result<usize> {
    let dim = check_square("input covariance", cov_x.dim())?;
    check_rank(rank, dim)?;
    check_regularization(tikhonov_reg)?;
    Ok(dim)
}

fn regularized(cov_x: ArrayView2<f64>, tikhonov_reg: f64) -> Array2<f64> {
    let mut reg = cov_x.to_owned();
    reg.diag_mut().mapv_inplace(|x| x + tikhonov_reg);
    reg
}

/// Divides every non-zero column by its norm under `metric`. Zero padding stays zero.
fn normalize_columns(vectors: &mut Array2<f64>, metric: ArrayView2<f64>) {
    let norms = weighted_norm(vectors.view(), metric);
    for (mut column, norm) in vectors.axis_iter_mut(Axis(1)).zip(norms.iter()) {
        if *norm > 0.0 {
            column.mapv_inplace(|x| x / norm);
        }
    }
}

/// Exact reduced-rank regression.
///
/// With `tikhonov_reg > 0` this solves `C_XY C_XY^T u = w (C_X + lambda I) u`
/// and keeps the `rank` leading eigenvectors, normalized under the regularized
/// covariance. With `tikhonov_reg == 0` it whitens by `C_X^{-1/2}` instead,
/// which tolerates a singular `C_X`.
///
/// The iterative solver is asked for a few eigenpairs beyond `rank`.
pub fn fit_reduced_rank_regression(
    cov_x: ArrayView2<f64>,
    cov_xy: ArrayView2<f64>,
    tikhonov_reg: f64,
    rank: usize,
    solver: SolverMode,
    iterative: &IterativeSolverConfig,
    rcond: f64,
) -> Result<Projection> {
    let dim = check_fit_inputs(cov_x, tikhonov_reg, rank)?;
    check_cross_covariance(cov_x, cov_xy)?;
    info!(
        "Fitting reduced-rank regression: dim={}, rank={}, tikhonov_reg={:e}, solver={:?}",
        dim, rank, tikhonov_reg, solver
    );
    let start_time = std::time::Instant::now();
    let num_eigenpairs = (rank + ITERATIVE_SAFETY_MARGIN).min(dim);

    let projection = if tikhonov_reg == 0.0 {
        let rsqrt_cov_x = spd_neg_pow(cov_x, -0.5, None)?;
        let whitened_cross = rsqrt_cov_x.dot(&cov_xy);
        let whitened_gram = whitened_cross.dot(&whitened_cross.t());
        let EighOutput { eigenvalues, eigenvectors } =
            symmetric_eigh(solver, whitened_gram.view(), None, num_eigenpairs, iterative)?;
        let truncated = truncate(eigenvalues.view(), eigenvectors.view(), rank, rcond)?;
        Projection {
            matrix: rsqrt_cov_x.dot(&truncated.vectors),
            numerical_rank: truncated.numerical_rank,
        }
    } else {
        let reg_cov_x = regularized(cov_x, tikhonov_reg);
        let cross_gram = cov_xy.dot(&cov_xy.t());
        let EighOutput { eigenvalues, eigenvectors } = symmetric_eigh(
            solver,
            cross_gram.view(),
            Some(reg_cov_x.view()),
            num_eigenpairs,
            iterative,
        )?;
        let TruncatedEigenpairs { mut vectors, numerical_rank, .. } =
            truncate(eigenvalues.view(), eigenvectors.view(), rank, rcond)?;
        normalize_columns(&mut vectors, reg_cov_x.view());
        Projection { matrix: vectors, numerical_rank }
    };

    info!(
        "Reduced-rank regression done in {:?} (numerical rank {} of {})",
        start_time.elapsed(),
        projection.numerical_rank,
        rank
    );
    Ok(projection)
}

/// Randomized reduced-rank regression.
///
/// Sketches the dominant subspace of `(C_X + lambda I)^{-1} C_XY C_XY^T` with
/// `rank + n_oversamples` Gaussian columns and `iterated_power` power
/// iterations, then solves the projected generalized eigenproblem exactly.
/// The regularized covariance must be positive definite.
pub fn fit_rand_reduced_rank_regression<R: Rng + ?Sized>(
    cov_x: ArrayView2<f64>,
    cov_xy: ArrayView2<f64>,
    tikhonov_reg: f64,
    rank: usize,
    n_oversamples: usize,
    iterated_power: usize,
    rng: &mut R,
) -> Result<Projection> {
    let dim = check_fit_inputs(cov_x, tikhonov_reg, rank)?;
    check_cross_covariance(cov_x, cov_xy)?;
    let sketch_width = (rank + n_oversamples).min(dim);
    info!(
        "Fitting randomized reduced-rank regression: dim={}, rank={}, sketch width={}, \
         power iterations={}",
        dim, rank, sketch_width, iterated_power
    );
    let start_time = std::time::Instant::now();

    let reg_cov_x = regularized(cov_x, tikhonov_reg);
    let cross_gram = cov_xy.dot(&cov_xy.t());
    let backend = LinAlgBackendProvider::<f64>::new();

    let mut sketch = Array2::<f64>::random_using((dim, sketch_width), StandardNormal, rng);
    for iteration in 0..iterated_power {
        let preimage = spd_solve(reg_cov_x.view(), sketch.view())?;
        // Orthonormalize so repeated products neither overflow nor collapse.
        let stage = format!("QR in sketch power iteration {}", iteration + 1);
        sketch = backend
            .qr_q_factor(&cross_gram.dot(&preimage))
            .map_err(|e| KoopmanError::solver(&stage, e))?;
    }
    let sketch_preimage = spd_solve(reg_cov_x.view(), sketch.view())?;

    let gram = sketch_preimage.t().dot(&sketch);
    let gram = (&gram + &gram.t()) * 0.5;
    let projected = sketch_preimage.t().dot(&cross_gram.dot(&sketch_preimage));
    let EighOutput { eigenvalues, mut eigenvectors } =
        generalized_eigh(projected.view(), gram.view())?;
    normalize_columns(&mut eigenvectors, gram.view());

    let leading = topk(eigenvalues.view(), rank);
    debug!(
        "Randomized reduced-rank regression: leading projected eigenvalues {:?}",
        eigenvalues.select(Axis(0), &leading)
    );
    let mut matrix = Array2::<f64>::zeros((dim, rank));
    let selected = sketch_preimage.dot(&eigenvectors.select(Axis(1), &leading));
    matrix.slice_mut(s![.., ..selected.ncols()]).assign(&selected);

    info!("Randomized reduced-rank regression done in {:?}", start_time.elapsed());
    Ok(Projection { matrix, numerical_rank: leading.len() })
}

/// Scales each of the first `numerical_rank` columns by `value^{-1/2}`.
fn whiten(truncated: TruncatedEigenpairs) -> Projection {
    let TruncatedEigenpairs { values, mut vectors, numerical_rank, .. } = truncated;
    for (mut column, value) in vectors.axis_iter_mut(Axis(1)).zip(values.iter()) {
        let scale = value.sqrt().recip();
        column.mapv_inplace(|x| x * scale);
    }
    Projection { matrix: vectors, numerical_rank }
}

/// Exact principal-component regression: the `rank` leading eigenvectors of
/// `C_X + lambda I`, each scaled by the inverse square root of its eigenvalue.
pub fn fit_principal_component_regression(
    cov_x: ArrayView2<f64>,
    tikhonov_reg: f64,
    rank: usize,
    solver: SolverMode,
    iterative: &IterativeSolverConfig,
    rcond: f64,
) -> Result<Projection> {
    let dim = check_fit_inputs(cov_x, tikhonov_reg, rank)?;
    info!(
        "Fitting principal-component regression: dim={}, rank={}, tikhonov_reg={:e}, solver={:?}",
        dim, rank, tikhonov_reg, solver
    );
    let start_time = std::time::Instant::now();

    let EighOutput { eigenvalues, eigenvectors } = match solver {
        SolverMode::Exact => dense_eigh(regularized(cov_x, tikhonov_reg).view(), None)?,
        SolverMode::Iterative => {
            // C_X + lambda I shares the eigenvectors of C_X.
            let EighOutput { eigenvalues, eigenvectors } =
                iterative_eigh(cov_x, None, rank, iterative)?;
            EighOutput { eigenvalues: eigenvalues + tikhonov_reg, eigenvectors }
        }
    };
    let projection = whiten(truncate(eigenvalues.view(), eigenvectors.view(), rank, rcond)?);

    info!(
        "Principal-component regression done in {:?} (numerical rank {} of {})",
        start_time.elapsed(),
        projection.numerical_rank,
        rank
    );
    Ok(projection)
}

/// Randomized principal-component regression: as the exact variant, with the
/// leading eigenpairs taken from a randomized SVD of `C_X + lambda I`.
pub fn fit_rand_principal_component_regression<R: Rng + ?Sized>(
    cov_x: ArrayView2<f64>,
    tikhonov_reg: f64,
    rank: usize,
    n_oversamples: usize,
    iterated_power: usize,
    rcond: f64,
    rng: &mut R,
) -> Result<Projection> {
    let dim = check_fit_inputs(cov_x, tikhonov_reg, rank)?;
    info!(
        "Fitting randomized principal-component regression: dim={}, rank={}, oversamples={}, \
         power iterations={}",
        dim, rank, n_oversamples, iterated_power
    );
    let start_time = std::time::Instant::now();

    let reg_cov_x = regularized(cov_x, tikhonov_reg);
    let RandomizedSvdOutput { u, s } =
        randomized_svd(reg_cov_x.view(), rank, n_oversamples, iterated_power, rng)?;
    let projection = whiten(truncate(s.view(), u.view(), rank, rcond)?);

    info!(
        "Randomized principal-component regression done in {:?} (numerical rank {} of {})",
        start_time.elapsed(),
        projection.numerical_rank,
        rank
    );
    Ok(projection)
}
