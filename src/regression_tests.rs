use crate::error::KoopmanError;
use crate::linalg::{IterativeSolverConfig, SolverMode, DEFAULT_RCOND};
use crate::regression::{
    fit_principal_component_regression, fit_rand_principal_component_regression,
    fit_rand_reduced_rank_regression, fit_reduced_rank_regression, Projection, RandomizedConfig,
    RegressionConfig, Strategy,
};
use approx::assert_abs_diff_eq;
use ndarray::{array, s, Array1, Array2};
use ndarray_linalg::QR;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

fn random_spd(dim: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let factor = Array2::<f64>::random_using((dim, 2 * dim), StandardNormal, &mut rng);
    factor.dot(&factor.t()) / (2 * dim) as f64 + Array2::<f64>::eye(dim) * 0.1
}

fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::<f64>::random_using((rows, cols), StandardNormal, &mut rng)
}

fn regularized(cov_x: &Array2<f64>, tikhonov_reg: f64) -> Array2<f64> {
    cov_x + &(Array2::<f64>::eye(cov_x.nrows()) * tikhonov_reg)
}

/// `basis diag(spectrum) basis^T`.
fn with_spectrum(basis: &Array2<f64>, spectrum: &Array1<f64>) -> Array2<f64> {
    basis.dot(&Array2::from_diag(spectrum)).dot(&basis.t())
}

fn orthonormal_basis(dim: usize, seed: u64) -> Array2<f64> {
    let (q, _) = random_matrix(dim, dim, seed).qr().unwrap();
    q
}

/// Sign- and rotation-invariant summary of a projection.
fn projector(projection: &Projection) -> Array2<f64> {
    projection.matrix.dot(&projection.matrix.t())
}

fn exact_rrr(
    cov_x: &Array2<f64>,
    cov_xy: &Array2<f64>,
    tikhonov_reg: f64,
    rank: usize,
) -> Projection {
    fit_reduced_rank_regression(
        cov_x.view(),
        cov_xy.view(),
        tikhonov_reg,
        rank,
        SolverMode::Exact,
        &IterativeSolverConfig::default(),
        DEFAULT_RCOND,
    )
    .unwrap()
}

#[test]
fn test_pcr_is_orthonormal_under_regularized_covariance() {
    let cov_x = random_spd(6, 1);
    for &tikhonov_reg in &[0.0, 1e-2] {
        for &solver in &[SolverMode::Exact, SolverMode::Iterative] {
            let projection = fit_principal_component_regression(
                cov_x.view(),
                tikhonov_reg,
                3,
                solver,
                &IterativeSolverConfig::default(),
                DEFAULT_RCOND,
            )
            .unwrap();
            assert_eq!(projection.matrix.dim(), (6, 3));
            assert!(!projection.is_rank_deficient());
            let gram = projection
                .matrix
                .t()
                .dot(&regularized(&cov_x, tikhonov_reg))
                .dot(&projection.matrix);
            assert_abs_diff_eq!(gram, Array2::<f64>::eye(3), epsilon = 1e-8);
        }
    }
}

#[test]
fn test_pcr_whitens_leading_eigenvectors() {
    let cov_x = Array2::from_diag(&array![4.0, 2.0, 1.0]);
    let projection = fit_principal_component_regression(
        cov_x.view(),
        0.0,
        2,
        SolverMode::Exact,
        &IterativeSolverConfig::default(),
        DEFAULT_RCOND,
    )
    .unwrap();
    let expected = array![[0.5, 0.0], [0.0, 1.0 / 2.0f64.sqrt()], [0.0, 0.0]];
    assert_abs_diff_eq!(projection.matrix.mapv(f64::abs), expected, epsilon = 1e-12);
}

#[test]
fn test_pcr_pads_rank_deficient_covariance() {
    let cov_x = Array2::from_diag(&array![2.0, 1.0, 0.0]);
    let projection = fit_principal_component_regression(
        cov_x.view(),
        0.0,
        3,
        SolverMode::Exact,
        &IterativeSolverConfig::default(),
        1e-10,
    )
    .unwrap();
    assert_eq!(projection.rank(), 3);
    assert_eq!(projection.dim(), 3);
    assert_eq!(projection.numerical_rank, 2);
    assert!(projection.is_rank_deficient());
    assert!(projection.matrix.column(2).iter().all(|&x| x == 0.0));
    assert!(projection.matrix.iter().all(|x| x.is_finite()));
}

#[test]
fn test_rrr_regularized_is_orthonormal_under_regularized_covariance() {
    let cov_x = random_spd(8, 2);
    let cov_xy = random_matrix(8, 8, 3);
    let tikhonov_reg = 1e-3;
    let projection = exact_rrr(&cov_x, &cov_xy, tikhonov_reg, 3);
    assert_eq!(projection.matrix.dim(), (8, 3));
    let gram =
        projection.matrix.t().dot(&regularized(&cov_x, tikhonov_reg)).dot(&projection.matrix);
    assert_abs_diff_eq!(gram, Array2::<f64>::eye(3), epsilon = 1e-8);
}

#[test]
fn test_rrr_regularized_converges_to_unregularized() {
    let cov_x = random_spd(8, 4);
    let cov_xy = random_matrix(8, 8, 5);
    let unregularized = exact_rrr(&cov_x, &cov_xy, 0.0, 3);
    let gram = unregularized.matrix.t().dot(&cov_x).dot(&unregularized.matrix);
    assert_abs_diff_eq!(gram, Array2::<f64>::eye(3), epsilon = 1e-8);

    let coarse = exact_rrr(&cov_x, &cov_xy, 1e-3, 3);
    let fine = exact_rrr(&cov_x, &cov_xy, 1e-9, 3);
    let coarse_gap = (&projector(&coarse) - &projector(&unregularized)).mapv(f64::abs).sum();
    let fine_gap = (&projector(&fine) - &projector(&unregularized)).mapv(f64::abs).sum();
    assert!(fine_gap < coarse_gap);
    assert_abs_diff_eq!(projector(&fine), projector(&unregularized), epsilon = 1e-6);
}

#[test]
fn test_rrr_iterative_matches_dense() {
    let cov_x = random_spd(12, 6);
    let cov_xy = random_matrix(12, 12, 7);
    for &tikhonov_reg in &[0.0, 1e-4] {
        let dense = exact_rrr(&cov_x, &cov_xy, tikhonov_reg, 3);
        let iterative = fit_reduced_rank_regression(
            cov_x.view(),
            cov_xy.view(),
            tikhonov_reg,
            3,
            SolverMode::Iterative,
            &IterativeSolverConfig::default(),
            DEFAULT_RCOND,
        )
        .unwrap();
        assert_abs_diff_eq!(projector(&iterative), projector(&dense), epsilon = 1e-7);
    }
}

#[test]
fn test_randomized_rrr_matches_exact_on_low_rank_problem() {
    let dim = 20;
    let rank = 3;
    let cov_x = random_spd(dim, 8);
    let cov_xy = random_matrix(dim, rank, 9).dot(&random_matrix(rank, dim, 10));
    let tikhonov_reg = 1e-3;

    let exact = exact_rrr(&cov_x, &cov_xy, tikhonov_reg, rank);
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let randomized = fit_rand_reduced_rank_regression(
        cov_x.view(),
        cov_xy.view(),
        tikhonov_reg,
        rank,
        10,
        2,
        &mut rng,
    )
    .unwrap();

    assert_eq!(randomized.matrix.dim(), (dim, rank));
    assert_abs_diff_eq!(projector(&randomized), projector(&exact), epsilon = 1e-6);
    let gram =
        randomized.matrix.t().dot(&regularized(&cov_x, tikhonov_reg)).dot(&randomized.matrix);
    assert_abs_diff_eq!(gram, Array2::<f64>::eye(rank), epsilon = 1e-8);
}

#[test]
fn test_randomized_rrr_is_reproducible_for_a_fixed_seed() {
    let cov_x = random_spd(10, 12);
    let cov_xy = random_matrix(10, 10, 13);
    let config = RegressionConfig {
        rank: 2,
        tikhonov_reg: 1e-2,
        strategy: Strategy::RandomizedReducedRank(RandomizedConfig {
            n_oversamples: 3,
            iterated_power: 1,
            seed: Some(99),
        }),
        ..RegressionConfig::default()
    };
    let first = config.fit(cov_x.view(), cov_xy.view()).unwrap();
    let second = config.fit(cov_x.view(), cov_xy.view()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_randomized_pcr_matches_exact_when_sketch_covers_space() {
    let cov_x = random_spd(8, 14);
    let exact = fit_principal_component_regression(
        cov_x.view(),
        1e-3,
        3,
        SolverMode::Exact,
        &IterativeSolverConfig::default(),
        DEFAULT_RCOND,
    )
    .unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(15);
    let randomized = fit_rand_principal_component_regression(
        cov_x.view(),
        1e-3,
        3,
        5,
        2,
        DEFAULT_RCOND,
        &mut rng,
    )
    .unwrap();
    assert_abs_diff_eq!(projector(&randomized), projector(&exact), epsilon = 1e-8);
}

#[test]
fn test_diagonal_dynamics_end_to_end() {
    let cov_x = Array2::<f64>::eye(3);
    let cov_xy = Array2::from_diag(&array![3.0, 2.0, 1.0]);
    let leading = Array2::<f64>::eye(3).slice(s![.., ..2]).to_owned();

    let pcr = fit_principal_component_regression(
        cov_x.view(),
        0.0,
        2,
        SolverMode::Exact,
        &IterativeSolverConfig::default(),
        DEFAULT_RCOND,
    )
    .unwrap();
    assert_abs_diff_eq!(pcr.matrix.mapv(f64::abs), leading, epsilon = 1e-12);

    let rrr = exact_rrr(&cov_x, &cov_xy, 0.0, 2);
    assert_abs_diff_eq!(rrr.matrix.mapv(f64::abs), leading, epsilon = 1e-12);
}

#[test]
fn test_config_dispatches_every_strategy() {
    let cov_x = random_spd(7, 16);
    let cov_xy = random_matrix(7, 7, 17);
    let randomized = RandomizedConfig { seed: Some(3), ..RandomizedConfig::default() };
    let strategies = vec![
        Strategy::ReducedRank { solver: SolverMode::Iterative },
        Strategy::RandomizedReducedRank(randomized.clone()),
        Strategy::PrincipalComponent { solver: SolverMode::Exact },
        Strategy::RandomizedPrincipalComponent(randomized),
    ];
    for strategy in strategies {
        let config = RegressionConfig {
            rank: 2,
            tikhonov_reg: 1e-3,
            strategy,
            ..RegressionConfig::default()
        };
        let projection = config.fit(cov_x.view(), cov_xy.view()).unwrap();
        assert_eq!(projection.matrix.dim(), (7, 2));
        let gram = projection.view().t().dot(&regularized(&cov_x, 1e-3)).dot(&projection.view());
        assert_abs_diff_eq!(gram, Array2::<f64>::eye(2), epsilon = 1e-8);
    }
}

#[test]
fn test_fitters_reject_invalid_inputs() {
    let cov_x = Array2::<f64>::eye(3);
    let cov_xy = Array2::<f64>::eye(3);
    let solver_config = IterativeSolverConfig::default();

    let result = fit_reduced_rank_regression(
        cov_x.view(),
        cov_xy.view(),
        0.0,
        4,
        SolverMode::Exact,
        &solver_config,
        DEFAULT_RCOND,
    );
    assert!(matches!(result, Err(KoopmanError::InvalidRank { rank: 4, dim: 3 })));

    let result = fit_principal_component_regression(
        cov_x.view(),
        -1.0,
        2,
        SolverMode::Exact,
        &solver_config,
        DEFAULT_RCOND,
    );
    assert!(matches!(result, Err(KoopmanError::InvalidRegularization(_))));

    let wide = Array2::<f64>::zeros((3, 4));
    let result = fit_reduced_rank_regression(
        cov_x.view(),
        wide.view(),
        0.0,
        2,
        SolverMode::Exact,
        &solver_config,
        DEFAULT_RCOND,
    );
    assert!(matches!(result, Err(KoopmanError::DimensionMismatch(_))));

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let result = fit_rand_reduced_rank_regression(wide.view(), wide.view(), 0.0, 1, 2, 1, &mut rng);
    assert!(matches!(result, Err(KoopmanError::DimensionMismatch(_))));
}

#[test]
fn test_randomized_rrr_fails_on_singular_unregularized_covariance() {
    let cov_x = Array2::from_diag(&array![1.0, 1.0, 0.0]);
    let cov_xy = Array2::<f64>::eye(3);
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let result =
        fit_rand_reduced_rank_regression(cov_x.view(), cov_xy.view(), 0.0, 1, 2, 1, &mut rng);
    assert!(matches!(result, Err(KoopmanError::SolverFailure(_))));
}

#[test]
fn test_projection_accessors() {
    let projection =
        Projection { matrix: array![[1.0, 0.0], [0.0, 0.0], [0.0, 0.0]], numerical_rank: 1 };
    assert_eq!(projection.rank(), 2);
    assert_eq!(projection.dim(), 3);
    assert!(projection.is_rank_deficient());
    assert_eq!(projection.view().ncols(), 2);
    assert_eq!(projection.active_view(), array![[1.0], [0.0], [0.0]]);
    assert_eq!(projection.into_matrix().nrows(), 3);
}

/// C_X and C_XY on 60 features sharing one eigenbasis. The reduced-rank
/// eigenvalues of C_XY C_XY^T against C_X decay like 0.7^i, so the leading
/// subspace is well separated but needs several sweeps of subspace iteration.
fn large_rrr_problem() -> (Array2<f64>, Array2<f64>) {
    let dim = 60;
    let basis = orthonormal_basis(dim, 31);
    let cov_x_spectrum = Array1::from_shape_fn(dim, |i| 1.0 + i as f64 / dim as f64);
    let target = Array1::from_shape_fn(dim, |i| 0.7f64.powi(i as i32));
    let cross_spectrum = Array1::from_shape_fn(dim, |i| (target[i] * cov_x_spectrum[i]).sqrt());
    (with_spectrum(&basis, &cov_x_spectrum), with_spectrum(&basis, &cross_spectrum))
}

#[test]
fn test_rrr_iterative_matches_dense_on_large_problem() {
    let (cov_x, cov_xy) = large_rrr_problem();
    let rank = 3;
    for &tikhonov_reg in &[0.0, 1e-1] {
        let dense = exact_rrr(&cov_x, &cov_xy, tikhonov_reg, rank);
        let iterative = fit_reduced_rank_regression(
            cov_x.view(),
            cov_xy.view(),
            tikhonov_reg,
            rank,
            SolverMode::Iterative,
            &IterativeSolverConfig::default(),
            DEFAULT_RCOND,
        )
        .unwrap();
        assert_eq!(iterative.matrix.dim(), (60, rank));
        assert!(!iterative.is_rank_deficient());
        assert_abs_diff_eq!(projector(&iterative), projector(&dense), epsilon = 1e-7);
        let gram = iterative
            .matrix
            .t()
            .dot(&regularized(&cov_x, tikhonov_reg))
            .dot(&iterative.matrix);
        assert_abs_diff_eq!(gram, Array2::<f64>::eye(rank), epsilon = 1e-8);
    }
}

#[test]
fn test_pcr_iterative_matches_dense_when_regularization_dominates() {
    let dim = 60;
    let rank = 3;
    let basis = orthonormal_basis(dim, 32);
    let spectrum = Array1::from_shape_fn(dim, |i| 1e-3 * 0.7f64.powi(i as i32));
    let cov_x = with_spectrum(&basis, &spectrum);
    for &tikhonov_reg in &[0.0, 1e-2, 1.0] {
        let fit = |solver| {
            fit_principal_component_regression(
                cov_x.view(),
                tikhonov_reg,
                rank,
                solver,
                &IterativeSolverConfig::default(),
                DEFAULT_RCOND,
            )
            .unwrap()
        };
        let dense = fit(SolverMode::Exact);
        let iterative = fit(SolverMode::Iterative);
        assert!(!iterative.is_rank_deficient());
        // Without regularization the whitened columns are large; compare relatively.
        let scale = projector(&dense).fold(0.0_f64, |acc, x| acc.max(x.abs()));
        assert_abs_diff_eq!(
            projector(&iterative) / scale,
            projector(&dense) / scale,
            epsilon = 1e-6
        );
        let gram = iterative
            .matrix
            .t()
            .dot(&regularized(&cov_x, tikhonov_reg))
            .dot(&iterative.matrix);
        assert_abs_diff_eq!(gram, Array2::<f64>::eye(rank), epsilon = 1e-8);
    }
}
