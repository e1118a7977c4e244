// Koopman operator regression and spectral analysis

#![doc = include_str!("../README.md")]

pub mod context;
pub mod error;
pub mod estimator;
pub mod features;
pub mod linalg;
pub mod linalg_backends;
pub mod predict;
pub mod rank;
pub mod regression;
pub mod spectral;

pub use error::{KoopmanError, Result};
pub use estimator::{EigenfunctionValues, PrimalRegressor};
pub use features::{covariance, FeatureMap, FlattenFeatureMap, PolynomialFeatureMap};
pub use linalg::{IterativeSolverConfig, SolverMode, DEFAULT_RCOND};
pub use predict::predict;
pub use rank::{truncate, TruncatedEigenpairs};
pub use regression::{
    fit_principal_component_regression, fit_rand_principal_component_regression,
    fit_rand_reduced_rank_regression, fit_reduced_rank_regression, Projection, RandomizedConfig,
    RegressionConfig, Strategy,
};
pub use spectral::{
    estimator_eig, estimator_modes, evaluate_eigenfunction, svdvals, Eigendecomposition,
    ModeDecomposition,
};

#[cfg(test)]
mod rank_tests;
#[cfg(test)]
mod regression_tests;
