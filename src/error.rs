// src/error.rs

use std::fmt::Display;

use thiserror::Error;

/// Errors produced by the operator-regression and spectral routines.
///
/// Precondition failures (`InvalidRank`, `InvalidRegularization`,
/// `InvalidTimeSteps`, `DimensionMismatch`, `InvalidContext`) are raised before
/// any decomposition runs. `SolverFailure` and `DegenerateSpectrum` come out of
/// the numerical kernels and are never retried.
///
/// Numerical rank deficiency is not an error: it is logged and reported through
/// the `numerical_rank` field of the fit results.
#[derive(Debug, Error)]
pub enum KoopmanError {
    #[error("invalid rank {rank}: must satisfy 1 <= rank <= {dim}")]
    InvalidRank { rank: usize, dim: usize },

    #[error("invalid Tikhonov regularization {0}: must be finite and non-negative")]
    InvalidRegularization(f64),

    #[error("invalid number of time steps {0}: must be at least 1")]
    InvalidTimeSteps(usize),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("invalid context windows: {0}")]
    InvalidContext(String),

    #[error("solver failure: {0}")]
    SolverFailure(String),

    #[error("degenerate spectrum: biorthogonal pairing of eigentriplet {index} is {pairing:e}")]
    DegenerateSpectrum { index: usize, pairing: f64 },

    #[error("model persistence failed: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, KoopmanError>;

impl KoopmanError {
    /// Wraps a backend error with the stage that produced it.
    pub(crate) fn solver(stage: &str, err: impl Display) -> Self {
        KoopmanError::SolverFailure(format!("{}: {}", stage, err))
    }
}

/// Checks `1 <= rank <= dim`.
pub(crate) fn check_rank(rank: usize, dim: usize) -> Result<()> {
    if rank == 0 || rank > dim {
        return Err(KoopmanError::InvalidRank { rank, dim });
    }
    Ok(())
}

pub(crate) fn check_regularization(tikhonov_reg: f64) -> Result<()> {
    if !tikhonov_reg.is_finite() || tikhonov_reg < 0.0 {
        return Err(KoopmanError::InvalidRegularization(tikhonov_reg));
    }
    Ok(())
}

/// Checks that `matrix` is square, returning its side length.
pub(crate) fn check_square(name: &str, shape: (usize, usize)) -> Result<usize> {
    if shape.0 != shape.1 {
        return Err(KoopmanError::DimensionMismatch(format!(
            "{} must be square, got {}x{}",
            name, shape.0, shape.1
        )));
    }
    Ok(shape.0)
}
