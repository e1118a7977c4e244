// src/linalg_backends.rs

use ndarray::{Array1, Array2};
use ndarray_linalg::Scalar;
use std::error::Error;
use std::marker::PhantomData;

/// Entry point for all dense decompositions; dispatches to the backend
/// selected at compile time.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

/// A thread-safe wrapper for backend errors.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

// --- Trait Definitions ---

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues in ascending order.
    pub eigenvalues: Array1<F>,
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<F>,
}

/// Symmetric eigendecomposition (LAPACK `?syevd`). Only the upper triangle is read.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, ThreadSafeStdError>;
}

/// Output of a general (non-symmetric) eigendecomposition.
#[derive(Debug)]
pub struct EigOutput<C: 'static> {
    /// Eigenvalues in the order returned by LAPACK.
    pub eigenvalues: Array1<C>,
    /// Right eigenvectors as columns, unit Euclidean norm.
    pub eigenvectors: Array2<C>,
}

/// General eigendecomposition (LAPACK `?geev`), right eigenvectors only.
///
/// Left eigenvectors of `A` are obtained as right eigenvectors of `A^T`.
pub trait BackendEig<F: Scalar + Send + Sync> {
    fn eig_right(&self, matrix: &Array2<F>) -> Result<EigOutput<F::Complex>, ThreadSafeStdError>;
}

/// Cholesky factorization and the triangular solves built on it.
pub trait BackendCholesky<F: 'static + Copy + Send + Sync> {
    /// Lower factor `L` with `A = L L^T`. Fails when `A` is not positive definite.
    fn cholesky_lower(&self, matrix: &Array2<F>) -> Result<Array2<F>, ThreadSafeStdError>;
    /// Solves `L X = B` for lower-triangular `L`.
    fn solve_lower(
        &self,
        lower: &Array2<F>,
        rhs: &Array2<F>,
    ) -> Result<Array2<F>, ThreadSafeStdError>;
    /// Solves `L^T X = B` for lower-triangular `L`.
    fn solve_lower_transposed(
        &self,
        lower: &Array2<F>,
        rhs: &Array2<F>,
    ) -> Result<Array2<F>, ThreadSafeStdError>;
}

/// QR decomposition, focusing on retrieving the Q factor.
pub trait BackendQR<F: 'static + Copy + Send + Sync> {
    fn qr_q_factor(&self, matrix: &Array2<F>) -> Result<Array2<F>, ThreadSafeStdError>;
}

/// Output of a Singular Value Decomposition.
#[derive(Debug)]
pub struct SVDOutput<F: 'static> {
    pub u: Option<Array2<F>>,
    pub s: Array1<F>,
    pub vt: Option<Array2<F>>,
}

/// Singular Value Decomposition.
pub trait BackendSVD<F: 'static + Copy + Send + Sync> {
    fn svd(
        &self,
        matrix: &Array2<F>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput<F>, ThreadSafeStdError>;
}

// --- NdarrayLinAlgBackend Implementation ---
use ndarray_linalg::{
    Cholesky as NdLinalgCholesky, Diag, Eig as NdLinalgEig, Eigh as NdLinalgEigh,
    SolveTriangular as NdLinalgSolveTriangular, QR as NdLinalgQR, SVD as NdLinalgSVD, UPLO,
};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> ThreadSafeStdError {
    Box::new(e)
}

impl BackendEigh<f64> for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, ThreadSafeStdError> {
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendEig<f64> for NdarrayLinAlgBackend {
    fn eig_right(
        &self,
        matrix: &Array2<f64>,
    ) -> Result<EigOutput<ndarray_linalg::c64>, ThreadSafeStdError> {
        let (eigenvalues, eigenvectors) = matrix.eig().map_err(to_dyn_error)?;
        Ok(EigOutput { eigenvalues, eigenvectors })
    }
}

impl BackendCholesky<f64> for NdarrayLinAlgBackend {
    fn cholesky_lower(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        matrix.cholesky(UPLO::Lower).map_err(to_dyn_error)
    }

    fn solve_lower(
        &self,
        lower: &Array2<f64>,
        rhs: &Array2<f64>,
    ) -> Result<Array2<f64>, ThreadSafeStdError> {
        lower
            .solve_triangular(UPLO::Lower, Diag::NonUnit, rhs)
            .map_err(to_dyn_error)
    }

    fn solve_lower_transposed(
        &self,
        lower: &Array2<f64>,
        rhs: &Array2<f64>,
    ) -> Result<Array2<f64>, ThreadSafeStdError> {
        let upper = lower.t().to_owned();
        upper
            .solve_triangular(UPLO::Upper, Diag::NonUnit, rhs)
            .map_err(to_dyn_error)
    }
}

impl BackendQR<f64> for NdarrayLinAlgBackend {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        let (q_factor, _r) = matrix.qr().map_err(to_dyn_error)?;
        Ok(q_factor)
    }
}

impl BackendSVD<f64> for NdarrayLinAlgBackend {
    fn svd(
        &self,
        matrix: &Array2<f64>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput<f64>, ThreadSafeStdError> {
        let (u, s, vt) = NdLinalgSVD::svd(matrix, compute_u, compute_v).map_err(to_dyn_error)?;
        Ok(SVDOutput { u, s, vt })
    }
}

// --- LinAlgBackendProvider Dispatch ---
//
// Every BLAS/LAPACK flavour selected through the `backend_*` cargo features is
// reached through ndarray-linalg, so the provider forwards to
// `NdarrayLinAlgBackend`. Numerical code only ever names the provider.

impl<F> BackendEigh<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendEigh<F>,
{
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.eigh_upper(matrix)
    }
}

impl<F> BackendEig<F> for LinAlgBackendProvider<F>
where
    F: Scalar + Send + Sync,
    NdarrayLinAlgBackend: BackendEig<F>,
{
    fn eig_right(&self, matrix: &Array2<F>) -> Result<EigOutput<F::Complex>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.eig_right(matrix)
    }
}

impl<F> BackendCholesky<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendCholesky<F>,
{
    fn cholesky_lower(&self, matrix: &Array2<F>) -> Result<Array2<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.cholesky_lower(matrix)
    }

    fn solve_lower(
        &self,
        lower: &Array2<F>,
        rhs: &Array2<F>,
    ) -> Result<Array2<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.solve_lower(lower, rhs)
    }

    fn solve_lower_transposed(
        &self,
        lower: &Array2<F>,
        rhs: &Array2<F>,
    ) -> Result<Array2<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.solve_lower_transposed(lower, rhs)
    }
}

impl<F> BackendQR<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendQR<F>,
{
    fn qr_q_factor(&self, matrix: &Array2<F>) -> Result<Array2<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.qr_q_factor(matrix)
    }
}

impl<F> BackendSVD<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendSVD<F>,
{
    fn svd(
        &self,
        matrix: &Array2<F>,
        compute_u: bool,
        compute_v: bool,
    ) -> Result<SVDOutput<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.svd(matrix, compute_u, compute_v)
    }
}
