// src/rank.rs

use log::warn;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{check_rank, KoopmanError, Result};
use crate::linalg::topk;

/// Eigenpairs kept by [`truncate`].
///
/// `vectors` always has `rank` columns. Only the first `numerical_rank` of them
/// are meaningful; the rest are zero. `values` holds the surviving eigenvalues,
/// largest first.
#[derive(Clone, Debug, PartialEq)]
pub struct TruncatedEigenpairs {
    pub values: Array1<f64>,
    pub vectors: Array2<f64>,
    pub rank: usize,
    pub numerical_rank: usize,
}

impl TruncatedEigenpairs {
    /// True when fewer than `rank` eigenpairs survived and zero columns were appended.
    pub fn is_padded(&self) -> bool {
        self.numerical_rank < self.rank
    }

    /// The `numerical_rank` meaningful columns.
    pub fn active_vectors(&self) -> ArrayView2<'_, f64> {
        self.vectors.slice(s![.., ..self.numerical_rank])
    }
}

/// Keeps the `rank` largest eigenpairs, drops those with eigenvalue `<= rcond`
/// and pads the vector block back to `rank` columns with zeros.
///
/// `vectors.column(i)` must belong to `values[i]`. Dropping eigenpairs is
/// logged at warn level and reflected in `numerical_rank`; it is not an error.
pub fn truncate(
    values: ArrayView1<f64>,
    vectors: ArrayView2<f64>,
    rank: usize,
    rcond: f64,
) -> Result<TruncatedEigenpairs> {
    let dim = vectors.nrows();
    check_rank(rank, dim)?;
    if vectors.ncols() != values.len() {
        return Err(KoopmanError::DimensionMismatch(format!(
            "{} eigenvalues but {} eigenvector columns",
            values.len(),
            vectors.ncols()
        )));
    }
    if values.len() < rank {
        return Err(KoopmanError::DimensionMismatch(format!(
            "{} eigenpairs available, rank {} requested",
            values.len(),
            rank
        )));
    }

    let kept: Vec<usize> = topk(values, rank)
        .into_iter()
        .filter(|&idx| values[idx] > rcond)
        .collect();
    let numerical_rank = kept.len();

    if numerical_rank < rank {
        warn!(
            "Numerical rank {} is below the requested rank {}: \
             discarding {} degrees of freedom (rcond = {:e}).",
            numerical_rank,
            rank,
            rank - numerical_rank,
            rcond
        );
    }

    let mut padded = Array2::<f64>::zeros((dim, rank));
    padded
        .slice_mut(s![.., ..numerical_rank])
        .assign(&vectors.select(Axis(1), &kept));

    Ok(TruncatedEigenpairs {
        values: values.select(Axis(0), &kept),
        vectors: padded,
        rank,
        numerical_rank,
    })
}
