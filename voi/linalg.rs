//! ndarray front end for the `faer` Cholesky solver used by the metamodels.

use faer::linalg::solvers::{Llt, LltError, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, ArrayView1, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinalgError {
    #[error("Matrix is not square: {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },
    #[error("Right-hand side has length {found}, expected {expected}.")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Matrix entries must be finite.")]
    NonFinite,
    #[error("Cholesky factorization failed: {0:?}")]
    NotPositiveDefinite(LltError),
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

/// Borrows a standard-layout matrix as a `faer` view; copies anything else.
struct FaerMatrixView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerMatrixView<'a> {
    fn new(array: ArrayView2<'a, f64>) -> Self {
        let (rows, cols) = array.dim();
        let storage = match array.to_slice() {
            Some(slice) => FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, rows, cols)),
            None => FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        };
        Self { storage }
    }

    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match &self.storage {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Lower Cholesky factor of a symmetric positive-definite matrix.
pub struct CholeskyFactor {
    factor: Llt<f64>,
    dim: usize,
}

impl CholeskyFactor {
    /// Solves `A·x = b`.
    pub fn solve(&self, b: ArrayView1<'_, f64>) -> Result<Array1<f64>, LinalgError> {
        if b.len() != self.dim {
            return Err(LinalgError::DimensionMismatch {
                expected: self.dim,
                found: b.len(),
            });
        }
        let rhs = Mat::from_fn(b.len(), 1, |i, _| b[i]);
        let sol = self.factor.solve(rhs.as_ref());
        Ok(Array1::from_shape_fn(self.dim, |i| sol[(i, 0)]))
    }
}

/// Factors `a`, reading only its lower triangle.
pub fn cholesky(a: ArrayView2<'_, f64>) -> Result<CholeskyFactor, LinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(LinalgError::NotSquare { rows, cols });
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(LinalgError::NonFinite);
    }
    let view = FaerMatrixView::new(a);
    let factor = Llt::new(view.as_ref(), Side::Lower).map_err(LinalgError::NotPositiveDefinite)?;
    Ok(CholeskyFactor { factor, dim: rows })
}
