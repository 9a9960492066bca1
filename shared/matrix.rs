//! # Symmetric Matrix Codec
//!
//! Connectivity and effect-size matrices are symmetric with a zero diagonal, so
//! only the strictly upper triangle carries information. This module maps
//! between the full `N x N` form and the compact `N(N-1)/2` vector form, one
//! matrix at a time or for a whole stack laid out as `(N, N, subjects)`.
//!
//! The enumeration order is row-major over `i < j`:
//! `(0,1), (0,2), ..., (0,N-1), (1,2), ...`. Every consumer in the crate relies
//! on this order, including the aggregator, which writes its per-pair results
//! straight into a vector and devectorizes once at the end.

use itertools::Itertools;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum absolute difference tolerated between `m[i,j]` and `m[j,i]`.
pub const SYMMETRY_TOLERANCE: f64 = 1e-8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatrixError {
    #[error("Matrix must be square, instead got shape ({rows}, {cols}).")]
    NotSquare { rows: usize, cols: usize },

    #[error("Matrix has no regions. At least one region is required.")]
    Empty,

    #[error(
        "Matrix stack must be square with subjects in the last dimension, i.e. with dimensions (n, n, m), instead got ({}, {}, {}).",
        .shape[0], .shape[1], .shape[2]
    )]
    AmbiguousStackLayout { shape: [usize; 3] },

    #[error(
        "Matrix must be symmetric: entry ({row}, {col}) differs from its mirror by {deviation:.3e}."
    )]
    SymmetryViolation {
        row: usize,
        col: usize,
        deviation: f64,
    },

    #[error("Diagonal must be zero: entry ({index}, {index}) is {value}.")]
    NonZeroDiagonal { index: usize, value: f64 },

    #[error("Matrix entry ({row}, {col}) is not finite ({value}).")]
    NonFinite { row: usize, col: usize, value: f64 },

    #[error("Vector length ({0}) is not compatible with a square matrix.")]
    NotTriangular(usize),
}

/// Iterates the strictly upper-triangular index pairs of an `n x n` matrix in
/// the canonical vectorization order.
pub fn upper_triangle_pairs(n: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..n).tuple_combinations()
}

/// Number of independent entries of an `n x n` symmetric zero-diagonal matrix.
#[inline]
pub fn vector_length(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Solves `N(N-1)/2 = len` for the unique positive integer `N`.
pub fn n_regions_for_length(len: usize) -> Result<usize, MatrixError> {
    let n = ((1.0 + (1.0 + 8.0 * len as f64).sqrt()) / 2.0).round() as usize;
    if vector_length(n) == len {
        Ok(n)
    } else {
        Err(MatrixError::NotTriangular(len))
    }
}

pub fn validate_square(matrix: ArrayView2<f64>) -> Result<usize, MatrixError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(MatrixError::NotSquare { rows, cols });
    }
    if rows == 0 {
        return Err(MatrixError::Empty);
    }
    Ok(rows)
}

pub fn validate_symmetric(matrix: ArrayView2<f64>) -> Result<(), MatrixError> {
    let n = validate_square(matrix)?;
    for (row, col) in upper_triangle_pairs(n) {
        let deviation = (matrix[[row, col]] - matrix[[col, row]]).abs();
        // Written so that NaN deviations fail the check as well.
        if !(deviation <= SYMMETRY_TOLERANCE) {
            return Err(MatrixError::SymmetryViolation {
                row,
                col,
                deviation,
            });
        }
    }
    Ok(())
}

pub fn validate_zero_diagonal(matrix: ArrayView2<f64>) -> Result<(), MatrixError> {
    for (index, &value) in matrix.diag().iter().enumerate() {
        if value != 0.0 {
            return Err(MatrixError::NonZeroDiagonal { index, value });
        }
    }
    Ok(())
}

/// Extracts the upper triangle without validating the matrix.
fn upper_triangle(matrix: ArrayView2<f64>) -> Array1<f64> {
    upper_triangle_pairs(matrix.nrows())
        .map(|(i, j)| matrix[[i, j]])
        .collect()
}

/// Vectorizes one symmetric, zero-diagonal matrix.
pub fn vectorize(matrix: ArrayView2<f64>) -> Result<Array1<f64>, MatrixError> {
    validate_symmetric(matrix)?;
    validate_zero_diagonal(matrix)?;
    Ok(upper_triangle(matrix))
}

/// Vectorizes every subject of a `(N, N, subjects)` stack.
///
/// Returns a `(N(N-1)/2, subjects)` matrix whose column `k` equals
/// `vectorize(stack[.., .., k])`.
pub fn vectorize_stack(stack: ArrayView3<f64>) -> Result<Array2<f64>, MatrixError> {
    let (n, cols, subjects) = stack.dim();
    if cols == subjects && n != cols {
        return Err(MatrixError::AmbiguousStackLayout {
            shape: [n, cols, subjects],
        });
    }
    if n != cols {
        return Err(MatrixError::NotSquare { rows: n, cols });
    }

    let mut vectors = Array2::zeros((vector_length(n), subjects));
    for (k, matrix) in stack.axis_iter(Axis(2)).enumerate() {
        vectors.column_mut(k).assign(&vectorize(matrix)?);
    }
    Ok(vectors)
}

/// Rebuilds the symmetric zero-diagonal matrix from its vector form.
pub fn devectorize(vector: ArrayView1<f64>) -> Result<Array2<f64>, MatrixError> {
    let n = n_regions_for_length(vector.len())?;
    let mut matrix = Array2::zeros((n, n));
    for ((i, j), &value) in upper_triangle_pairs(n).zip(vector.iter()) {
        matrix[[i, j]] = value;
        matrix[[j, i]] = value;
    }
    Ok(matrix)
}

/// Rebuilds a `(N, N, subjects)` stack from a `(N(N-1)/2, subjects)` matrix.
pub fn devectorize_stack(vectors: ArrayView2<f64>) -> Result<Array3<f64>, MatrixError> {
    let n = n_regions_for_length(vectors.nrows())?;
    let mut stack = Array3::zeros((n, n, vectors.ncols()));
    for (k, column) in vectors.axis_iter(Axis(1)).enumerate() {
        stack.slice_mut(s![.., .., k]).assign(&devectorize(column)?);
    }
    Ok(stack)
}

/// A connectome summary statistic: a finite, symmetric, zero-diagonal matrix of
/// per-region-pair effect sizes.
///
/// Instances are immutable once built. Every transformation (slicing,
/// thresholding) produces a new matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct CssMatrix {
    matrix: Array2<f64>,
}

impl CssMatrix {
    pub fn new(matrix: Array2<f64>) -> Result<Self, MatrixError> {
        validate_symmetric(matrix.view())?;
        validate_zero_diagonal(matrix.view())?;
        if let Some(((row, col), &value)) = matrix.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(MatrixError::NonFinite { row, col, value });
        }
        Ok(Self { matrix })
    }

    pub fn from_vector(vector: ArrayView1<f64>) -> Result<Self, MatrixError> {
        Self::new(devectorize(vector)?)
    }

    #[inline]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    #[inline]
    pub fn n_regions(&self) -> usize {
        self.matrix.nrows()
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        self.matrix.dim()
    }

    /// The vector form. Infallible because the invariants were checked at construction.
    pub fn to_vector(&self) -> Array1<f64> {
        upper_triangle(self.matrix.view())
    }

    /// Drops the first `count` regions from both axes.
    pub fn drop_leading_regions(&self, count: usize) -> Result<Self, MatrixError> {
        if count >= self.n_regions() {
            return Err(MatrixError::Empty);
        }
        Self::new(self.matrix.slice(s![count.., count..]).to_owned())
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.matrix
    }
}

impl TryFrom<Vec<f64>> for CssMatrix {
    type Error = MatrixError;

    fn try_from(vector: Vec<f64>) -> Result<Self, Self::Error> {
        Self::from_vector(Array1::from_vec(vector).view())
    }
}

impl From<CssMatrix> for Vec<f64> {
    fn from(css: CssMatrix) -> Self {
        css.to_vector().to_vec()
    }
}
