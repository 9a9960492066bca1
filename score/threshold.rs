//! Significance pre-filtering of a summary statistic before scoring.

use ndarray::{Array1, ArrayView2};
use thiserror::Error;

use crate::shared::matrix::{CssMatrix, MatrixError, upper_triangle_pairs};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("The significance level must lie in (0, 1], got {0}.")]
    InvalidAlpha(f64),

    #[error("p-values of shape {p_values:?} do not match the summary statistic of shape {css:?}.")]
    ShapeMismatch {
        css: (usize, usize),
        p_values: (usize, usize),
    },

    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// Zeroes every region pair whose p-value exceeds `alpha`.
///
/// Only the upper triangle of `p_values` is read. A NaN p-value counts as not
/// significant, so with `alpha == 1` exactly the pairs with a finite p-value
/// are kept.
pub fn threshold_by_p_value(
    css: &CssMatrix,
    p_values: ArrayView2<f64>,
    alpha: f64,
) -> Result<CssMatrix, ThresholdError> {
    if !(alpha > 0.0 && alpha <= 1.0) {
        return Err(ThresholdError::InvalidAlpha(alpha));
    }
    if p_values.dim() != css.shape() {
        return Err(ThresholdError::ShapeMismatch {
            css: css.shape(),
            p_values: p_values.dim(),
        });
    }

    let effects = css.to_vector();
    let kept: Array1<f64> = upper_triangle_pairs(css.n_regions())
        .zip(effects.iter())
        .map(|((i, j), &effect)| if p_values[[i, j]] <= alpha { effect } else { 0.0 })
        .collect();

    let retained = kept.iter().filter(|&&v| v != 0.0).count();
    log::info!(
        "Kept {} of {} region pairs at p <= {}.",
        retained,
        kept.len(),
        alpha
    );
    Ok(CssMatrix::from_vector(kept.view())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn css() -> CssMatrix {
        CssMatrix::new(array![[0.0, 1.0, 2.0], [1.0, 0.0, 3.0], [2.0, 3.0, 0.0]]).unwrap()
    }

    #[test]
    fn test_entries_above_alpha_are_zeroed() {
        // The lower triangle is ignored.
        let p = array![[1.0, 0.01, 0.2], [0.9, 1.0, f64::NAN], [0.0, 0.0, 1.0]];
        let filtered = threshold_by_p_value(&css(), p.view(), 0.05).unwrap();
        assert_eq!(
            filtered.view(),
            array![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 0.0]].view()
        );

        let filtered = threshold_by_p_value(&css(), p.view(), 1.0).unwrap();
        assert_eq!(filtered.to_vector(), array![1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_invalid_arguments() {
        let p = ndarray::Array2::<f64>::zeros((3, 3));
        for alpha in [0.0, -0.1, 1.5, f64::NAN] {
            assert!(matches!(
                threshold_by_p_value(&css(), p.view(), alpha),
                Err(ThresholdError::InvalidAlpha(_))
            ));
        }
        let small = ndarray::Array2::<f64>::zeros((2, 2));
        assert_eq!(
            threshold_by_p_value(&css(), small.view(), 0.05).unwrap_err(),
            ThresholdError::ShapeMismatch {
                css: (3, 3),
                p_values: (2, 2)
            }
        );
    }
}
