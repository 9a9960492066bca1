//! # Connectome Summary Statistic Aggregation
//!
//! Runs the Paule–Mandel combiner independently for every region pair of a
//! cohort of per-study effect-size maps. A study contributes to a pair only
//! when both its effect size and its variance are present there (NaN marks a
//! missing estimate). A pair without any contributing study aborts the whole
//! aggregation: a partially filled summary statistic is never returned.
//!
//! Pairs share no mutable state. They are combined in parallel with rayon,
//! written into the canonical vector order and devectorized once at the end.

use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;

use super::combiner::{CombinedEffect, MetaError, MetaOptions, TauSquared, combine_paule_mandel};
use crate::shared::matrix::{
    CssMatrix, MatrixError, SYMMETRY_TOLERANCE, devectorize, upper_triangle_pairs, validate_square,
};

/// The effect-size and variance maps reported by one study.
#[derive(Debug, Clone)]
pub struct StudyMaps {
    pub name: String,
    pub effect: Array2<f64>,
    pub variance: Array2<f64>,
}

impl StudyMaps {
    pub fn new(name: impl Into<String>, effect: Array2<f64>, variance: Array2<f64>) -> Self {
        Self {
            name: name.into(),
            effect,
            variance,
        }
    }
}

/// The aggregated summary statistic and the diagnostics of its estimation.
#[derive(Debug, Clone)]
pub struct CssAggregate {
    pub css: CssMatrix,
    /// Between-study variance per region pair, laid out like `css`.
    pub heterogeneity: Array2<f64>,
    pub studies: Vec<String>,
    pub converged_pairs: usize,
    pub clamped_pairs: usize,
    pub iteration_limited_pairs: usize,
}

/// Checks symmetry while tolerating missing values, which must be mirrored too.
fn validate_mirrored(matrix: ArrayView2<f64>) -> Result<(), MatrixError> {
    let n = validate_square(matrix)?;
    for (row, col) in upper_triangle_pairs(n) {
        let (upper, lower) = (matrix[[row, col]], matrix[[col, row]]);
        if upper.is_nan() && lower.is_nan() {
            continue;
        }
        let deviation = (upper - lower).abs();
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

fn validate_cohort(studies: &[StudyMaps]) -> Result<usize, MetaError> {
    let first = studies.first().ok_or(MetaError::EmptyCohort)?;
    let n = validate_square(first.effect.view()).map_err(|source| MetaError::InvalidStudyMatrix {
        study: first.name.clone(),
        kind: "effect-size",
        source,
    })?;

    for study in studies {
        for (kind, matrix) in [("effect-size", &study.effect), ("variance", &study.variance)] {
            if matrix.dim() != (n, n) {
                return Err(MetaError::ShapeMismatch {
                    study: study.name.clone(),
                    kind,
                    expected: (n, n),
                    found: matrix.dim(),
                });
            }
            validate_mirrored(matrix.view()).map_err(|source| MetaError::InvalidStudyMatrix {
                study: study.name.clone(),
                kind,
                source,
            })?;
        }
    }
    Ok(n)
}

fn combine_pair(
    studies: &[StudyMaps],
    row: usize,
    col: usize,
    options: &MetaOptions,
) -> Result<CombinedEffect, MetaError> {
    let mut contributing = Vec::with_capacity(studies.len());
    let mut effects = Vec::with_capacity(studies.len());
    let mut variances = Vec::with_capacity(studies.len());

    for (index, study) in studies.iter().enumerate() {
        let effect = study.effect[[row, col]];
        let variance = study.variance[[row, col]];
        if effect.is_nan() || variance.is_nan() {
            continue;
        }
        contributing.push(index);
        effects.push(effect);
        variances.push(variance);
    }

    if effects.is_empty() {
        return Err(MetaError::NoDataForPair { row, col });
    }

    combine_paule_mandel(&effects, &variances, options).map_err(|source| match source {
        MetaError::InvalidVariance { study, .. } | MetaError::NonFiniteEffect { study, .. } => {
            MetaError::StudyData {
                study: studies[contributing[study]].name.clone(),
                row,
                col,
                source: Box::new(source),
            }
        }
        other => other,
    })
}

/// Combines a cohort of study maps into one connectome summary statistic.
///
/// All maps must be `N x N` with the same region ordering. Only the upper
/// triangle is read; the lower triangle is checked to mirror it.
pub fn aggregate_studies(
    studies: &[StudyMaps],
    options: &MetaOptions,
) -> Result<CssAggregate, MetaError> {
    let n = validate_cohort(studies)?;
    let pairs: Vec<(usize, usize)> = upper_triangle_pairs(n).collect();
    log::info!(
        "Aggregating {} studies over {} region pairs ({} regions).",
        studies.len(),
        pairs.len(),
        n
    );

    let combined: Vec<CombinedEffect> = pairs
        .par_iter()
        .map(|&(row, col)| combine_pair(studies, row, col, options))
        .collect::<Result<Vec<_>, MetaError>>()?;

    let effects: Array1<f64> = combined.iter().map(|c| c.effect).collect();
    if let Some(index) = effects.iter().position(|e| e.is_nan()) {
        let (row, col) = pairs[index];
        return Err(MetaError::MissingResult { row, col });
    }
    let tau2: Array1<f64> = combined.iter().map(|c| c.tau_squared.value()).collect();

    let mut converged_pairs = 0;
    let mut clamped_pairs = 0;
    let mut iteration_limited_pairs = 0;
    for c in &combined {
        match c.tau_squared {
            TauSquared::Converged { .. } => converged_pairs += 1,
            TauSquared::ClampedToZero { .. } => clamped_pairs += 1,
            TauSquared::IterationLimit { .. } => iteration_limited_pairs += 1,
        }
    }

    log::info!(
        "tau^2 estimation: {converged_pairs} converged, {clamped_pairs} clamped to zero, {iteration_limited_pairs} hit the iteration limit."
    );
    if iteration_limited_pairs > 0 {
        log::warn!(
            "{} region pairs did not converge within {} iterations; their last tau^2 iterate was used.",
            iteration_limited_pairs,
            options.max_iterations
        );
    }

    let css = CssMatrix::from_vector(effects.view())?;
    let heterogeneity = devectorize(tau2.view())?;

    Ok(CssAggregate {
        css,
        heterogeneity,
        studies: studies.iter().map(|s| s.name.clone()).collect(),
        converged_pairs,
        clamped_pairs,
        iteration_limited_pairs,
    })
}
