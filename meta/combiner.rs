//! # Paule–Mandel Random-Effects Combination
//!
//! Fuses the per-study estimates of one region pair into a single effect size.
//! Studies are weighted by the inverse of their total variance, which is the
//! within-study sampling variance plus a between-study variance `tau^2` that is
//! estimated from the data rather than assumed to be zero.
//!
//! `tau^2` is the root of the Paule–Mandel estimating equation
//! `Q(tau^2) - (K - 1) = 0`, where `Q` is the weighted residual sum of squares.
//! Starting from zero, each step moves `tau^2` by `ee / sum(w^2 r^2)`. When the
//! equation is already negative at zero the studies are more homogeneous than
//! sampling noise alone would predict, and the estimate is clamped to zero,
//! which is the fixed-effects model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shared::matrix::MatrixError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetaError {
    #[error("No study provides an estimate; at least one study is required.")]
    NoStudies,

    #[error("Received {effects} effect sizes but {variances} variances.")]
    LengthMismatch { effects: usize, variances: usize },

    #[error("Study {study} has variance {value}; variances must be strictly positive and finite.")]
    InvalidVariance { study: usize, value: f64 },

    #[error("Study {study} has a non-finite effect size ({value}).")]
    NonFiniteEffect { study: usize, value: f64 },

    #[error("No data for region pair ({row}, {col}): no study provides both an effect size and a variance.")]
    NoDataForPair { row: usize, col: usize },

    #[error("Study '{study}' at region pair ({row}, {col}): {source}")]
    StudyData {
        study: String,
        row: usize,
        col: usize,
        #[source]
        source: Box<MetaError>,
    },

    #[error("Cannot aggregate an empty cohort; at least one study is required.")]
    EmptyCohort,

    #[error(
        "Study '{study}' has {found:?} {kind} matrix, but the cohort uses {expected:?} matrices."
    )]
    ShapeMismatch {
        study: String,
        kind: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Study '{study}' has an invalid {kind} matrix: {source}")]
    InvalidStudyMatrix {
        study: String,
        kind: &'static str,
        #[source]
        source: MatrixError,
    },

    #[error("Aggregated map still contains a missing value at ({row}, {col}).")]
    MissingResult { row: usize, col: usize },

    #[error("Aggregated map violates the summary-statistic invariants: {0}")]
    Matrix(#[from] MatrixError),
}

/// Numerical settings of the `tau^2` solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaOptions {
    pub max_iterations: usize,
    /// Absolute tolerance on the estimating equation.
    pub tolerance: f64,
}

impl Default for MetaOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-5,
        }
    }
}

/// Outcome of the between-study variance estimation.
///
/// Only `Converged` is a proper root of the estimating equation. The other two
/// are defined fallbacks and are never reported as errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TauSquared {
    Converged { tau2: f64, iterations: usize },
    /// The equation was negative, so the fixed-effects model (`tau^2 = 0`) applies.
    ClampedToZero { iterations: usize },
    /// The iteration budget ran out; the last iterate is used.
    IterationLimit { tau2: f64 },
}

impl TauSquared {
    #[inline]
    pub fn value(&self) -> f64 {
        match *self {
            TauSquared::Converged { tau2, .. } => tau2,
            TauSquared::ClampedToZero { .. } => 0.0,
            TauSquared::IterationLimit { tau2 } => tau2,
        }
    }

    #[inline]
    pub fn is_converged(&self) -> bool {
        matches!(self, TauSquared::Converged { .. })
    }
}

/// The combined estimate for one region pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedEffect {
    pub effect: f64,
    /// `sqrt(1 / sum(w))` at the final `tau^2`.
    pub standard_error: f64,
    pub tau_squared: TauSquared,
    /// Cochran's Q at the final `tau^2`.
    pub q_statistic: f64,
    pub studies: usize,
}

struct WeightedSummary {
    mean: f64,
    sum_weights: f64,
    q: f64,
    sum_squared_weighted_residuals: f64,
}

fn weighted_summary(effects: &[f64], variances: &[f64], tau2: f64) -> WeightedSummary {
    // Shifting by the first effect keeps a single study, or identical
    // studies, exactly equal to the input.
    let anchor = effects[0];
    let mut sum_weights = 0.0;
    let mut weighted_shift = 0.0;
    for (&e, &v) in effects.iter().zip(variances) {
        let w = 1.0 / (v + tau2);
        sum_weights += w;
        weighted_shift += w * (e - anchor);
    }
    let mean = anchor + weighted_shift / sum_weights;

    let mut q = 0.0;
    let mut sum_squared_weighted_residuals = 0.0;
    for (&e, &v) in effects.iter().zip(variances) {
        let w = 1.0 / (v + tau2);
        let r2 = (e - mean) * (e - mean);
        q += w * r2;
        sum_squared_weighted_residuals += w * w * r2;
    }

    WeightedSummary {
        mean,
        sum_weights,
        q,
        sum_squared_weighted_residuals,
    }
}

fn validate_inputs(effects: &[f64], variances: &[f64]) -> Result<(), MetaError> {
    if effects.len() != variances.len() {
        return Err(MetaError::LengthMismatch {
            effects: effects.len(),
            variances: variances.len(),
        });
    }
    if effects.is_empty() {
        return Err(MetaError::NoStudies);
    }
    for (study, (&e, &v)) in effects.iter().zip(variances).enumerate() {
        if !e.is_finite() {
            return Err(MetaError::NonFiniteEffect { study, value: e });
        }
        if !(v.is_finite() && v > 0.0) {
            return Err(MetaError::InvalidVariance { study, value: v });
        }
    }
    Ok(())
}

/// Combines `K >= 1` study estimates with a Paule–Mandel random-effects model.
///
/// # Arguments
/// * `effects`: one effect size per study.
/// * `variances`: the matching within-study variances, strictly positive.
/// * `options`: iteration budget and tolerance of the `tau^2` solver.
///
/// # Returns
/// The combined effect together with the tagged `tau^2` outcome. Failure to
/// converge is part of the result, not an error.
pub fn combine_paule_mandel(
    effects: &[f64],
    variances: &[f64],
    options: &MetaOptions,
) -> Result<CombinedEffect, MetaError> {
    validate_inputs(effects, variances)?;

    let degrees_of_freedom = (effects.len() - 1) as f64;
    let mut tau2 = 0.0;
    let mut outcome = None;

    for iteration in 1..=options.max_iterations {
        let summary = weighted_summary(effects, variances, tau2);
        let estimating_equation = summary.q - degrees_of_freedom;

        if estimating_equation < 0.0 {
            outcome = Some(TauSquared::ClampedToZero {
                iterations: iteration,
            });
            break;
        }
        if estimating_equation.abs() < options.tolerance {
            outcome = Some(TauSquared::Converged {
                tau2,
                iterations: iteration,
            });
            break;
        }
        tau2 += estimating_equation / summary.sum_squared_weighted_residuals;
    }

    let tau_squared = outcome.unwrap_or(TauSquared::IterationLimit { tau2 });
    if let TauSquared::IterationLimit { tau2 } = tau_squared {
        log::trace!(
            "tau^2 did not converge within {} iterations (last iterate {:.6e})",
            options.max_iterations,
            tau2
        );
    }

    let summary = weighted_summary(effects, variances, tau_squared.value());
    Ok(CombinedEffect {
        effect: summary.mean,
        standard_error: (1.0 / summary.sum_weights).sqrt(),
        tau_squared,
        q_statistic: summary.q,
        studies: effects.len(),
    })
}
