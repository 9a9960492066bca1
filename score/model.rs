//! # PolyConnectomic Score Model
//!
//! A [`PcsModel`] holds at most one connectome summary statistic (CSS) and
//! scores subject connectivity matrices against it. The CSS either comes from a
//! disease map (precomputed or aggregated by the catalog), is handed in by the
//! caller, or is fitted here by regressing every region pair of a cohort's
//! connectivity on a case/control indicator plus confounders.
//!
//! The score of a subject is the mean product of the vectorized CSS and the
//! vectorized subject matrix. Stack scoring and single-matrix scoring share the
//! same sequential reduction, so scores agree bit for bit.

use ndarray::{Array1, ArrayView1, ArrayView2, ArrayView3, Axis, Zip};
use ndarray_linalg::LeastSquaresSvd;
use ndarray_linalg::error::LinalgError;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use crate::catalog::{CssSource, MapKey};
use crate::design::{DesignError, DesignSpec, build_design_matrix};
use crate::shared::matrix::{CssMatrix, MatrixError, vectorize, vectorize_stack};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("The model holds no connectome summary statistic. Fit it or load a disease map first.")]
    NotFitted,

    #[error(
        "Connectivity data of shape {connectivity:?} does not match the summary statistic of shape {css:?}."
    )]
    ShapeMismatch {
        css: (usize, usize),
        connectivity: Vec<usize>,
    },

    #[error("The summary statistic covers a single region and has no region pairs to score.")]
    NoRegionPairs,

    #[error("Invalid regression parameter: {0}")]
    InvalidParameter(#[from] DesignError),

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error("The least-squares solve failed: {0}")]
    LeastSquares(#[from] LinalgError),

    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// How the summary statistic held by a model was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    Unfitted,
    DiseaseMap {
        key: MapKey,
        source: CssSource,
    },
    Regression {
        variable_of_interest: String,
        baseline_condition: String,
        /// Design columns in order; the summary statistic is column 0's coefficient.
        design_columns: Vec<String>,
        subjects: usize,
    },
    /// Supplied directly by the caller.
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcsModel {
    /// Stored in vector form; re-validated on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    css: Option<CssMatrix>,
    provenance: Provenance,
}

impl Default for PcsModel {
    fn default() -> Self {
        Self::unfitted()
    }
}

/// Sum of elementwise products divided by the vector length, accumulated in order.
fn mean_product(css: ArrayView1<f64>, subject: ArrayView1<f64>) -> f64 {
    let sum = Zip::from(css)
        .and(subject)
        .fold(0.0, |acc, &c, &s| acc + c * s);
    sum / css.len() as f64
}

impl PcsModel {
    pub fn unfitted() -> Self {
        Self {
            css: None,
            provenance: Provenance::Unfitted,
        }
    }

    pub fn with_css(provenance: Provenance, css: CssMatrix) -> Self {
        Self {
            css: Some(css),
            provenance,
        }
    }

    pub fn from_css(css: CssMatrix) -> Self {
        Self::with_css(Provenance::External, css)
    }

    pub fn from_disease_map(key: MapKey, source: CssSource, css: CssMatrix) -> Self {
        Self::with_css(Provenance::DiseaseMap { key, source }, css)
    }

    pub fn css(&self) -> Option<&CssMatrix> {
        self.css.as_ref()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn is_fitted(&self) -> bool {
        self.css.is_some()
    }

    fn fitted_vector(&self, connectivity_shape: &[usize]) -> Result<Array1<f64>, ModelError> {
        let css = self.css.as_ref().ok_or(ModelError::NotFitted)?;
        let (rows, cols) = css.shape();
        if connectivity_shape.len() < 2
            || connectivity_shape[0] != rows
            || connectivity_shape[1] != cols
        {
            return Err(ModelError::ShapeMismatch {
                css: css.shape(),
                connectivity: connectivity_shape.to_vec(),
            });
        }
        let vector = css.to_vector();
        if vector.is_empty() {
            return Err(ModelError::NoRegionPairs);
        }
        Ok(vector)
    }

    /// Scores one subject's `N x N` connectivity matrix.
    pub fn evaluate(&self, connectivity: ArrayView2<f64>) -> Result<f64, ModelError> {
        let css = self.fitted_vector(connectivity.shape())?;
        let subject = vectorize(connectivity)?;
        Ok(mean_product(css.view(), subject.view()))
    }

    /// Scores every subject of an `(N, N, subjects)` stack, in stack order.
    pub fn evaluate_stack(&self, connectivity: ArrayView3<f64>) -> Result<Array1<f64>, ModelError> {
        let css = self.fitted_vector(connectivity.shape())?;
        let subjects = vectorize_stack(connectivity)?;
        Ok(subjects
            .axis_iter(Axis(1))
            .map(|subject| mean_product(css.view(), subject))
            .collect())
    }

    /// Fits the summary statistic from a cohort by per-pair linear regression.
    ///
    /// `demographics` has one row per subject, in the order of the last axis of
    /// `connectivity`. Every region pair is regressed on the same design (see
    /// [`crate::design`]) and the coefficient of the variable of interest becomes
    /// that pair's entry. Any previously held statistic is replaced.
    pub fn fit(
        &mut self,
        demographics: &DataFrame,
        connectivity: ArrayView3<f64>,
        variable_of_interest: &str,
        baseline_condition: &str,
        continuous_confounders: &[&str],
        categorical_confounders: &[&str],
    ) -> Result<&mut Self, ModelError> {
        let subjects = connectivity.len_of(Axis(2));
        if subjects != demographics.height() {
            return Err(DesignError::SubjectCountMismatch {
                subjects,
                rows: demographics.height(),
            }
            .into());
        }

        let spec = DesignSpec {
            variable_of_interest,
            baseline_condition,
            continuous_confounders,
            categorical_confounders,
        };
        let design = build_design_matrix(demographics, &spec)?;

        // (subjects, pairs): one regression per column.
        let responses = vectorize_stack(connectivity)?
            .t()
            .as_standard_layout()
            .into_owned();
        log::info!(
            "Fitting {} region pairs over {} subjects with {} design columns.",
            responses.ncols(),
            subjects,
            design.column_names.len()
        );

        let result = design.matrix.least_squares(&responses)?;
        let columns = design.matrix.ncols();
        if (result.rank.max(0) as usize) < columns {
            log::warn!(
                "The design matrix is rank deficient (rank {} of {} columns); coefficients are the minimum-norm solution.",
                result.rank,
                columns
            );
        }

        let css = CssMatrix::from_vector(result.solution.row(0))?;
        log::debug!("Fitted summary statistic covers {} regions.", css.n_regions());

        self.css = Some(css);
        self.provenance = Provenance::Regression {
            variable_of_interest: variable_of_interest.to_string(),
            baseline_condition: baseline_condition.to_string(),
            design_columns: design.column_names,
            subjects,
        };
        Ok(self)
    }

    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array3, array, s};
    use polars::prelude::*;
    use tempfile::NamedTempFile;

    fn literal_css() -> CssMatrix {
        CssMatrix::new(array![[0.0, 1.0, 2.0], [1.0, 0.0, 3.0], [2.0, 3.0, 0.0]]).unwrap()
    }

    #[test]
    fn test_evaluate_is_the_mean_product() {
        let model = PcsModel::from_css(literal_css());
        let subject = array![[0.0, 1.0, 1.0], [1.0, 0.0, 1.0], [1.0, 1.0, 0.0]];
        assert_eq!(model.evaluate(subject.view()).unwrap(), 2.0);

        let subject = array![[0.0, 0.5, -1.0], [0.5, 0.0, 2.0], [-1.0, 2.0, 0.0]];
        assert_abs_diff_eq!(
            model.evaluate(subject.view()).unwrap(),
            (0.5 - 2.0 + 6.0) / 3.0,
            epsilon = 1e-15
        );
    }

    #[test]
    fn test_unfitted_and_mismatched_inputs() {
        let subject = Array2::<f64>::zeros((3, 3));
        assert!(matches!(
            PcsModel::unfitted().evaluate(subject.view()),
            Err(ModelError::NotFitted)
        ));

        let model = PcsModel::from_css(literal_css());
        match model.evaluate(Array2::<f64>::zeros((4, 4)).view()).unwrap_err() {
            ModelError::ShapeMismatch { css, connectivity } => {
                assert_eq!(css, (3, 3));
                assert_eq!(connectivity, vec![4, 4]);
            }
            other => panic!("Expected ShapeMismatch, got {:?}", other),
        }
        assert!(matches!(
            model.evaluate_stack(Array3::<f64>::zeros((3, 4, 2)).view()),
            Err(ModelError::ShapeMismatch { .. })
        ));

        let asymmetric = array![[0.0, 1.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
        assert!(matches!(
            model.evaluate(asymmetric.view()),
            Err(ModelError::Matrix(MatrixError::SymmetryViolation { .. }))
        ));
    }

    #[test]
    fn test_stack_scores_equal_single_scores() {
        let model = PcsModel::from_css(literal_css());
        let mut stack = Array3::zeros((3, 3, 4));
        for k in 0..4 {
            let x = 0.1 * (k as f64 + 1.0);
            let m = array![[0.0, x, -x * x], [x, 0.0, 1.0 / 3.0 + x], [-x * x, 1.0 / 3.0 + x, 0.0]];
            stack.slice_mut(s![.., .., k]).assign(&m);
        }
        let scores = model.evaluate_stack(stack.view()).unwrap();
        assert_eq!(scores.len(), 4);
        for k in 0..4 {
            let single = model.evaluate(stack.slice(s![.., .., k])).unwrap();
            assert_eq!(scores[k].to_bits(), single.to_bits());
        }
    }

    /// Noise-free cohort where pair (i, j) = effect * dx + 0.1 * age + offset.
    fn exact_cohort() -> (DataFrame, Array3<f64>, CssMatrix) {
        let truth = literal_css();
        let dx = ["hc", "sz", "hc", "sz", "sz", "hc", "hc", "sz", "hc", "sz"];
        let age = [23.0, 35.0, 41.0, 29.0, 52.0, 60.0, 33.0, 47.0, 38.0, 26.0];
        let df = df!("dx" => dx, "age" => age).unwrap();

        let mut stack = Array3::zeros((3, 3, dx.len()));
        for (k, (&group, &years)) in dx.iter().zip(age.iter()).enumerate() {
            let indicator = if group == "sz" { 1.0 } else { 0.0 };
            let mut m = truth.view().mapv(|e| e * indicator);
            m += &Array2::from_elem((3, 3), 0.1 * years + 2.0);
            m.diag_mut().fill(0.0);
            stack.slice_mut(s![.., .., k]).assign(&m);
        }
        (df, stack, truth)
    }

    #[test]
    fn test_fit_recovers_noise_free_effects() {
        let (df, stack, truth) = exact_cohort();
        let mut model = PcsModel::unfitted();
        model.fit(&df, stack.view(), "dx", "hc", &["age"], &[]).unwrap();

        let fitted = model.css().unwrap();
        for (a, b) in fitted.view().iter().zip(truth.view().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
        }
        match model.provenance() {
            Provenance::Regression {
                design_columns,
                subjects,
                ..
            } => {
                assert_eq!(design_columns, &vec!["dx", "age", "intercept"]);
                assert_eq!(*subjects, 10);
            }
            other => panic!("Expected Regression provenance, got {:?}", other),
        }
    }

    #[test]
    fn test_fit_rejects_bad_parameters() {
        let (df, stack, _) = exact_cohort();
        let mut model = PcsModel::unfitted();
        assert!(matches!(
            model.fit(&df, stack.slice(s![.., .., ..9]), "dx", "hc", &[], &[]),
            Err(ModelError::InvalidParameter(DesignError::SubjectCountMismatch {
                subjects: 9,
                rows: 10
            }))
        ));
        assert!(matches!(
            model.fit(&df, stack.view(), "dx", "control", &[], &[]),
            Err(ModelError::InvalidParameter(DesignError::BaselineNotFound { .. }))
        ));
        assert!(!model.is_fitted());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let key = MapKey::parse("adhd", "morphology", "volume", "aparc").unwrap();
        let model = PcsModel::from_disease_map(key, CssSource::AllStudies, literal_css());
        let file = NamedTempFile::new().unwrap();
        model.save(file.path()).unwrap();

        let loaded = PcsModel::load(file.path()).unwrap();
        assert_eq!(loaded.css(), model.css());
        assert_eq!(loaded.provenance(), model.provenance());

        let unfitted = NamedTempFile::new().unwrap();
        PcsModel::unfitted().save(unfitted.path()).unwrap();
        assert!(!PcsModel::load(unfitted.path()).unwrap().is_fitted());
    }

    #[test]
    fn test_load_rejects_non_triangular_css() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "css = [1.0, 2.0]\n\n[provenance]\nkind = \"external\"\n").unwrap();
        assert!(matches!(
            PcsModel::load(file.path()),
            Err(ModelError::TomlParseError(_))
        ));
    }
}
