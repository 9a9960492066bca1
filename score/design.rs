//! # Regression Design Construction
//!
//! Turns a per-subject demographics table into the design matrix used to fit a
//! connectome summary statistic. Column order is fixed and the fitted effect is
//! always read from column 0:
//!
//! 1. the variable of interest, recoded to `{0, 1}` with the baseline at 0;
//! 2. continuous confounders, as-is;
//! 3. categorical confounders, one-hot encoded over their sorted categories
//!    with the first category dropped;
//! 4. an intercept column of ones.
//!
//! All values are read through their string form for the grouping columns, so
//! numeric group codes work as long as the baseline is spelled the way Polars
//! prints them (e.g. `0` for integers, `0.0` for floats).

use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error(
        "The column '{0}' was not found in the demographics table. Please check spelling and case."
    )]
    ColumnNotFound(String),

    #[error(
        "The variable of interest '{column}' must have exactly two distinct values, but has {}: {values:?}.",
        .values.len()
    )]
    NotBinary { column: String, values: Vec<String> },

    #[error(
        "The baseline condition '{baseline}' is not one of the values of '{column}': {values:?}."
    )]
    BaselineNotFound {
        column: String,
        baseline: String,
        values: Vec<String>,
    },

    #[error(
        "Missing or null values were found in the column '{0}'. Complete demographics are required."
    )]
    MissingValuesFound(String),

    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },

    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValuesFound(String),

    #[error(
        "The connectivity stack holds {subjects} subjects, but the demographics table has {rows} rows."
    )]
    SubjectCountMismatch { subjects: usize, rows: usize },

    #[error(
        "The design has {columns} columns but only {subjects} subjects; more subjects than columns are required."
    )]
    InsufficientSubjects { subjects: usize, columns: usize },
}

/// A design matrix together with a readable name for each of its columns.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    /// Shape: `[n_subjects, n_columns]`.
    pub matrix: Array2<f64>,
    pub column_names: Vec<String>,
}

/// The column names and coding choices of a regression fit.
#[derive(Debug, Clone, Copy)]
pub struct DesignSpec<'a> {
    pub variable_of_interest: &'a str,
    pub baseline_condition: &'a str,
    pub continuous_confounders: &'a [&'a str],
    pub categorical_confounders: &'a [&'a str],
}

impl DesignSpec<'_> {
    fn required_columns(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.variable_of_interest)
            .chain(self.continuous_confounders.iter().copied())
            .chain(self.categorical_confounders.iter().copied())
    }
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DesignError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DesignError::MissingValuesFound(column_name.to_string()));
    }

    let casted = match series.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(DesignError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
    };

    if casted.null_count() > 0 {
        return Err(DesignError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DesignError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn extract_label_column(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DesignError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DesignError::MissingValuesFound(column_name.to_string()));
    }
    let casted = series.cast(&DataType::String)?;
    casted
        .str()?
        .into_iter()
        .map(|value| {
            value
                .map(str::to_string)
                .ok_or_else(|| DesignError::MissingValuesFound(column_name.to_string()))
        })
        .collect()
}

/// Recodes the variable of interest: baseline to 0, the other value to 1.
fn encode_variable_of_interest(
    df: &DataFrame,
    spec: &DesignSpec<'_>,
) -> Result<Array1<f64>, DesignError> {
    let labels = extract_label_column(df, spec.variable_of_interest)?;
    let distinct: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
    let values: Vec<String> = distinct.iter().map(|v| v.to_string()).collect();

    if distinct.len() != 2 {
        return Err(DesignError::NotBinary {
            column: spec.variable_of_interest.to_string(),
            values,
        });
    }
    if !distinct.contains(spec.baseline_condition) {
        return Err(DesignError::BaselineNotFound {
            column: spec.variable_of_interest.to_string(),
            baseline: spec.baseline_condition.to_string(),
            values,
        });
    }

    Ok(labels
        .iter()
        .map(|label| if label == spec.baseline_condition { 0.0 } else { 1.0 })
        .collect())
}

/// One-hot encodes a categorical column, dropping the first sorted category.
fn encode_categorical(
    df: &DataFrame,
    column_name: &str,
) -> Result<Vec<(String, Array1<f64>)>, DesignError> {
    let labels = extract_label_column(df, column_name)?;
    let categories: BTreeSet<&str> = labels.iter().map(String::as_str).collect();

    Ok(categories
        .into_iter()
        .skip(1)
        .map(|category| {
            let indicator = labels
                .iter()
                .map(|label| if label == category { 1.0 } else { 0.0 })
                .collect();
            (format!("{column_name}[{category}]"), indicator)
        })
        .collect())
}

/// Builds the regression design matrix from a demographics table.
pub fn build_design_matrix(
    demographics: &DataFrame,
    spec: &DesignSpec<'_>,
) -> Result<DesignMatrix, DesignError> {
    let available: HashSet<String> = demographics
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    for name in spec.required_columns() {
        if !available.contains(name) {
            return Err(DesignError::ColumnNotFound(name.to_string()));
        }
    }

    let mut columns: Vec<(String, Array1<f64>)> = Vec::new();
    columns.push((
        spec.variable_of_interest.to_string(),
        encode_variable_of_interest(demographics, spec)?,
    ));
    for &name in spec.continuous_confounders {
        columns.push((
            name.to_string(),
            Array1::from_vec(extract_numeric_column(demographics, name)?),
        ));
    }
    for &name in spec.categorical_confounders {
        columns.extend(encode_categorical(demographics, name)?);
    }
    let n_subjects = demographics.height();
    columns.push(("intercept".to_string(), Array1::ones(n_subjects)));

    if n_subjects <= columns.len() {
        return Err(DesignError::InsufficientSubjects {
            subjects: n_subjects,
            columns: columns.len(),
        });
    }

    let mut matrix = Array2::zeros((n_subjects, columns.len()));
    let mut column_names = Vec::with_capacity(columns.len());
    for (j, (name, values)) in columns.into_iter().enumerate() {
        matrix.column_mut(j).assign(&values);
        column_names.push(name);
    }

    log::debug!("Design matrix columns: {column_names:?}");
    Ok(DesignMatrix {
        matrix,
        column_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn demographics() -> DataFrame {
        df!(
            "dx" => ["control", "sz", "sz", "control", "sz", "control", "control"],
            "age" => [20.0, 31.5, 44.0, 52.0, 28.0, 39.0, 61.0],
            "site" => ["b", "a", "c", "a", "b", "c", "a"],
            "group" => [0i64, 1, 1, 0, 1, 0, 0]
        )
        .unwrap()
    }

    #[test]
    fn test_design_column_order_and_encoding() {
        let spec = DesignSpec {
            variable_of_interest: "dx",
            baseline_condition: "control",
            continuous_confounders: &["age"],
            categorical_confounders: &["site"],
        };
        let design = build_design_matrix(&demographics(), &spec).unwrap();

        assert_eq!(
            design.column_names,
            vec!["dx", "age", "site[b]", "site[c]", "intercept"]
        );
        assert_eq!(design.matrix.column(0), array![0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
        assert_eq!(design.matrix.column(1), array![20.0, 31.5, 44.0, 52.0, 28.0, 39.0, 61.0]);
        assert_eq!(design.matrix.column(2), array![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        assert_eq!(design.matrix.column(3), array![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
        assert!(design.matrix.column(4).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_numeric_group_codes_are_accepted() {
        let spec = DesignSpec {
            variable_of_interest: "group",
            baseline_condition: "1",
            continuous_confounders: &[],
            categorical_confounders: &[],
        };
        let design = build_design_matrix(&demographics(), &spec).unwrap();
        assert_eq!(design.matrix.column(0), array![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0]);
        assert_eq!(design.matrix.ncols(), 2);
    }

    #[test]
    fn test_precondition_violations() {
        let df = demographics();
        let base = DesignSpec {
            variable_of_interest: "dx",
            baseline_condition: "control",
            continuous_confounders: &[],
            categorical_confounders: &[],
        };

        let spec = DesignSpec {
            variable_of_interest: "site",
            ..base
        };
        match build_design_matrix(&df, &spec).unwrap_err() {
            DesignError::NotBinary { column, values } => {
                assert_eq!(column, "site");
                assert_eq!(values, vec!["a", "b", "c"]);
            }
            other => panic!("Expected NotBinary, got {:?}", other),
        }

        let spec = DesignSpec {
            baseline_condition: "healthy",
            ..base
        };
        assert!(matches!(
            build_design_matrix(&df, &spec),
            Err(DesignError::BaselineNotFound { .. })
        ));

        let spec = DesignSpec {
            continuous_confounders: &["height"],
            ..base
        };
        match build_design_matrix(&df, &spec).unwrap_err() {
            DesignError::ColumnNotFound(name) => assert_eq!(name, "height"),
            other => panic!("Expected ColumnNotFound, got {:?}", other),
        }

        let spec = DesignSpec {
            continuous_confounders: &["site"],
            ..base
        };
        assert!(matches!(
            build_design_matrix(&df, &spec),
            Err(DesignError::ColumnWrongType { .. })
        ));
    }

    #[test]
    fn test_too_few_subjects_for_the_design() {
        let df = df!("dx" => ["a", "b"], "age" => [1.0, 2.0]).unwrap();
        let spec = DesignSpec {
            variable_of_interest: "dx",
            baseline_condition: "a",
            continuous_confounders: &["age"],
            categorical_confounders: &[],
        };
        assert!(matches!(
            build_design_matrix(&df, &spec),
            Err(DesignError::InsufficientSubjects {
                subjects: 2,
                columns: 3
            })
        ));
    }
}
