//! # Disease-Map Catalog
//!
//! Resolves a [`MapKey`] to files on disk. Maps are stored under
//!
//! ```text
//! <root>/<disease>/<modality>/<atlas>/<metric>/mega_analysis/cohen_d.csv
//! <root>/<disease>/<modality>/<atlas>/<metric>/studies/<STUDY>/cohen_d.csv
//! <root>/<disease>/<modality>/<atlas>/<metric>/studies/<STUDY>/variance.csv
//! ```
//!
//! Only `aparc+aseg` maps are stored. `aparc` maps are derived by dropping the
//! leading subcortical regions, before aggregation when studies are combined.

pub mod io;
pub mod vocab;

pub use io::{LabeledMap, load_matrix_csv, read_map, write_map};
pub use vocab::{Atlas, Disease, MapKey, Modality};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::meta::{CssAggregate, MetaError, MetaOptions, StudyMaps, aggregate_studies};
use crate::model::PcsModel;
use crate::shared::matrix::{CssMatrix, MatrixError};

pub const MEGA_ANALYSIS_DIR: &str = "mega_analysis";
pub const STUDIES_DIR: &str = "studies";
pub const EFFECT_SIZE_FILE: &str = "cohen_d.csv";
pub const VARIANCE_FILE: &str = "variance.csv";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Unrecognized diagnosis {0} - no disease map available for this diagnosis.")]
    UnknownDisease(String),

    #[error("Unrecognized modality {0}.")]
    UnknownModality(String),

    #[error("Unrecognized metric {metric} (available metrics: {available:?}).")]
    UnknownMetric {
        metric: String,
        available: Vec<&'static str>,
    },

    #[error("Unrecognized atlas {0}.")]
    UnknownAtlas(String),

    #[error("No disease map data found at '{}'.", .0.display())]
    DataNotFound(PathBuf),

    #[error("Study '{study}' is not available for this map (available studies: {available:?}).")]
    UnknownStudy {
        study: String,
        available: Vec<String>,
    },

    #[error("No studies were found under '{}'.", .0.display())]
    NoStudies(PathBuf),

    #[error("Failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Malformed matrix in {origin}: {reason}.")]
    MalformedMap { origin: String, reason: String },

    #[error("Invalid value '{value}' in {origin} at data row {row}, column {col}.")]
    InvalidValue {
        origin: String,
        row: usize,
        col: usize,
        value: String,
    },

    #[error(
        "The maps of study '{study}' do not list the same regions, in the same order, as the rest of the cohort."
    )]
    RegionMismatch { study: String },

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Meta(#[from] MetaError),
}

/// Where a disease map's summary statistic comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CssSource {
    /// The precomputed mega-analysis map.
    #[default]
    MegaAnalysis,
    /// Aggregate every study stored for the map.
    AllStudies,
    /// Aggregate the named studies only.
    Studies(Vec<String>),
}

impl FromStr for CssSource {
    type Err = std::convert::Infallible;

    /// `mega_analysis`, `all_studies`, or a comma-separated list of study names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "mega_analysis" => CssSource::MegaAnalysis,
            "all_studies" => CssSource::AllStudies,
            other => CssSource::Studies(
                other
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        })
    }
}

impl fmt::Display for CssSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CssSource::MegaAnalysis => f.write_str("mega_analysis"),
            CssSource::AllStudies => f.write_str("all_studies"),
            CssSource::Studies(names) => f.write_str(&names.join(",")),
        }
    }
}

/// A summary statistic with the region names along its axes.
#[derive(Debug, Clone)]
pub struct LabeledCss {
    pub regions: Vec<String>,
    pub css: CssMatrix,
}

/// The result of aggregating stored studies.
#[derive(Debug, Clone)]
pub struct ComputedCss {
    pub regions: Vec<String>,
    pub aggregate: CssAggregate,
}

impl From<ComputedCss> for LabeledCss {
    fn from(computed: ComputedCss) -> Self {
        Self {
            regions: computed.regions,
            css: computed.aggregate.css,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiseaseMapCatalog {
    root: PathBuf,
    options: MetaOptions,
}

impl DiseaseMapCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            options: MetaOptions::default(),
        }
    }

    /// Replaces the combiner settings used by [`Self::compute_css`].
    pub fn with_options(mut self, options: MetaOptions) -> Self {
        self.options = options;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a map family as stored on disk.
    pub fn map_dir(&self, key: &MapKey) -> PathBuf {
        let (storage, _) = key.atlas.storage();
        self.root
            .join(key.disease.as_str())
            .join(key.modality.as_str())
            .join(storage.as_str())
            .join(&key.metric)
    }

    /// Names of the studies stored for `key`, in natural sort order.
    pub fn list_studies(&self, key: &MapKey) -> Result<Vec<String>, CatalogError> {
        let dir = self.map_dir(key).join(STUDIES_DIR);
        if !dir.is_dir() {
            return Err(CatalogError::DataNotFound(dir));
        }
        let io_error = |source: std::io::Error| CatalogError::Io {
            path: dir.clone(),
            source,
        };

        let mut studies = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            if entry.file_type().map_err(io_error)?.is_dir() {
                studies.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        studies.sort_by(|a, b| natord::compare(a, b));
        Ok(studies)
    }

    /// Loads the precomputed mega-analysis map for `key`.
    pub fn load_css(&self, key: &MapKey) -> Result<LabeledCss, CatalogError> {
        let dir = self.map_dir(key).join(MEGA_ANALYSIS_DIR);
        if !dir.is_dir() {
            return Err(CatalogError::DataNotFound(dir));
        }
        let (_, offset) = key.atlas.storage();
        let map = read_map(&dir.join(EFFECT_SIZE_FILE))?.drop_leading_regions(offset)?;
        log::info!(
            "Loaded the mega-analysis map for {key} ({} regions).",
            map.regions.len()
        );
        Ok(LabeledCss {
            regions: map.regions,
            css: CssMatrix::new(map.matrix)?,
        })
    }

    /// Aggregates the named studies of `key` into a fresh summary statistic.
    pub fn compute_css(&self, key: &MapKey, studies: &[String]) -> Result<ComputedCss, CatalogError> {
        let studies_dir = self.map_dir(key).join(STUDIES_DIR);
        let (_, offset) = key.atlas.storage();

        let mut regions: Option<Vec<String>> = None;
        let mut cohort = Vec::with_capacity(studies.len());
        for study in studies {
            let dir = studies_dir.join(study);
            if !dir.is_dir() {
                return Err(CatalogError::UnknownStudy {
                    study: study.clone(),
                    available: self.list_studies(key).unwrap_or_default(),
                });
            }
            let effect = read_map(&dir.join(EFFECT_SIZE_FILE))?.drop_leading_regions(offset)?;
            let variance = read_map(&dir.join(VARIANCE_FILE))?.drop_leading_regions(offset)?;

            if effect.regions != variance.regions {
                return Err(CatalogError::RegionMismatch {
                    study: study.clone(),
                });
            }
            match &regions {
                Some(expected) if *expected != effect.regions => {
                    return Err(CatalogError::RegionMismatch {
                        study: study.clone(),
                    });
                }
                Some(_) => {}
                None => regions = Some(effect.regions.clone()),
            }
            log::debug!("Loaded study {study} for {key}.");
            cohort.push(StudyMaps::new(study.as_str(), effect.matrix, variance.matrix));
        }

        let aggregate = aggregate_studies(&cohort, &self.options)?;
        Ok(ComputedCss {
            regions: regions.unwrap_or_default(),
            aggregate,
        })
    }

    /// Resolves `source` into the study names it stands for.
    pub fn studies_for(&self, key: &MapKey, source: &CssSource) -> Result<Vec<String>, CatalogError> {
        match source {
            CssSource::MegaAnalysis => Ok(Vec::new()),
            CssSource::AllStudies => {
                let studies = self.list_studies(key)?;
                if studies.is_empty() {
                    return Err(CatalogError::NoStudies(self.map_dir(key).join(STUDIES_DIR)));
                }
                Ok(studies)
            }
            CssSource::Studies(names) if names.is_empty() => {
                Err(CatalogError::NoStudies(self.map_dir(key).join(STUDIES_DIR)))
            }
            CssSource::Studies(names) => Ok(names.clone()),
        }
    }

    /// The single dispatch point between a precomputed map and fresh aggregation.
    pub fn resolve_css(&self, key: &MapKey, source: &CssSource) -> Result<LabeledCss, CatalogError> {
        match source {
            CssSource::MegaAnalysis => self.load_css(key),
            _ => {
                let studies = self.studies_for(key, source)?;
                Ok(self.compute_css(key, &studies)?.into())
            }
        }
    }

    /// Builds a scoring model from the disease map selected by `key` and `source`.
    pub fn model(&self, key: &MapKey, source: &CssSource) -> Result<PcsModel, CatalogError> {
        let labeled = self.resolve_css(key, source)?;
        Ok(PcsModel::from_disease_map(key.clone(), source.clone(), labeled.css))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use tempfile::TempDir;

    fn key(atlas: &str) -> MapKey {
        MapKey::parse("schizophrenia", "morphology", "thickness", atlas).unwrap()
    }

    fn write(path: &Path, regions: &[String], matrix: &Array2<f64>) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        write_map(path, regions, matrix.view()).unwrap();
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("r{i}")).collect()
    }

    /// A 16-region map whose entry (i, j) encodes both indices.
    fn indexed_map() -> Array2<f64> {
        Array2::from_shape_fn((16, 16), |(i, j)| {
            if i == j { 0.0 } else { (i.min(j) * 100 + i.max(j)) as f64 }
        })
    }

    #[test]
    fn test_css_source_parsing() {
        assert_eq!("mega_analysis".parse::<CssSource>().unwrap(), CssSource::MegaAnalysis);
        assert_eq!("all_studies".parse::<CssSource>().unwrap(), CssSource::AllStudies);
        assert_eq!(
            "UCLA, COBRE".parse::<CssSource>().unwrap(),
            CssSource::Studies(vec!["UCLA".into(), "COBRE".into()])
        );
    }

    #[test]
    fn test_load_css_slices_aparc_from_aparc_aseg() {
        let dir = TempDir::new().unwrap();
        let catalog = DiseaseMapCatalog::new(dir.path());
        let full = indexed_map();
        write(
            &catalog.map_dir(&key("aparc+aseg")).join(MEGA_ANALYSIS_DIR).join(EFFECT_SIZE_FILE),
            &names(16),
            &full,
        );

        let aseg = catalog.load_css(&key("aparc+aseg")).unwrap();
        assert_eq!(aseg.css.view(), full.view());

        let aparc = catalog.load_css(&key("aparc")).unwrap();
        assert_eq!(aparc.regions, vec!["r14", "r15"]);
        assert_eq!(aparc.css.view(), array![[0.0, 1415.0], [1415.0, 0.0]].view());
    }

    #[test]
    fn test_missing_data_is_reported() {
        let dir = TempDir::new().unwrap();
        let catalog = DiseaseMapCatalog::new(dir.path());
        assert!(matches!(
            catalog.load_css(&key("aparc")),
            Err(CatalogError::DataNotFound(_))
        ));
        assert!(matches!(
            catalog.list_studies(&key("aparc")),
            Err(CatalogError::DataNotFound(_))
        ));
    }

    #[test]
    fn test_studies_are_listed_in_natural_order_and_aggregated() {
        let dir = TempDir::new().unwrap();
        let catalog = DiseaseMapCatalog::new(dir.path());
        let studies_dir = catalog.map_dir(&key("aparc+aseg")).join(STUDIES_DIR);
        let regions = names(3);
        let effect = array![[0.0, 0.4, -0.2], [0.4, 0.0, 0.1], [-0.2, 0.1, 0.0]];
        let variance = array![[0.0, 0.05, 0.05], [0.05, 0.0, 0.05], [0.05, 0.05, 0.0]];
        for study in ["SITE10", "SITE2", "SITE1"] {
            write(&studies_dir.join(study).join(EFFECT_SIZE_FILE), &regions, &effect);
            write(&studies_dir.join(study).join(VARIANCE_FILE), &regions, &variance);
        }

        let listed = catalog.list_studies(&key("aparc+aseg")).unwrap();
        assert_eq!(listed, vec!["SITE1", "SITE2", "SITE10"]);

        // Identical studies combine to their shared map.
        let labeled = catalog.resolve_css(&key("aparc+aseg"), &CssSource::AllStudies).unwrap();
        assert_eq!(labeled.regions, regions);
        for (a, b) in labeled.css.view().iter().zip(effect.iter()) {
            approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }

        let unknown = CssSource::Studies(vec!["SITE3".into()]);
        match catalog.resolve_css(&key("aparc+aseg"), &unknown).unwrap_err() {
            CatalogError::UnknownStudy { study, available } => {
                assert_eq!(study, "SITE3");
                assert_eq!(available, listed);
            }
            other => panic!("Expected UnknownStudy, got {:?}", other),
        }
    }

    #[test]
    fn test_region_mismatch_between_studies() {
        let dir = TempDir::new().unwrap();
        let catalog = DiseaseMapCatalog::new(dir.path());
        let studies_dir = catalog.map_dir(&key("aparc+aseg")).join(STUDIES_DIR);
        let m = array![[0.0, 0.3], [0.3, 0.0]];
        write(&studies_dir.join("A").join(EFFECT_SIZE_FILE), &names(2), &m);
        write(&studies_dir.join("A").join(VARIANCE_FILE), &names(2), &m);
        let swapped = vec!["r1".to_string(), "r0".to_string()];
        write(&studies_dir.join("B").join(EFFECT_SIZE_FILE), &swapped, &m);
        write(&studies_dir.join("B").join(VARIANCE_FILE), &swapped, &m);

        match catalog.compute_css(&key("aparc+aseg"), &["A".into(), "B".into()]) {
            Err(CatalogError::RegionMismatch { study }) => assert_eq!(study, "B"),
            other => panic!("Expected RegionMismatch, got {:?}", other),
        }
    }
}
