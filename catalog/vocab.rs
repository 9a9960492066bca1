//! Identifiers accepted by the disease-map catalog.
//!
//! The scoring core never inspects these names; they only select which maps
//! the catalog reads from disk.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disease {
    Addiction,
    Adhd,
    Alzheimer,
    Anxiety,
    Autism,
    Bipolar,
    DementiaOther,
    Depression,
    Ftd,
    Insomnia,
    Mci,
    Ocd,
    Pain,
    Parkinson,
    Schizophrenia,
}

impl Disease {
    pub const ALL: [Disease; 15] = [
        Disease::Addiction,
        Disease::Adhd,
        Disease::Alzheimer,
        Disease::Anxiety,
        Disease::Autism,
        Disease::Bipolar,
        Disease::DementiaOther,
        Disease::Depression,
        Disease::Ftd,
        Disease::Insomnia,
        Disease::Mci,
        Disease::Ocd,
        Disease::Pain,
        Disease::Parkinson,
        Disease::Schizophrenia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Disease::Addiction => "addiction",
            Disease::Adhd => "adhd",
            Disease::Alzheimer => "alzheimer",
            Disease::Anxiety => "anxiety",
            Disease::Autism => "autism",
            Disease::Bipolar => "bipolar",
            Disease::DementiaOther => "dementia_other",
            Disease::Depression => "depression",
            Disease::Ftd => "ftd",
            Disease::Insomnia => "insomnia",
            Disease::Mci => "mci",
            Disease::Ocd => "ocd",
            Disease::Pain => "pain",
            Disease::Parkinson => "parkinson",
            Disease::Schizophrenia => "schizophrenia",
        }
    }
}

impl FromStr for Disease {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Disease::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| CatalogError::UnknownDisease(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modality {
    FunctionalConnectivity,
    StructuralConnectivity,
    Morphology,
}

impl Modality {
    pub const ALL: [Modality; 3] = [
        Modality::FunctionalConnectivity,
        Modality::StructuralConnectivity,
        Modality::Morphology,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::FunctionalConnectivity => "functional-connectivity",
            Modality::StructuralConnectivity => "structural-connectivity",
            Modality::Morphology => "morphology",
        }
    }

    /// Metrics for which disease maps exist under this modality.
    pub fn metrics(&self) -> &'static [&'static str] {
        match self {
            Modality::FunctionalConnectivity => &["gmean_scrubbed_0.01-0.1", "scrubbed_0.01-0.1"],
            Modality::StructuralConnectivity => &["mean_fa"],
            Modality::Morphology => &["thickness", "volume", "surface_area"],
        }
    }
}

impl FromStr for Modality {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Modality::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| CatalogError::UnknownModality(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Atlas {
    #[serde(rename = "aparc+aseg")]
    AparcAseg,
    #[serde(rename = "aparc")]
    Aparc,
}

impl Atlas {
    /// Number of subcortical regions that lead `aparc+aseg` and are absent from `aparc`.
    pub const SUBCORTICAL_REGIONS: usize = 14;

    pub fn as_str(&self) -> &'static str {
        match self {
            Atlas::AparcAseg => "aparc+aseg",
            Atlas::Aparc => "aparc",
        }
    }

    /// The atlas whose maps are stored on disk, and how many leading regions to
    /// drop from them.
    pub fn storage(&self) -> (Atlas, usize) {
        match self {
            Atlas::AparcAseg => (Atlas::AparcAseg, 0),
            Atlas::Aparc => (Atlas::AparcAseg, Self::SUBCORTICAL_REGIONS),
        }
    }
}

impl FromStr for Atlas {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Atlas::AparcAseg, Atlas::Aparc]
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| CatalogError::UnknownAtlas(s.to_string()))
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(Disease, Modality, Atlas);

/// A fully validated selection of one family of disease maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapKey {
    pub disease: Disease,
    pub modality: Modality,
    pub metric: String,
    pub atlas: Atlas,
}

impl MapKey {
    pub fn new(
        disease: Disease,
        modality: Modality,
        metric: &str,
        atlas: Atlas,
    ) -> Result<Self, CatalogError> {
        if !modality.metrics().iter().any(|m| *m == metric) {
            return Err(CatalogError::UnknownMetric {
                metric: metric.to_string(),
                available: modality.metrics().to_vec(),
            });
        }
        Ok(Self {
            disease,
            modality,
            metric: metric.to_string(),
            atlas,
        })
    }

    /// Validates all four identifiers from their textual form.
    pub fn parse(
        disease: &str,
        modality: &str,
        metric: &str,
        atlas: &str,
    ) -> Result<Self, CatalogError> {
        Self::new(disease.parse()?, modality.parse()?, metric, atlas.parse()?)
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.disease, self.modality, self.atlas, self.metric)
    }
}
