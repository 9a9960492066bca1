//! Random-effects meta-analysis of per-study effect-size maps.
//!
//! `combiner` fuses the estimates of a single region pair; `aggregate` runs it
//! over every pair of a cohort and assembles the connectome summary statistic.

pub mod aggregate;
pub mod combiner;

pub use aggregate::{CssAggregate, StudyMaps, aggregate_studies};
pub use combiner::{CombinedEffect, MetaError, MetaOptions, TauSquared, combine_paule_mandel};
