//! Reading and writing region-labeled matrix files.
//!
//! A disease map is a comma-separated table. Lines starting with `#` are
//! comments. The first remaining line is a header whose cells after the first
//! name the regions; every following line starts with a row label and carries
//! one value per region. `nan` (any case) marks a missing estimate. Only the
//! strict upper triangle of a map is trusted: it is mirrored onto the lower
//! triangle and the diagonal is set to zero.

use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use ndarray::{Array2, ArrayView2, s};
use std::fs;
use std::path::Path;

use super::CatalogError;
use crate::shared::matrix::upper_triangle_pairs;

/// A square matrix with the name of each region along both axes.
#[derive(Debug, Clone)]
pub struct LabeledMap {
    pub regions: Vec<String>,
    pub matrix: Array2<f64>,
}

impl LabeledMap {
    /// Drops the first `count` regions, e.g. the subcortical block of `aparc+aseg`.
    pub fn drop_leading_regions(self, count: usize) -> Result<Self, CatalogError> {
        if count == 0 {
            return Ok(self);
        }
        if count >= self.regions.len() {
            return Err(CatalogError::MalformedMap {
                origin: "atlas slicing".to_string(),
                reason: format!(
                    "cannot drop {count} leading regions from a map with {} regions",
                    self.regions.len()
                ),
            });
        }
        Ok(Self {
            regions: self.regions[count..].to_vec(),
            matrix: self.matrix.slice(s![count.., count..]).to_owned(),
        })
    }
}

fn parse_value(text: &str, origin: &str, row: usize, col: usize) -> Result<f64, CatalogError> {
    if text.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    text.parse::<f64>().map_err(|_| CatalogError::InvalidValue {
        origin: origin.to_string(),
        row,
        col,
        value: text.to_string(),
    })
}

fn parse_row(
    record: &StringRecord,
    skip: usize,
    expected: usize,
    origin: &str,
    row: usize,
) -> Result<Vec<f64>, CatalogError> {
    let cells: Vec<&str> = record.iter().skip(skip).collect();
    if cells.len() != expected {
        return Err(CatalogError::MalformedMap {
            origin: origin.to_string(),
            reason: format!("row {row} has {} values, expected {expected}", cells.len()),
        });
    }
    cells
        .into_iter()
        .enumerate()
        .map(|(col, cell)| parse_value(cell, origin, row, col))
        .collect()
}

/// Parses a labeled map, keeping its upper triangle and mirroring it.
pub fn parse_map(text: &str, origin: &str) -> Result<LabeledMap, CatalogError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let regions: Vec<String> = reader.headers()?.iter().skip(1).map(str::to_string).collect();
    let n = regions.len();
    if n == 0 {
        return Err(CatalogError::MalformedMap {
            origin: origin.to_string(),
            reason: "the header names no regions".to_string(),
        });
    }

    let mut raw = Vec::with_capacity(n * n);
    let mut rows = 0;
    for record in reader.records() {
        raw.extend(parse_row(&record?, 1, n, origin, rows)?);
        rows += 1;
    }
    if rows != n {
        return Err(CatalogError::MalformedMap {
            origin: origin.to_string(),
            reason: format!("{n} regions in the header but {rows} data rows"),
        });
    }

    let mut matrix = Array2::zeros((n, n));
    for (i, j) in upper_triangle_pairs(n) {
        let value = raw[i * n + j];
        matrix[[i, j]] = value;
        matrix[[j, i]] = value;
    }
    Ok(LabeledMap { regions, matrix })
}

pub fn read_map(path: &Path) -> Result<LabeledMap, CatalogError> {
    let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_map(&text, &path.display().to_string())
}

/// Reads a plain square matrix with no labels, e.g. one subject's connectivity.
///
/// The matrix is returned as written; symmetry is checked by whoever consumes it.
pub fn load_matrix_csv(path: &Path) -> Result<Array2<f64>, CatalogError> {
    let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let origin = path.display().to_string();
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let mut values = Vec::new();
    let mut n = None;
    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        let expected = *n.get_or_insert(record.len());
        values.extend(parse_row(&record, 0, expected, &origin, rows)?);
        rows += 1;
    }
    let n = n.unwrap_or(0);
    if rows != n || n == 0 {
        return Err(CatalogError::MalformedMap {
            origin,
            reason: format!("expected a square matrix, found {rows} rows of {n} values"),
        });
    }
    Array2::from_shape_vec((n, n), values).map_err(|e| CatalogError::MalformedMap {
        origin,
        reason: e.to_string(),
    })
}

/// Writes a matrix in the labeled map format read by [`read_map`].
pub fn write_map(path: &Path, regions: &[String], matrix: ArrayView2<f64>) -> Result<(), CatalogError> {
    if matrix.dim() != (regions.len(), regions.len()) {
        return Err(CatalogError::MalformedMap {
            origin: path.display().to_string(),
            reason: format!(
                "{} region labels for a {:?} matrix",
                regions.len(),
                matrix.dim()
            ),
        });
    }

    let mut writer = WriterBuilder::new().from_path(path)?;
    writer.write_record(std::iter::once("region").chain(regions.iter().map(String::as_str)))?;

    let mut buffer = ryu::Buffer::new();
    for (region, row) in regions.iter().zip(matrix.rows()) {
        let mut record = Vec::with_capacity(regions.len() + 1);
        record.push(region.clone());
        for &value in row {
            record.push(if value.is_nan() {
                "nan".to_string()
            } else {
                buffer.format(value).to_string()
            });
        }
        writer.write_record(&record)?;
    }
    writer.flush().map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
