//! # Dataset Splits and Ingestion
//!
//! This module is the exclusive entry point for user-provided data. The
//! selection algorithm works on three disjoint row-partitions of a design
//! matrix `X` and response vector `y`: a training block the lower-level
//! model fits against, a validation block the upper-level objective is
//! measured on, and a held-out test block for final reporting.
//!
//! - Immutability: a [`DatasetSplit`] is validated once at construction and
//!   never mutated afterwards; both optimization models borrow it read-only.
//! - User-centric errors: failures are assumed to be input mistakes, and the
//!   [`DataError`] enum is written to give actionable feedback.
//! - Ingestion: callers normally supply in-memory arrays, but a strict-schema
//!   TSV loader is provided for convenience (a `y` column plus one column per
//!   feature).

use ndarray::{Array1, Array2, s};
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for data construction and loading failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error from the underlying CSV reader: {0}")]
    Csv(#[from] csv::Error),

    #[error(
        "the required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),

    #[error("the input file has no feature columns besides 'y'")]
    NoFeatureColumns,

    #[error(
        "column '{column}' contains a non-numeric value at data row {row}. All columns must hold finite numbers."
    )]
    NonNumericField { column: String, row: usize },

    #[error("column '{column}' contains a non-finite value (NaN or infinity) at data row {row}")]
    NonFiniteValue { column: String, row: usize },

    #[error("non-finite values (NaN or infinity) were found in the {0} partition")]
    NonFinitePartition(&'static str),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("the {0} partition must contain at least one row")]
    EmptyPartition(&'static str),

    #[error(
        "row partition of {n_train} training + {n_val} validation rows exceeds the {rows} available rows"
    )]
    InvalidSplit {
        n_train: usize,
        n_val: usize,
        rows: usize,
    },
}

/// Immutable train/validation/test partitions of a regression dataset.
///
/// The test partition may be empty; the training and validation partitions
/// may not, since both levels of the bilevel program read them.
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub x_train: Array2<f64>,
    pub y_train: Array1<f64>,
    pub x_val: Array2<f64>,
    pub y_val: Array1<f64>,
    pub x_test: Array2<f64>,
    pub y_test: Array1<f64>,
}

impl DatasetSplit {
    /// Builds a split from pre-partitioned arrays, validating shapes and
    /// finiteness eagerly so the optimization models never see bad data.
    pub fn new(
        x_train: Array2<f64>,
        y_train: Array1<f64>,
        x_val: Array2<f64>,
        y_val: Array1<f64>,
        x_test: Array2<f64>,
        y_test: Array1<f64>,
    ) -> Result<Self, DataError> {
        let p = x_train.ncols();
        if x_val.ncols() != p || x_test.ncols() != p {
            return Err(DataError::DimensionMismatch(format!(
                "feature counts differ between partitions: train {}, validation {}, test {}",
                p,
                x_val.ncols(),
                x_test.ncols()
            )));
        }
        for (name, x, y) in [
            ("training", &x_train, &y_train),
            ("validation", &x_val, &y_val),
            ("test", &x_test, &y_test),
        ] {
            if x.nrows() != y.len() {
                return Err(DataError::DimensionMismatch(format!(
                    "the {} design matrix has {} rows but its response has {} entries",
                    name,
                    x.nrows(),
                    y.len()
                )));
            }
            if x.iter().any(|v| !v.is_finite()) || y.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFinitePartition(name));
            }
        }
        if x_train.nrows() == 0 {
            return Err(DataError::EmptyPartition("training"));
        }
        if x_val.nrows() == 0 {
            return Err(DataError::EmptyPartition("validation"));
        }
        Ok(Self {
            x_train,
            y_train,
            x_val,
            y_val,
            x_test,
            y_test,
        })
    }

    /// Partitions a single matrix by row ranges: the first `n_train` rows are
    /// the training block, the next `n_val` the validation block, and the
    /// remainder (possibly empty) the test block.
    pub fn from_rows(
        x: Array2<f64>,
        y: Array1<f64>,
        n_train: usize,
        n_val: usize,
    ) -> Result<Self, DataError> {
        if x.nrows() != y.len() {
            return Err(DataError::DimensionMismatch(format!(
                "the design matrix has {} rows but the response has {} entries",
                x.nrows(),
                y.len()
            )));
        }
        if n_train + n_val > x.nrows() {
            return Err(DataError::InvalidSplit {
                n_train,
                n_val,
                rows: x.nrows(),
            });
        }
        let n = x.nrows();
        let split = Self::new(
            x.slice(s![0..n_train, ..]).to_owned(),
            y.slice(s![0..n_train]).to_owned(),
            x.slice(s![n_train..n_train + n_val, ..]).to_owned(),
            y.slice(s![n_train..n_train + n_val]).to_owned(),
            x.slice(s![n_train + n_val..n, ..]).to_owned(),
            y.slice(s![n_train + n_val..n]).to_owned(),
        )?;
        Ok(split)
    }

    /// Number of features `p` shared by every partition.
    pub fn num_features(&self) -> usize {
        self.x_train.ncols()
    }
}

/// Loads a TSV file with a `y` column and numeric feature columns, then
/// partitions it by row ranges as in [`DatasetSplit::from_rows`].
///
/// Feature columns keep their file order; the `y` column may appear anywhere.
pub fn load_dataset<P: AsRef<Path>>(
    path: P,
    n_train: usize,
    n_val: usize,
) -> Result<DatasetSplit, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path.as_ref())?;

    let headers = reader.headers()?.clone();
    let y_idx = headers
        .iter()
        .position(|h| h == "y")
        .ok_or_else(|| DataError::ColumnNotFound("y".to_string()))?;
    let feature_names: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != y_idx)
        .map(|(_, h)| h.to_string())
        .collect();
    if feature_names.is_empty() {
        return Err(DataError::NoFeatureColumns);
    }
    let p = feature_names.len();

    let mut y_values = Vec::new();
    let mut x_values = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record?;
        let row = row_idx + 1;
        for (j, field) in record.iter().enumerate() {
            let column = headers
                .get(j)
                .unwrap_or_default()
                .to_string();
            let value: f64 = field
                .trim()
                .parse()
                .map_err(|_| DataError::NonNumericField {
                    column: column.clone(),
                    row,
                })?;
            if !value.is_finite() {
                return Err(DataError::NonFiniteValue { column, row });
            }
            if j == y_idx {
                y_values.push(value);
            } else {
                x_values.push(value);
            }
        }
    }

    let n = y_values.len();
    let x = Array2::from_shape_vec((n, p), x_values).map_err(|_| {
        DataError::DimensionMismatch(
            "rows of the input file do not all have the same number of fields".to_string(),
        )
    })?;
    DatasetSplit::from_rows(x, Array1::from_vec(y_values), n_train, n_val)
}
