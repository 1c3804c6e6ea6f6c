pub mod merge;
pub mod split;

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::ParamsyncError;

// ---------------------------------------------------------------------------
// DenseTensor
// ---------------------------------------------------------------------------

/// A fixed-shape row-major `f32` matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DenseTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl DenseTensor {
    /// A `rows x cols` tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build from raw row-major data; `data.len()` must equal `rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, ParamsyncError> {
        if data.len() != rows * cols {
            return Err(ParamsyncError::Invariant(format!(
                "dense tensor of shape [{rows}, {cols}] needs {} elements, got {}",
                rows * cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Build from a non-empty list of equal-length rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, ParamsyncError> {
        let Some(first) = rows.first() else {
            return Err(ParamsyncError::Invariant(
                "cannot build a dense tensor from zero rows".to_string(),
            ));
        };
        let cols = first.len();
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(ParamsyncError::Invariant(format!(
                    "ragged rows: expected {cols} columns, got {}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Row `r` as a slice. Panics if `r >= rows`.
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Mutable row `r`. Panics if `r >= rows`.
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }
}

// ---------------------------------------------------------------------------
// SparseRows
// ---------------------------------------------------------------------------

/// A sparse-rows value: a `k x cols` dense value matrix plus the `k` row
/// indices it occupies in a logical dense parent of `height` rows.
///
/// Duplicate row indices are legal before merging and forbidden after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SparseRows {
    height: i64,
    cols: usize,
    rows: Vec<i64>,
    values: Vec<f32>,
}

impl SparseRows {
    /// An empty sparse value over a logical parent of `height` rows.
    pub fn new(height: i64, cols: usize) -> Self {
        Self {
            height,
            cols,
            rows: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Build from parallel row-index and row-major value buffers.
    pub fn with_rows(
        height: i64,
        cols: usize,
        rows: Vec<i64>,
        values: Vec<f32>,
    ) -> Result<Self, ParamsyncError> {
        if values.len() != rows.len() * cols {
            return Err(ParamsyncError::Invariant(format!(
                "sparse value of {} rows x {cols} cols needs {} elements, got {}",
                rows.len(),
                rows.len() * cols,
                values.len()
            )));
        }
        Ok(Self {
            height,
            cols,
            rows,
            values,
        })
    }

    /// Append one row; `values.len()` must equal `cols`.
    pub fn push_row(&mut self, index: i64, values: &[f32]) -> Result<(), ParamsyncError> {
        if values.len() != self.cols {
            return Err(ParamsyncError::Invariant(format!(
                "sparse row needs {} values, got {}",
                self.cols,
                values.len()
            )));
        }
        self.rows.push(index);
        self.values.extend_from_slice(values);
        Ok(())
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of materialized rows (`k`).
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row_indices(&self) -> &[i64] {
        &self.rows
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// The `i`-th materialized row. Panics if `i >= row_count`.
    pub fn value_row(&self, i: usize) -> &[f32] {
        &self.values[i * self.cols..(i + 1) * self.cols]
    }
}

// ---------------------------------------------------------------------------
// Variable
// ---------------------------------------------------------------------------

/// The two variable shapes the communicator moves: dense 2-D tensors and
/// sparse row updates over a logical dense parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Variable {
    Dense(DenseTensor),
    Sparse(SparseRows),
}

impl Variable {
    pub fn is_dense(&self) -> bool {
        matches!(self, Variable::Dense(_))
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Variable::Sparse(_))
    }

    pub fn as_dense(&self) -> Option<&DenseTensor> {
        match self {
            Variable::Dense(t) => Some(t),
            Variable::Sparse(_) => None,
        }
    }

    pub fn as_sparse(&self) -> Option<&SparseRows> {
        match self {
            Variable::Sparse(s) => Some(s),
            Variable::Dense(_) => None,
        }
    }

    pub fn numel(&self) -> usize {
        match self {
            Variable::Dense(t) => t.numel(),
            Variable::Sparse(s) => s.values().len(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Variable::Dense(_) => "dense",
            Variable::Sparse(_) => "sparse",
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A named variable store shared between the compute loop and the
/// communicator's background tasks.
///
/// Reads clone the stored value, so every read is a self-consistent
/// snapshot; no lock is ever held across an await point.
#[derive(Debug, Default)]
pub struct Scope {
    vars: RwLock<HashMap<String, Variable>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the variable, if present.
    pub fn get(&self, name: &str) -> Option<Variable> {
        self.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, var: Variable) {
        self.write().insert(name.into(), var);
    }

    pub fn remove(&self, name: &str) -> Option<Variable> {
        self.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Run `f` against the stored variable without cloning it out.
    pub fn with_var<R>(&self, name: &str, f: impl FnOnce(&Variable) -> R) -> Option<R> {
        self.read().get(name).map(f)
    }

    /// Mutate the stored variable in place.
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut Variable) -> R) -> Option<R> {
        self.write().get_mut(name).map(f)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Variable>> {
        self.vars.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Variable>> {
        self.vars.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
