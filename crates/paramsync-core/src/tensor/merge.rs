use std::collections::HashMap;

use crate::error::ParamsyncError;
use crate::tensor::{DenseTensor, SparseRows, Variable};

// ---------------------------------------------------------------------------
// merge_vars
// ---------------------------------------------------------------------------

/// Reduce a batch of same-named variable snapshots into one.
///
/// Dense inputs must all share the shape of the first; the output is their
/// element-wise sum, additionally divided by the batch size when
/// `merge_add` is false (recv-style averaging). Sparse inputs are
/// concatenated and duplicate row indices collapsed by summing; output rows
/// keep the insertion order of their first appearance.
pub fn merge_vars(
    var_name: &str,
    vars: &[Variable],
    merge_add: bool,
) -> Result<Variable, ParamsyncError> {
    let Some(first) = vars.first() else {
        return Err(ParamsyncError::Invariant(format!(
            "merge of {var_name} has no inputs"
        )));
    };
    match first {
        Variable::Dense(t) => merge_dense(var_name, vars, t.shape(), merge_add),
        Variable::Sparse(s) => merge_sparse(var_name, vars, s.height(), s.cols()),
    }
}

fn merge_dense(
    var_name: &str,
    vars: &[Variable],
    shape: (usize, usize),
    merge_add: bool,
) -> Result<Variable, ParamsyncError> {
    let (rows, cols) = shape;
    let mut out = vec![0.0f32; rows * cols];
    for var in vars {
        let Some(t) = var.as_dense() else {
            return Err(ParamsyncError::Invariant(format!(
                "merge of {var_name} mixes dense and sparse inputs"
            )));
        };
        if t.shape() != shape {
            return Err(ParamsyncError::Invariant(format!(
                "merge of {var_name} expects shape [{rows}, {cols}], got [{}, {}]",
                t.rows(),
                t.cols()
            )));
        }
        for (acc, x) in out.iter_mut().zip(t.data()) {
            *acc += x;
        }
    }
    if !merge_add {
        let n = vars.len() as f32;
        for acc in &mut out {
            *acc /= n;
        }
    }
    Ok(Variable::Dense(DenseTensor::new(rows, cols, out)?))
}

fn merge_sparse(
    var_name: &str,
    vars: &[Variable],
    height: i64,
    cols: usize,
) -> Result<Variable, ParamsyncError> {
    // Slot per unique row index, allocated in first-appearance order.
    let mut order: Vec<i64> = Vec::new();
    let mut slot_of: HashMap<i64, usize> = HashMap::new();
    let mut values: Vec<f32> = Vec::new();

    for var in vars {
        let Some(s) = var.as_sparse() else {
            return Err(ParamsyncError::Invariant(format!(
                "merge of {var_name} mixes dense and sparse inputs"
            )));
        };
        if s.height() != height || s.cols() != cols {
            return Err(ParamsyncError::Invariant(format!(
                "merge of {var_name} expects sparse rows over height {height} x {cols} cols, \
                 got height {} x {} cols",
                s.height(),
                s.cols()
            )));
        }
        for (i, &row) in s.row_indices().iter().enumerate() {
            let slot = *slot_of.entry(row).or_insert_with(|| {
                order.push(row);
                values.resize(values.len() + cols, 0.0);
                order.len() - 1
            });
            let dst = &mut values[slot * cols..(slot + 1) * cols];
            for (acc, x) in dst.iter_mut().zip(s.value_row(i)) {
                *acc += x;
            }
        }
    }

    Ok(Variable::Sparse(SparseRows::with_rows(
        height, cols, order, values,
    )?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
