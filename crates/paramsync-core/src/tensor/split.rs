use crate::error::ParamsyncError;
use crate::tensor::{DenseTensor, SparseRows, Variable};

// ---------------------------------------------------------------------------
// Splitting (sender side)
// ---------------------------------------------------------------------------

/// Partition a variable along its row axis into one slice per shard, with
/// row counts given by `sections`.
pub fn split_var(var: &Variable, sections: &[i64]) -> Result<Vec<Variable>, ParamsyncError> {
    match var {
        Variable::Dense(t) => Ok(split_dense(t, sections)?
            .into_iter()
            .map(Variable::Dense)
            .collect()),
        Variable::Sparse(s) => Ok(split_sparse(s, sections)?
            .into_iter()
            .map(Variable::Sparse)
            .collect()),
    }
}

/// Contiguous row-range slices of a dense tensor.
pub fn split_dense(
    t: &DenseTensor,
    sections: &[i64],
) -> Result<Vec<DenseTensor>, ParamsyncError> {
    check_sections(sections, t.rows() as i64)?;
    let cols = t.cols();
    let mut out = Vec::with_capacity(sections.len());
    let mut start = 0usize;
    for &section in sections {
        let rows = section as usize;
        let data = t.data()[start * cols..(start + rows) * cols].to_vec();
        out.push(DenseTensor::new(rows, cols, data)?);
        start += rows;
    }
    Ok(out)
}

/// Bucket sparse rows into shards by row index, rebasing each index to be
/// relative to its shard's first row.
pub fn split_sparse(
    s: &SparseRows,
    sections: &[i64],
) -> Result<Vec<SparseRows>, ParamsyncError> {
    check_sections(sections, s.height())?;

    // prefix[i] is the absolute row index where shard i begins.
    let mut prefix = Vec::with_capacity(sections.len() + 1);
    prefix.push(0i64);
    for &section in sections {
        prefix.push(prefix[prefix.len() - 1] + section);
    }

    let mut out: Vec<SparseRows> = sections
        .iter()
        .map(|&section| SparseRows::new(section, s.cols()))
        .collect();

    for (i, &row) in s.row_indices().iter().enumerate() {
        if row < 0 || row >= s.height() {
            return Err(ParamsyncError::Invariant(format!(
                "sparse row index {row} is outside the logical height {}",
                s.height()
            )));
        }
        // partition_point: number of shard starts <= row, minus one.
        let shard = prefix.partition_point(|&p| p <= row) - 1;
        out[shard].push_row(row - prefix[shard], s.value_row(i))?;
    }
    Ok(out)
}

fn check_sections(sections: &[i64], total_rows: i64) -> Result<(), ParamsyncError> {
    if sections.is_empty() {
        return Err(ParamsyncError::Invariant(
            "cannot split into zero sections".to_string(),
        ));
    }
    if sections.iter().any(|&s| s <= 0) {
        return Err(ParamsyncError::Invariant(format!(
            "height sections must be positive, got {sections:?}"
        )));
    }
    let sum: i64 = sections.iter().sum();
    if sum != total_rows {
        return Err(ParamsyncError::Invariant(format!(
            "height sections sum to {sum} but the tensor has {total_rows} rows"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Flattening (receiver side)
// ---------------------------------------------------------------------------

/// Concatenate dense slices along the row axis, in shard order.
pub fn flatten_dense(slices: &[DenseTensor]) -> Result<DenseTensor, ParamsyncError> {
    let Some(first) = slices.first() else {
        return Err(ParamsyncError::Invariant(
            "cannot flatten zero slices".to_string(),
        ));
    };
    let cols = first.cols();
    let mut rows = 0usize;
    let mut data = Vec::new();
    for slice in slices {
        if slice.cols() != cols {
            return Err(ParamsyncError::Invariant(format!(
                "cannot flatten slices with {} and {cols} columns",
                slice.cols()
            )));
        }
        rows += slice.rows();
        data.extend_from_slice(slice.data());
    }
    DenseTensor::new(rows, cols, data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(rows: usize, cols: usize) -> DenseTensor {
        let data = (0..rows * cols).map(|i| i as f32).collect();
        DenseTensor::new(rows, cols, data).unwrap()
    }

    // -----------------------------------------------------------------------
    // Dense split
    // -----------------------------------------------------------------------

    #[test]
    fn dense_split_respects_sections() {
        let t = tensor(5, 2);
        let slices = split_dense(&t, &[2, 3]).unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].shape(), (2, 2));
        assert_eq!(slices[1].shape(), (3, 2));
        assert_eq!(slices[0].data(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(slices[1].data(), &[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn dense_split_single_section_is_a_copy() {
        let t = tensor(4, 1);
        let slices = split_dense(&t, &[4]).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0], t);
    }

    #[test]
    fn dense_split_round_trips_through_flatten() {
        let t = tensor(7, 3);
        let slices = split_dense(&t, &[2, 4, 1]).unwrap();
        let back = flatten_dense(&slices).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn dense_split_rejects_bad_sections() {
        let t = tensor(5, 2);
        assert!(split_dense(&t, &[]).is_err());
        assert!(split_dense(&t, &[2, 2]).is_err());
        assert!(split_dense(&t, &[6, -1]).is_err());
    }

    // -----------------------------------------------------------------------
    // Sparse split
    // -----------------------------------------------------------------------

    #[test]
    fn sparse_split_buckets_and_rebases_indices() {
        let mut s = SparseRows::new(5, 1);
        s.push_row(0, &[10.0]).unwrap();
        s.push_row(2, &[20.0]).unwrap();
        s.push_row(4, &[30.0]).unwrap();

        let shards = split_sparse(&s, &[2, 3]).unwrap();
        assert_eq!(shards[0].row_indices(), &[0]);
        assert_eq!(shards[0].value_row(0), &[10.0]);
        assert_eq!(shards[0].height(), 2);
        // rows 2 and 4 land in shard 1 rebased by the 2-row prefix
        assert_eq!(shards[1].row_indices(), &[0, 2]);
        assert_eq!(shards[1].value_row(0), &[20.0]);
        assert_eq!(shards[1].value_row(1), &[30.0]);
        assert_eq!(shards[1].height(), 3);
    }

    #[test]
    fn sparse_split_boundary_rows_go_to_the_right_shard() {
        let mut s = SparseRows::new(6, 1);
        s.push_row(1, &[1.0]).unwrap();
        s.push_row(2, &[2.0]).unwrap(); // first row of shard 1
        s.push_row(5, &[3.0]).unwrap(); // last row of shard 1

        let shards = split_sparse(&s, &[2, 4]).unwrap();
        assert_eq!(shards[0].row_indices(), &[1]);
        assert_eq!(shards[1].row_indices(), &[0, 3]);
    }

    #[test]
    fn sparse_split_leaves_untouched_shards_empty() {
        let mut s = SparseRows::new(4, 1);
        s.push_row(3, &[1.0]).unwrap();
        let shards = split_sparse(&s, &[2, 2]).unwrap();
        assert_eq!(shards[0].row_count(), 0);
        assert_eq!(shards[1].row_count(), 1);
    }

    #[test]
    fn sparse_split_rejects_out_of_range_rows() {
        let mut s = SparseRows::new(4, 1);
        s.push_row(4, &[1.0]).unwrap();
        assert!(split_sparse(&s, &[2, 2]).is_err());
    }

    // -----------------------------------------------------------------------
    // Flatten
    // -----------------------------------------------------------------------

    #[test]
    fn flatten_concatenates_in_order() {
        let a = DenseTensor::from_rows(&[vec![1.0, 2.0]]).unwrap();
        let b = DenseTensor::from_rows(&[vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        let flat = flatten_dense(&[a, b]).unwrap();
        assert_eq!(flat.shape(), (3, 2));
        assert_eq!(flat.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn flatten_rejects_column_mismatch() {
        let a = DenseTensor::zeros(1, 2);
        let b = DenseTensor::zeros(1, 3);
        assert!(flatten_dense(&[a, b]).is_err());
    }

    #[test]
    fn flatten_rejects_empty_input() {
        assert!(flatten_dense(&[]).is_err());
    }

    // -----------------------------------------------------------------------
    // split_var dispatch
    // -----------------------------------------------------------------------

    #[test]
    fn split_var_handles_both_variants() {
        let d = Variable::Dense(tensor(4, 1));
        let slices = split_var(&d, &[2, 2]).unwrap();
        assert!(slices.iter().all(Variable::is_dense));

        let mut sr = SparseRows::new(4, 1);
        sr.push_row(0, &[1.0]).unwrap();
        let s = Variable::Sparse(sr);
        let slices = split_var(&s, &[2, 2]).unwrap();
        assert!(slices.iter().all(Variable::is_sparse));
    }
}
