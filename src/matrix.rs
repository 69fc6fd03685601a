//! Dense matrix helpers shared by every layer.
//!
//! Matrices are batch-major `Array2<f64>`: one sample per row. Bias vectors
//! are `Array1<f64>` and are broadcast across rows.

use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::error::{dims_mismatch, NnError, Result};

pub type Matrix = Array2<f64>;
pub type Vector = Array1<f64>;

pub fn transpose(a: &Matrix) -> Matrix {
    a.t().to_owned()
}

/// Row-major relayout of `base` into `rows x cols`.
///
/// The elements are read in row-major order and re-chunked, so
/// `reshape(reshape(a, r, c)?, a.nrows(), a.ncols())` always returns `a`.
pub fn reshape(base: &Matrix, rows: usize, cols: usize) -> Result<Matrix> {
    let from = base.dim();
    if from.0 * from.1 != rows * cols {
        return Err(NnError::ElementCountMismatch {
            from,
            to: (rows, cols),
        });
    }
    let raw: Vec<f64> = base.iter().copied().collect();
    Array2::from_shape_vec((rows, cols), raw).map_err(|_| NnError::ElementCountMismatch {
        from,
        to: (rows, cols),
    })
}

/// Checked matrix product `a · b`.
pub fn dot(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    if a.ncols() != b.nrows() {
        return Err(dims_mismatch("dot", a.dim(), b.dim()));
    }
    Ok(a.dot(b))
}

/// Adds `vector[j]` to every `matrix[i][j]`.
pub fn add_vector_to_columns(matrix: &Matrix, vector: &Vector) -> Result<Matrix> {
    if vector.len() != matrix.ncols() {
        return Err(dims_mismatch(
            "add_vector_to_columns",
            matrix.dim(),
            (1, vector.len()),
        ));
    }
    let mut out = matrix.clone();
    out += vector;
    Ok(out)
}

pub fn sum_each_column(matrix: &Matrix) -> Vector {
    matrix.sum_axis(Axis(0))
}

/// Row-wise maximum and the column where it first occurs.
pub fn max_each_row(matrix: &Matrix) -> (Vector, Vec<usize>) {
    let mut values = Vector::zeros(matrix.nrows());
    let mut args = Vec::with_capacity(matrix.nrows());
    for (i, row) in matrix.rows().into_iter().enumerate() {
        let (arg, max) = argmax(row);
        values[i] = max;
        args.push(arg);
    }
    (values, args)
}

pub(crate) fn argmax(row: ArrayView1<f64>) -> (usize, f64) {
    let mut arg = 0;
    let mut max = f64::NEG_INFINITY;
    for (j, &v) in row.iter().enumerate() {
        if v > max {
            max = v;
            arg = j;
        }
    }
    (arg, max)
}

pub(crate) fn ensure_same_shape(op: &'static str, a: &Matrix, b: &Matrix) -> Result<()> {
    if a.dim() != b.dim() {
        return Err(dims_mismatch(op, a.dim(), b.dim()));
    }
    Ok(())
}

/// Bias vectors cross the parameter-map boundary as `1 x N` matrices.
pub fn vector_to_row(v: &Vector) -> Matrix {
    v.clone().insert_axis(Axis(0))
}

/// Accepts a `1 x N` row or an `N x 1` column.
pub fn row_to_vector(m: &Matrix) -> Result<Vector> {
    match m.dim() {
        (1, _) => Ok(m.row(0).to_owned()),
        (_, 1) => Ok(m.column(0).to_owned()),
        dim => Err(dims_mismatch("row_to_vector", dim, (1, dim.0 * dim.1))),
    }
}
