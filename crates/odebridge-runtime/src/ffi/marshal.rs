//! Matrix marshaling between logical forms and kernel buffers
//!
//! - `encode()`: logical matrix into a column-major kernel buffer
//! - `decode()`: kernel buffer back into a logical matrix
//!
//! Buffers are seen through `ndarray` views that already carry the kernel's
//! leading dimension, so only the layout rules live here. Both directions
//! apply the same full-band normalization, which keeps round trips stable.

use crate::error::{BridgeError, BridgeResult};
use crate::matrix::{BandedLayout, BandedMatrix, MatrixShape, StructuredMatrix};
use ndarray::{s, Array2, ArrayView2, ArrayViewMut2};

fn check_buffer(shape: &MatrixShape, rows: usize, cols: usize) -> BridgeResult<()> {
    if rows != shape.buffer_rows() || cols != shape.buffer_cols() {
        return Err(BridgeError::InternalInconsistency(format!(
            "buffer is {}x{}, layout needs {}x{}",
            rows,
            cols,
            shape.buffer_rows(),
            shape.buffer_cols()
        )));
    }
    Ok(())
}

fn dim_mismatch(expected: (usize, usize), got: (usize, usize)) -> BridgeError {
    BridgeError::layout(format!(
        "matrix is {}x{}, expected {}x{}",
        got.0, got.1, expected.0, expected.1
    ))
}

/// Write one square banded matrix into its slot
fn encode_banded(
    matrix: &BandedMatrix,
    layout: &BandedLayout,
    mut out: ArrayViewMut2<'_, f64>,
) -> BridgeResult<()> {
    if matrix.layout() != *layout {
        return Err(BridgeError::layout(format!(
            "banded matrix has bandwidths ({}, {}) and size {}, expected ({}, {}) and size {}",
            matrix.lower(),
            matrix.upper(),
            matrix.dim(),
            layout.lower,
            layout.upper,
            layout.rows
        )));
    }
    if layout.is_full() {
        out.assign(&matrix.to_dense());
    } else {
        out.assign(matrix.packed());
    }
    Ok(())
}

fn decode_banded(view: ArrayView2<'_, f64>, layout: &BandedLayout) -> BridgeResult<BandedMatrix> {
    if layout.is_full() {
        BandedMatrix::from_dense(&view.to_owned(), layout.lower, layout.upper)
    } else {
        let mut matrix = BandedMatrix::zeros(layout.rows, layout.lower, layout.upper)?;
        matrix.packed_mut().assign(&view);
        Ok(matrix)
    }
}

/// Encode `matrix` into `out`, which must have the buffer extent of `shape`
///
/// A dense matrix is accepted for a banded shape (entries outside the band
/// are dropped) and a banded one for a dense shape.
pub fn encode(
    matrix: &StructuredMatrix,
    shape: &MatrixShape,
    out: &mut ArrayViewMut2<'_, f64>,
) -> BridgeResult<()> {
    check_buffer(shape, out.nrows(), out.ncols())?;
    match (shape.normalized(), matrix) {
        (MatrixShape::Full { rows, cols }, StructuredMatrix::Full(a)) => {
            if a.dim() != (rows, cols) {
                return Err(dim_mismatch((rows, cols), a.dim()));
            }
            out.assign(a);
        }
        (MatrixShape::Full { rows, cols }, StructuredMatrix::Banded(b)) => {
            if (b.dim(), b.dim()) != (rows, cols) {
                return Err(dim_mismatch((rows, cols), (b.dim(), b.dim())));
            }
            out.assign(&b.to_dense());
        }
        (MatrixShape::Banded(layout), StructuredMatrix::Banded(b)) => {
            encode_banded(b, &layout, out.view_mut())?;
        }
        (MatrixShape::Banded(layout), StructuredMatrix::Full(a)) => {
            if a.dim() != (layout.rows, layout.cols) {
                return Err(dim_mismatch((layout.rows, layout.cols), a.dim()));
            }
            let packed = BandedMatrix::from_dense(a, layout.lower, layout.upper)?;
            out.assign(packed.packed());
        }
        (MatrixShape::Blocks { layout, count }, StructuredMatrix::Blocks(blocks)) => {
            if blocks.len() != count {
                return Err(BridgeError::layout(format!(
                    "expected {} blocks, got {}",
                    count,
                    blocks.len()
                )));
            }
            let n = layout.cols;
            for (k, block) in blocks.iter().enumerate() {
                encode_banded(block, &layout, out.slice_mut(s![.., k * n..(k + 1) * n]))?;
            }
        }
        (shape, matrix) => {
            return Err(BridgeError::layout(format!(
                "cannot store a {} matrix in a {} buffer",
                form_name(matrix),
                shape_name(&shape)
            )));
        }
    }
    Ok(())
}

/// Decode a buffer of the given shape
pub fn decode(view: &ArrayView2<'_, f64>, shape: &MatrixShape) -> BridgeResult<StructuredMatrix> {
    check_buffer(shape, view.nrows(), view.ncols())?;
    let matrix = match shape.normalized() {
        MatrixShape::Full { .. } => StructuredMatrix::Full(view.to_owned()),
        MatrixShape::Banded(layout) => StructuredMatrix::Banded(decode_banded(view.view(), &layout)?),
        MatrixShape::Blocks { layout, count } => {
            let n = layout.cols;
            let blocks = (0..count)
                .map(|k| decode_banded(view.slice(s![.., k * n..(k + 1) * n]), &layout))
                .collect::<BridgeResult<Vec<_>>>()?;
            StructuredMatrix::Blocks(blocks)
        }
    };
    Ok(matrix)
}

/// Encode into a fresh column-major buffer with leading dimension equal to
/// the buffer row count
pub fn encode_to_vec(matrix: &StructuredMatrix, shape: &MatrixShape) -> BridgeResult<Vec<f64>> {
    let mut buffer = Array2::zeros((shape.buffer_rows(), shape.buffer_cols()));
    encode(matrix, shape, &mut buffer.view_mut())?;
    Ok(buffer.t().iter().copied().collect())
}

fn form_name(matrix: &StructuredMatrix) -> &'static str {
    match matrix {
        StructuredMatrix::Full(_) => "full",
        StructuredMatrix::Banded(_) => "banded",
        StructuredMatrix::Blocks(_) => "blocked",
    }
}

fn shape_name(shape: &MatrixShape) -> &'static str {
    match shape {
        MatrixShape::Full { .. } => "full",
        MatrixShape::Banded(_) => "banded",
        MatrixShape::Blocks { .. } => "blocked",
    }
}
