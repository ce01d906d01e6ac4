//! Logical matrix forms exchanged with user code
//!
//! A Jacobian or mass matrix is either dense, banded, or (under the special
//! structure partition) a row of equally banded square blocks. Banded
//! matrices keep the kernel's packed layout internally: entry `(i, j)` lives
//! at packed row `i - j + upper`, column `j`.

use crate::error::{BridgeError, BridgeResult};
use ndarray::{s, Array2};

/// Lower and upper bandwidth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidths {
    pub lower: usize,
    pub upper: usize,
}

impl Bandwidths {
    pub fn new(lower: usize, upper: usize) -> Self {
        Self { lower, upper }
    }
}

/// Special-structure partition of the state vector
///
/// The first `m1` components have trivially known derivatives (shifts of
/// later components); the remainder is organized in blocks of `m2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StructureSplit {
    m1: usize,
    m2: usize,
}

impl StructureSplit {
    /// No special structure
    pub fn none() -> Self {
        Self::default()
    }

    /// Requires `m1 == 0`, or `m1 > 0`, `m2 > 0` and `m1 % m2 == 0`
    pub fn new(m1: usize, m2: usize) -> BridgeResult<Self> {
        if m1 > 0 && (m2 == 0 || m1 % m2 != 0) {
            return Err(BridgeError::layout(format!(
                "structure split M1 = {} must be a positive multiple of M2 = {}",
                m1, m2
            )));
        }
        Ok(Self { m1, m2 })
    }

    pub fn m1(&self) -> usize {
        self.m1
    }

    pub fn m2(&self) -> usize {
        self.m2
    }

    pub fn is_trivial(&self) -> bool {
        self.m1 == 0
    }
}

/// How a logical matrix is packed into a flat buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandedLayout {
    pub lower: usize,
    pub upper: usize,
    pub rows: usize,
    pub cols: usize,
}

impl BandedLayout {
    pub fn new(lower: usize, upper: usize, rows: usize, cols: usize) -> BridgeResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(BridgeError::layout("banded region must not be empty"));
        }
        if lower >= rows || upper >= cols {
            return Err(BridgeError::layout(format!(
                "bandwidths ({}, {}) out of range for a {}x{} region",
                lower, upper, rows, cols
            )));
        }
        Ok(Self {
            lower,
            upper,
            rows,
            cols,
        })
    }

    /// `lower == rows - 1` means the band covers everything below the diagonal
    /// and the matrix is stored densely
    pub fn is_full(&self) -> bool {
        self.lower + 1 == self.rows
    }

    /// Rows of packed storage, ignoring the full-storage normalization
    pub fn band_rows(&self) -> usize {
        1 + self.lower + self.upper
    }

    /// Rows the kernel's buffer has for this layout
    pub fn buffer_rows(&self) -> usize {
        if self.is_full() {
            self.rows
        } else {
            self.band_rows()
        }
    }

    pub fn in_band(&self, i: usize, j: usize) -> bool {
        i < self.rows && j < self.cols && j <= i + self.upper && i <= j + self.lower
    }

    /// Packed row of logical entry `(i, j)`; caller checks `in_band`
    pub fn packed_row(&self, i: usize, j: usize) -> usize {
        i + self.upper - j
    }
}

/// Square banded matrix in packed storage
#[derive(Debug, Clone, PartialEq)]
pub struct BandedMatrix {
    layout: BandedLayout,
    packed: Array2<f64>,
}

impl BandedMatrix {
    pub fn zeros(n: usize, lower: usize, upper: usize) -> BridgeResult<Self> {
        let layout = BandedLayout::new(lower, upper, n, n)?;
        Ok(Self {
            layout,
            packed: Array2::zeros((layout.band_rows(), n)),
        })
    }

    /// Pack the band of a dense square matrix; entries outside it are dropped
    pub fn from_dense(dense: &Array2<f64>, lower: usize, upper: usize) -> BridgeResult<Self> {
        let (rows, cols) = dense.dim();
        if rows != cols {
            return Err(BridgeError::layout(format!(
                "banded matrix must be square, got {}x{}",
                rows, cols
            )));
        }
        let mut banded = Self::zeros(rows, lower, upper)?;
        for j in 0..cols {
            for i in j.saturating_sub(upper)..rows.min(j + lower + 1) {
                let r = banded.layout.packed_row(i, j);
                banded.packed[(r, j)] = dense[(i, j)];
            }
        }
        Ok(banded)
    }

    pub fn identity(n: usize) -> BridgeResult<Self> {
        let mut m = Self::zeros(n, 0, 0)?;
        m.packed.fill(1.0);
        Ok(m)
    }

    pub fn dim(&self) -> usize {
        self.layout.rows
    }

    pub fn lower(&self) -> usize {
        self.layout.lower
    }

    pub fn upper(&self) -> usize {
        self.layout.upper
    }

    pub fn layout(&self) -> BandedLayout {
        self.layout
    }

    /// Packed `(1 + lower + upper) x n` storage
    pub fn packed(&self) -> &Array2<f64> {
        &self.packed
    }

    pub(crate) fn packed_mut(&mut self) -> &mut Array2<f64> {
        &mut self.packed
    }

    /// Entry `(i, j)`; zero outside the band
    pub fn get(&self, i: usize, j: usize) -> f64 {
        if self.layout.in_band(i, j) {
            self.packed[(self.layout.packed_row(i, j), j)]
        } else {
            0.0
        }
    }

    pub fn set(&mut self, i: usize, j: usize, value: f64) -> BridgeResult<()> {
        if !self.layout.in_band(i, j) {
            return Err(BridgeError::layout(format!(
                "({}, {}) lies outside bandwidths ({}, {})",
                i, j, self.layout.lower, self.layout.upper
            )));
        }
        let r = self.layout.packed_row(i, j);
        self.packed[(r, j)] = value;
        Ok(())
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let n = self.dim();
        Array2::from_shape_fn((n, n), |(i, j)| self.get(i, j))
    }
}

/// A matrix as user code sees it
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredMatrix {
    Full(Array2<f64>),
    Banded(BandedMatrix),
    /// Blocks laid side by side, left to right
    Blocks(Vec<BandedMatrix>),
}

impl StructuredMatrix {
    pub fn identity(n: usize) -> Self {
        StructuredMatrix::Full(Array2::eye(n))
    }

    /// Dense equivalent; blocks are concatenated horizontally
    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            StructuredMatrix::Full(a) => a.clone(),
            StructuredMatrix::Banded(b) => b.to_dense(),
            StructuredMatrix::Blocks(blocks) => {
                let n = blocks.first().map(|b| b.dim()).unwrap_or(0);
                let mut dense = Array2::zeros((n, n * blocks.len()));
                for (k, block) in blocks.iter().enumerate() {
                    dense
                        .slice_mut(s![.., k * n..(k + 1) * n])
                        .assign(&block.to_dense());
                }
                dense
            }
        }
    }

    /// Number of blocks the user works with
    pub fn block_count(&self) -> usize {
        match self {
            StructuredMatrix::Blocks(blocks) => blocks.len(),
            _ => 1,
        }
    }
}

/// Shape of a buffer exchanged with the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixShape {
    Full { rows: usize, cols: usize },
    Banded(BandedLayout),
    /// `count` square blocks sharing one layout, side by side
    Blocks { layout: BandedLayout, count: usize },
}

impl MatrixShape {
    /// Jacobian shape for a `dimension`-sized state
    ///
    /// - no band: `(d - M1) x d` dense (or `d x d` when `M1 == 0`)
    /// - band with `M1 == 0`: one `d x d` banded matrix
    /// - band with `M1 > 0`: `1 + M1/M2` blocks of `M2 x M2`, requiring `M1 + M2 == d`
    pub fn jacobian(
        dimension: usize,
        split: StructureSplit,
        band: Option<Bandwidths>,
    ) -> BridgeResult<Self> {
        if split.m1() >= dimension && dimension > 0 {
            return Err(BridgeError::layout(format!(
                "M1 = {} leaves no free components in dimension {}",
                split.m1(),
                dimension
            )));
        }
        let shape = match band {
            None => MatrixShape::Full {
                rows: dimension - split.m1(),
                cols: dimension,
            },
            Some(band) if split.is_trivial() => MatrixShape::Banded(BandedLayout::new(
                band.lower,
                band.upper,
                dimension,
                dimension,
            )?),
            Some(band) => {
                if split.m1() + split.m2() != dimension {
                    return Err(BridgeError::layout(format!(
                        "banded special structure needs M1 + M2 = {}, got {} + {}",
                        dimension,
                        split.m1(),
                        split.m2()
                    )));
                }
                MatrixShape::Blocks {
                    layout: BandedLayout::new(band.lower, band.upper, split.m2(), split.m2())?,
                    count: 1 + split.m1() / split.m2(),
                }
            }
        };
        Ok(shape.normalized())
    }

    /// Shape that stores `matrix` exactly
    pub fn of(matrix: &StructuredMatrix) -> BridgeResult<Self> {
        let shape = match matrix {
            StructuredMatrix::Full(a) => MatrixShape::Full {
                rows: a.nrows(),
                cols: a.ncols(),
            },
            StructuredMatrix::Banded(b) => MatrixShape::Banded(b.layout()),
            StructuredMatrix::Blocks(blocks) => {
                let first = blocks
                    .first()
                    .ok_or_else(|| BridgeError::layout("block list is empty"))?;
                if blocks.iter().any(|b| b.layout() != first.layout()) {
                    return Err(BridgeError::layout("blocks must share one layout"));
                }
                MatrixShape::Blocks {
                    layout: first.layout(),
                    count: blocks.len(),
                }
            }
        };
        Ok(shape.normalized())
    }

    /// A single banded matrix whose band covers the whole lower triangle is
    /// stored densely
    pub fn normalized(self) -> Self {
        match self {
            MatrixShape::Banded(layout) if layout.is_full() => MatrixShape::Full {
                rows: layout.rows,
                cols: layout.cols,
            },
            other => other,
        }
    }

    pub fn block_count(&self) -> usize {
        match self {
            MatrixShape::Blocks { count, .. } => *count,
            _ => 1,
        }
    }

    /// Bandwidths as the kernel sees them; `None` for dense storage
    pub fn bandwidths(&self) -> Option<Bandwidths> {
        match self {
            MatrixShape::Full { .. } => None,
            MatrixShape::Banded(layout) | MatrixShape::Blocks { layout, .. } => {
                if layout.is_full() {
                    None
                } else {
                    Some(Bandwidths::new(layout.lower, layout.upper))
                }
            }
        }
    }

    pub fn buffer_rows(&self) -> usize {
        match self {
            MatrixShape::Full { rows, .. } => *rows,
            MatrixShape::Banded(layout) | MatrixShape::Blocks { layout, .. } => {
                layout.buffer_rows()
            }
        }
    }

    pub fn buffer_cols(&self) -> usize {
        match self {
            MatrixShape::Full { cols, .. } => *cols,
            MatrixShape::Banded(layout) => layout.cols,
            MatrixShape::Blocks { layout, count } => layout.cols * count,
        }
    }

    /// Zero matrix of this shape, ready for user code to fill in
    pub fn zeros(&self) -> StructuredMatrix {
        match self {
            MatrixShape::Full { rows, cols } => StructuredMatrix::Full(Array2::zeros((*rows, *cols))),
            MatrixShape::Banded(layout) => StructuredMatrix::Banded(BandedMatrix {
                layout: *layout,
                packed: Array2::zeros((layout.band_rows(), layout.cols)),
            }),
            MatrixShape::Blocks { layout, count } => StructuredMatrix::Blocks(
                (0..*count)
                    .map(|_| BandedMatrix {
                        layout: *layout,
                        packed: Array2::zeros((layout.band_rows(), layout.cols)),
                    })
                    .collect(),
            ),
        }
    }
}
