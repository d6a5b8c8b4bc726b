//! Joint-matrix tiles for kernel bodies.
//!
//! A work item loads `bf16` operand tiles from device memory, multiplies them into an `f32`
//! accumulator tile and stores the result. Tiles are held row-major on the host side; the
//! [`MatrixLayout`] only describes how the tile sits in device memory.

use bytemuck::Pod;
use half::bf16;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::spec::{BackendError, BackendResult};
use crate::memory::UsmPtr;

use super::kernel::KernelContext;

/// Elements per packed pair in [`MatrixLayout::Packed`].
pub const PACK_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatrixLayout {
    RowMajor,
    ColMajor,
    /// Pairs of consecutive rows interleaved element by element: element `(r, c)` sits in row
    /// `r / 2` at column `c * 2 + r % 2`. Only meaningful for the right-hand operand.
    Packed,
}

impl MatrixLayout {
    /// Element index of `(row, col)` in a matrix with leading dimension `stride`.
    pub fn index(self, row: usize, col: usize, stride: usize) -> usize {
        match self {
            MatrixLayout::RowMajor => row * stride + col,
            MatrixLayout::ColMajor => col * stride + row,
            MatrixLayout::Packed => {
                (row / PACK_FACTOR) * stride + col * PACK_FACTOR + row % PACK_FACTOR
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("cannot multiply {a_rows}x{a_cols} by {b_rows}x{b_cols} into {c_rows}x{c_cols}")]
    ShapeMismatch {
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
        c_rows: usize,
        c_cols: usize,
    },
    #[error("packed layout needs an even row count and origin, got {rows} rows")]
    UnpackableRows { rows: usize },
}

impl From<MatrixError> for BackendError {
    fn from(err: MatrixError) -> Self {
        BackendError::execution(err.to_string())
    }
}

/// Element types a tile may hold.
pub trait TileElement: Pod + Default {
    fn to_f32(self) -> f32;
}

impl TileElement for bf16 {
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
}

impl TileElement for f32 {
    fn to_f32(self) -> f32 {
        self
    }
}

/// `rows x cols` block of a larger matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: TileElement> Tile<T> {
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.data[row * self.cols + col] = value;
    }
}

impl Tile<f32> {
    /// `self += a * b`, accumulating in `f32` with `k` ascending.
    pub fn multiply_accumulate(
        &mut self,
        a: &Tile<bf16>,
        b: &Tile<bf16>,
    ) -> Result<(), MatrixError> {
        if a.cols != b.rows || a.rows != self.rows || b.cols != self.cols {
            return Err(MatrixError::ShapeMismatch {
                a_rows: a.rows,
                a_cols: a.cols,
                b_rows: b.rows,
                b_cols: b.cols,
                c_rows: self.rows,
                c_cols: self.cols,
            });
        }
        for row in 0..self.rows {
            for col in 0..self.cols {
                let mut acc = self.get(row, col);
                for k in 0..a.cols {
                    acc += a.get(row, k).to_f32() * b.get(k, col).to_f32();
                }
                self.set(row, col, acc);
            }
        }
        Ok(())
    }
}

/// Placement of a tile inside a matrix stored in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileOrigin {
    pub row: usize,
    pub col: usize,
    /// Leading dimension of the stored matrix, in elements.
    pub stride: usize,
    pub layout: MatrixLayout,
}

impl TileOrigin {
    pub fn new(row: usize, col: usize, stride: usize, layout: MatrixLayout) -> Self {
        Self {
            row,
            col,
            stride,
            layout,
        }
    }

    fn check(&self, rows: usize) -> Result<(), MatrixError> {
        let aligned = rows % PACK_FACTOR == 0 && self.row % PACK_FACTOR == 0;
        if self.layout == MatrixLayout::Packed && !aligned {
            return Err(MatrixError::UnpackableRows { rows });
        }
        Ok(())
    }

    fn index(&self, row: usize, col: usize) -> usize {
        self.layout.index(self.row + row, self.col + col, self.stride)
    }
}

impl KernelContext<'_> {
    pub fn load_tile<T: TileElement>(
        &self,
        ptr: &UsmPtr,
        rows: usize,
        cols: usize,
        origin: TileOrigin,
    ) -> BackendResult<Tile<T>> {
        origin.check(rows)?;
        let mut tile = Tile::filled(rows, cols, T::default());
        for row in 0..rows {
            for col in 0..cols {
                tile.set(row, col, self.load(ptr, origin.index(row, col))?);
            }
        }
        Ok(tile)
    }

    pub fn store_tile<T: TileElement>(
        &self,
        ptr: &UsmPtr,
        tile: &Tile<T>,
        origin: TileOrigin,
    ) -> BackendResult<()> {
        origin.check(tile.rows)?;
        for row in 0..tile.rows {
            for col in 0..tile.cols {
                self.store(ptr, origin.index(row, col), tile.get(row, col))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f32) -> Tile<bf16> {
        let mut tile = Tile::filled(rows, cols, bf16::ZERO);
        for row in 0..rows {
            for col in 0..cols {
                tile.set(row, col, bf16::from_f32(f(row, col)));
            }
        }
        tile
    }

    #[test]
    fn layouts_address_the_same_element() {
        // 4x3 matrix, element (3, 1)
        assert_eq!(MatrixLayout::RowMajor.index(3, 1, 3), 10);
        assert_eq!(MatrixLayout::ColMajor.index(3, 1, 4), 7);
        // rows 2 and 3 share packed row 1; column 1 occupies slots 2 and 3
        assert_eq!(MatrixLayout::Packed.index(3, 1, 6), 9);
        assert_eq!(MatrixLayout::Packed.index(2, 1, 6), 8);
    }

    #[test]
    fn multiply_accumulate_adds_onto_the_accumulator() {
        let a = tile(2, 3, |r, c| (r + c) as f32);
        let b = tile(3, 2, |r, c| (2 * r + 3 * c) as f32);
        let mut c = Tile::filled(2, 2, 1.0f32);
        c.multiply_accumulate(&a, &b).unwrap();
        // row 1 of a is [1, 2, 3], column 1 of b is [3, 5, 7]
        assert_eq!(c.get(1, 1), 1.0 + 3.0 + 10.0 + 21.0);
        assert_eq!(c.get(0, 0), 1.0 + 0.0 + 2.0 + 8.0);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let a = tile(2, 3, |_, _| 1.0);
        let b = tile(2, 2, |_, _| 1.0);
        let mut c = Tile::filled(2, 2, 0.0f32);
        assert!(matches!(
            c.multiply_accumulate(&a, &b),
            Err(MatrixError::ShapeMismatch { a_cols: 3, b_rows: 2, .. })
        ));
    }
}
