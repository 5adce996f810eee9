//! Token grid and attention-input builders for the decode loops.
//!
//! The anchor stage owns one [`TokenGrid`] per call: a dense
//! `[batch, max_sequence_length]` buffer holding right-padded prompts that
//! is filled in column by column as tokens finalize. Other stages keep a
//! mirror of the columns they need for embedding lookups.

use candle_core::{Device, Tensor};

use crate::error::Result;

/// Dense `[batch, max_len]` token buffer, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrid {
    data: Vec<u32>,
    batch_size: usize,
    max_len: usize,
}

impl TokenGrid {
    pub fn new(batch_size: usize, max_len: usize, pad: u32) -> Self {
        Self {
            data: vec![pad; batch_size * max_len],
            batch_size,
            max_len,
        }
    }

    /// Build a grid from right-padded prompt rows of equal width.
    pub fn from_rows(rows: &[Vec<u32>]) -> Self {
        assert!(!rows.is_empty(), "prompt batch must be non-empty");
        let max_len = rows[0].len();
        assert!(
            rows.iter().all(|r| r.len() == max_len),
            "prompt rows must share one width"
        );
        let mut data = Vec::with_capacity(rows.len() * max_len);
        for row in rows {
            data.extend_from_slice(row);
        }
        Self {
            data,
            batch_size: rows.len(),
            max_len,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn get(&self, row: usize, col: usize) -> u32 {
        self.data[row * self.max_len + col]
    }

    pub fn set(&mut self, row: usize, col: usize, token: u32) {
        self.data[row * self.max_len + col] = token;
    }

    pub fn row(&self, row: usize) -> &[u32] {
        &self.data[row * self.max_len..(row + 1) * self.max_len]
    }

    pub fn column(&self, col: usize) -> Vec<u32> {
        (0..self.batch_size).map(|r| self.get(r, col)).collect()
    }

    /// Columns `range` of every row as a `[batch, len]` u32 tensor.
    pub fn slice_tensor(&self, range: std::ops::Range<usize>, device: &Device) -> Result<Tensor> {
        let len = range.len();
        let mut flat = Vec::with_capacity(self.batch_size * len);
        for row in 0..self.batch_size {
            flat.extend_from_slice(&self.row(row)[range.clone()]);
        }
        Ok(Tensor::from_vec(flat, (self.batch_size, len), device)?)
    }

    /// Reorder rows so row i becomes old row `rows[i]`.
    pub fn reorder_rows(&mut self, rows: &[u32]) {
        assert_eq!(rows.len(), self.batch_size);
        let old = self.data.clone();
        for (new_row, &src) in rows.iter().enumerate() {
            let src = src as usize;
            self.data[new_row * self.max_len..(new_row + 1) * self.max_len]
                .copy_from_slice(&old[src * self.max_len..(src + 1) * self.max_len]);
        }
    }

    /// Drop all columns past `len`.
    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.max_len);
        let mut data = Vec::with_capacity(self.batch_size * len);
        for row in 0..self.batch_size {
            data.extend_from_slice(&self.row(row)[..len]);
        }
        self.data = data;
        self.max_len = len;
    }

    /// Rotate one row left by `shift`, moving its prompt to the tail.
    pub fn roll_row_left(&mut self, row: usize, shift: usize) {
        self.data[row * self.max_len..(row + 1) * self.max_len].rotate_left(shift % self.max_len);
    }
}

/// Position ids `0..len` replicated across the batch, `[batch, len]` u32.
pub fn build_position_ids(batch_size: usize, len: usize, device: &Device) -> Result<Tensor> {
    let row: Vec<u32> = (0..len as u32).collect();
    let mut flat = Vec::with_capacity(batch_size * len);
    for _ in 0..batch_size {
        flat.extend_from_slice(&row);
    }
    Ok(Tensor::from_vec(flat, (batch_size, len), device)?)
}

/// Lower-triangular causal mask, `[len, len]` u8, 1 = attend.
pub fn build_causal_mask(len: usize, device: &Device) -> Result<Tensor> {
    let mut flat = vec![0u8; len * len];
    for q in 0..len {
        for k in 0..=q {
            flat[q * len + k] = 1;
        }
    }
    Ok(Tensor::from_vec(flat, (len, len), device)?)
}

/// Rows `range` of a full causal mask: queries for the current span against
/// all keys up to the span's end, `[span, range.end]`.
pub fn causal_mask_slice(
    mask: &Tensor,
    range: std::ops::Range<usize>,
) -> Result<Tensor> {
    let span = range.len();
    Ok(mask.narrow(0, range.start, span)?.narrow(1, 0, range.end)?)
}
