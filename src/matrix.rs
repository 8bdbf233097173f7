//! Dense host-side matrix storage.
//!
//! The engine keeps points as an `F x N` matrix (one row per feature)
//! and centroids as an `F x K` matrix, so a column holds one point or
//! one centroid. Element `(r, c)` lives at offset `r * cols + c`; the
//! values of one row are contiguous.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matrix<T> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
}

impl<T: Copy + Default> Matrix<T> {
    pub fn new() -> Matrix<T> {
        Matrix {
            data: Vec::new(),
            rows: 0,
            cols: 0,
        }
    }

    pub fn from_vec(data: Vec<T>, rows: usize, cols: usize) -> Result<Matrix<T>> {
        if data.len() != rows * cols {
            return Err(Error::consistency(format!(
                "matrix storage length {} does not match {} x {}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Matrix { data, rows, cols })
    }

    /// Resizes the storage. Meant to be called exactly once per logical
    /// use of the matrix.
    pub fn resize(&mut self, rows: usize, cols: usize) {
        self.data.resize(rows * cols, T::default());
        self.rows = rows;
        self.cols = cols;
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.cols + col] = value;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

/// Rewrites an `F x N` row-contiguous matrix so that every
/// `buffer_size`-byte chunk of the output is itself a self-contained
/// `F x n_chunk` matrix.
///
/// The scheduler hands out tiles by plain byte offset; without this
/// transform a tile would slice each feature row at a different point.
/// `buffer_size` must be a whole multiple of `num_dims * size_of::<T>()`
/// so that no point straddles a chunk boundary. The final chunk may be
/// short. Returns the number of chunks written.
pub fn partition_matrix<T: Copy>(
    src: &[T],
    dst: &mut [T],
    num_dims: usize,
    buffer_size: usize,
) -> Result<usize> {
    let elem_size = std::mem::size_of::<T>();
    let size = src.len() * elem_size;

    if src.len() != dst.len() {
        return Err(Error::consistency(
            "partition_matrix: source and destination lengths differ",
        ));
    }
    if src.len() % num_dims != 0 {
        return Err(Error::consistency(
            "partition_matrix: source array dimension mismatch",
        ));
    }
    if buffer_size % (num_dims * elem_size) != 0 {
        return Err(Error::alignment(
            "partition_matrix: buffer size is not a multiple of the point stride",
        ));
    }

    let dim_len = src.len() / num_dims;
    let buf_elems = buffer_size / elem_size;
    let buf_dim_len = buf_elems / num_dims;
    let num_bufs = (size + buffer_size - 1) / buffer_size;

    for b in 0..num_bufs {
        let chunk_dim_len = if buf_dim_len * (b + 1) > dim_len {
            dim_len - b * buf_dim_len
        } else {
            buf_dim_len
        };

        for v in 0..num_dims {
            let src_off = v * dim_len + b * buf_dim_len;
            let dst_off = b * buf_elems + v * chunk_dim_len;
            dst[dst_off..dst_off + chunk_dim_len]
                .copy_from_slice(&src[src_off..src_off + chunk_dim_len]);
        }
    }

    Ok(num_bufs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_and_index() {
        let mut m = Matrix::<f32>::new();
        m.resize(2, 3);
        assert_eq!(m.len(), 6);
        m.set(1, 2, 5.0);
        assert_eq!(m.get(1, 2), 5.0);
        // row 1 starts after the first full row
        assert_eq!(m.as_slice()[5], 5.0);
    }

    #[test]
    fn from_vec_checks_dimensions() {
        assert!(Matrix::from_vec(vec![0u32; 5], 2, 3).is_err());
        let m = Matrix::from_vec(vec![0u32; 6], 2, 3).unwrap();
        assert_eq!(m.rows(), 2);
        assert_eq!(m.cols(), 3);
    }

    #[test]
    fn partition_two_features() {
        // F = 2, N = 6, buffer of 4 floats -> 2 points per chunk.
        let src: Vec<f32> = vec![
            0.0, 1.0, 2.0, 3.0, 4.0, 5.0, // feature 0
            10.0, 11.0, 12.0, 13.0, 14.0, 15.0, // feature 1
        ];
        let mut dst = vec![0.0f32; src.len()];
        let n = partition_matrix(&src, &mut dst, 2, 4 * 4).unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            dst,
            vec![
                0.0, 1.0, 10.0, 11.0, //
                2.0, 3.0, 12.0, 13.0, //
                4.0, 5.0, 14.0, 15.0,
            ]
        );
    }

    #[test]
    fn partition_short_tail() {
        // F = 1, N = 5, buffer of 2 elements: final chunk is short.
        let src: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let mut dst = vec![0.0f32; 5];
        let n = partition_matrix(&src, &mut dst, 1, 2 * 4).unwrap();
        assert_eq!(n, 3);
        assert_eq!(dst, src);
    }

    #[test]
    fn partition_rejects_misaligned_buffer() {
        let src = vec![0.0f32; 6];
        let mut dst = vec![0.0f32; 6];
        // 2 features, buffer of 6 bytes: not a multiple of 8.
        assert!(partition_matrix(&src, &mut dst, 2, 6).is_err());
    }
}
