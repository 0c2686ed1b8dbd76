//! Tensor Operations
//!
//! A minimal dense tensor for the encoder layers. Data is a flat `Vec<f32>`
//! in row-major order with shape and stride information.
//!
//! Besides the usual arithmetic, the graph layers need row-level indexing:
//! gathering node rows (`index_select`), scattering gradients back
//! (`index_add_rows`), and splitting rows into variable-length groups
//! (`split_rows`).
//!
//! ## Example
//!
//! ```rust
//! use graphtrans::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! assert_eq!(a.matmul(&b).shape, vec![2, 2]);
//!
//! let rows = a.index_select(&[1, 1, 0]);
//! assert_eq!(rows.shape, vec![3, 3]);
//! assert_eq!(rows.data[0], 4.0);
//! ```
//!
//! Element-wise and per-row work runs in parallel via Rayon.

use rayon::prelude::*;

/// A multi-dimensional array of `f32` values
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with `value`
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the last dimension (1 for a scalar)
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of elements in one slice along dimension 0
    pub fn row_width(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    fn normalize_axis(&self, axis: isize) -> usize {
        let ndim = self.shape.len() as isize;
        let pos = if axis < 0 { ndim + axis } else { axis };
        assert!(
            pos >= 0 && pos < ndim,
            "Axis {} out of range for shape {:?}",
            axis,
            self.shape
        );
        pos as usize
    }

    /// Inner loop written so LLVM can auto-vectorize it:
    /// `result[j] += a_val * b[j]`
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication
    ///
    /// - `[m, k] @ [k, n] -> [m, n]`
    /// - `[b, h, m, k] @ [b, h, k, n] -> [b, h, m, n]` (batched, one product
    ///   per `(b, h)` pair, used by the attention head)
    ///
    /// # Panics
    ///
    /// Panics if the inner dimensions disagree or the ranks are unsupported
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        if self.shape.len() == 2 && other.shape.len() == 2 {
            assert_eq!(
                self.shape[1], other.shape[0],
                "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
                self.shape[0], self.shape[1], other.shape[0], other.shape[1]
            );

            let m = self.shape[0];
            let n = other.shape[1];
            let k = self.shape[1];

            if m * n * k >= 1_000 {
                return self.matmul_parallel_blocked(other, m, n, k);
            }

            let mut result = vec![0.0; m * n];
            for i in 0..m {
                let row = &mut result[i * n..(i + 1) * n];
                for l in 0..k {
                    Self::matmul_inner_simd(
                        self.data[i * k + l],
                        &other.data[l * n..(l + 1) * n],
                        row,
                    );
                }
            }
            return Tensor::new(result, vec![m, n]);
        }

        if self.shape.len() == 4 && other.shape.len() == 4 {
            let batch = self.shape[0];
            let n_heads = self.shape[1];
            let m = self.shape[2];
            let k = self.shape[3];
            let n = other.shape[3];

            assert_eq!(
                (other.shape[0], other.shape[1], other.shape[2]),
                (batch, n_heads, k),
                "Batched matmul shapes incompatible: {:?} @ {:?}",
                self.shape,
                other.shape
            );

            let mut result = vec![0.0; batch * n_heads * m * n];
            if m * n > 0 {
                result
                    .par_chunks_mut(m * n)
                    .enumerate()
                    .for_each(|(bh, chunk)| {
                        let a = &self.data[bh * m * k..(bh + 1) * m * k];
                        let b = &other.data[bh * k * n..(bh + 1) * k * n];
                        for i in 0..m {
                            let row = &mut chunk[i * n..(i + 1) * n];
                            for l in 0..k {
                                Self::matmul_inner_simd(a[i * k + l], &b[l * n..(l + 1) * n], row);
                            }
                        }
                    });
            }
            return Tensor::new(result, vec![batch, n_heads, m, n]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    /// Parallel cache-blocked 2D matrix multiplication
    ///
    /// Output rows are processed in blocks of 8 across threads; the inner
    /// loops walk memory sequentially.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                Self::matmul_inner_simd(
                                    self.data[i * k + k_idx],
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Numerically stable softmax along the last axis
    ///
    /// ```text
    /// softmax(x)[i] = exp(x[i] - max(x)) / sum(exp(x[j] - max(x)))
    /// ```
    ///
    /// Rows are processed in parallel.
    pub fn softmax(&self, axis: isize) -> Tensor {
        let axis = self.normalize_axis(axis);
        assert_eq!(
            axis,
            self.shape.len() - 1,
            "softmax is only supported along the last axis"
        );
        let cols = self.last_dim();
        if cols == 0 || self.data.is_empty() {
            return self.clone();
        }

        let result: Vec<f32> = self
            .data
            .par_chunks(cols)
            .flat_map_iter(|row| {
                let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let exp_values: Vec<f32> = row.iter().map(|&x| (x - max).exp()).collect();
                let sum: f32 = exp_values.iter().sum();
                exp_values.into_iter().map(move |val| val / sum)
            })
            .collect();

        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise binary op with the broadcasting patterns the layers use:
    ///
    /// 1. exact match
    /// 2. `[*, n] op [n]` (bias / per-feature parameters)
    /// 3. `[*, n] op [*, 1]` (per-row statistics kept with `keepdim`)
    /// 4. `[b, s, d] op [s, d]`
    fn zip_broadcast(&self, other: &Tensor, op: &str, f: impl Fn(f32, f32) -> f32 + Sync) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last = self.last_dim();

        if other.shape.len() == 1 && other.shape[0] == last && self.shape.len() > 1 {
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i % last]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if other.shape.len() == self.shape.len()
            && other.last_dim() == 1
            && other.shape[..other.shape.len() - 1] == self.shape[..self.shape.len() - 1]
        {
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i / last]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() == 3 && other.shape.len() == 2 && self.shape[1..] == other.shape[..] {
            let inner = other.data.len();
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| f(a, other.data[i % inner]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for {}: {:?} and {:?}",
            op, self.shape, other.shape
        );
    }

    pub fn add(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "add", |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "sub", |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "mul", |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "div", |a, b| a / b)
    }

    /// Apply `f` to every element
    pub fn map(&self, f: impl Fn(f32) -> f32 + Sync + Send) -> Tensor {
        let result = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(result, self.shape.clone())
    }

    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x + scalar)
    }

    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    pub fn div_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x / scalar)
    }

    pub fn sqrt(&self) -> Tensor {
        self.map(f32::sqrt)
    }

    /// Reshape tensor to new shape; the element count must not change
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} to {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Reorder dimensions: output dimension `i` is input dimension `dims[i]`
    pub fn permute(&self, dims: &[usize]) -> Tensor {
        assert_eq!(
            dims.len(),
            self.shape.len(),
            "permute needs one entry per dimension"
        );
        let new_shape: Vec<usize> = dims.iter().map(|&d| self.shape[d]).collect();
        let src_strides: Vec<usize> = dims.iter().map(|&d| self.strides[d]).collect();
        let out_strides = Self::compute_strides(&new_shape);

        let result = (0..self.data.len())
            .into_par_iter()
            .map(|i| {
                let mut remaining = i;
                let mut src = 0;
                for (stride, src_stride) in out_strides.iter().zip(&src_strides) {
                    src += (remaining / stride) * src_stride;
                    remaining %= stride;
                }
                self.data[src]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    /// Swap two dimensions (negative indices count from the end)
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let d1 = self.normalize_axis(dim1);
        let d2 = self.normalize_axis(dim2);

        if self.shape.len() == 2 && d1 != d2 {
            let rows = self.shape[0];
            let cols = self.shape[1];
            let mut result = vec![0.0; rows * cols];
            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = self.data[i * cols + j];
                }
            }
            return Tensor::new(result, vec![cols, rows]);
        }

        let mut dims: Vec<usize> = (0..self.shape.len()).collect();
        dims.swap(d1, d2);
        self.permute(&dims)
    }

    /// Replace values where `mask` is non-zero with `value`
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Tensor {
        assert_eq!(
            self.shape, mask.shape,
            "Mask shape must match tensor shape"
        );
        let result = self
            .data
            .par_iter()
            .zip(&mask.data)
            .map(|(&x, &m)| if m != 0.0 { value } else { x })
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Mean along the last axis
    pub fn mean(&self, axis: isize, keepdim: bool) -> Tensor {
        self.reduce_last(axis, keepdim, |row| {
            row.iter().sum::<f32>() / row.len() as f32
        })
    }

    /// Biased variance along the last axis
    pub fn var(&self, axis: isize, keepdim: bool) -> Tensor {
        self.reduce_last(axis, keepdim, |row| {
            let n = row.len() as f32;
            let mean = row.iter().sum::<f32>() / n;
            row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n
        })
    }

    fn reduce_last(&self, axis: isize, keepdim: bool, f: impl Fn(&[f32]) -> f32 + Sync + Send) -> Tensor {
        let axis = self.normalize_axis(axis);
        assert_eq!(
            axis,
            self.shape.len() - 1,
            "Reductions are only supported along the last axis"
        );
        let cols = self.last_dim();
        assert!(cols > 0, "Cannot reduce over an empty axis");

        let result: Vec<f32> = self.data.par_chunks(cols).map(f).collect();

        let mut new_shape = self.shape.clone();
        if keepdim {
            if let Some(last) = new_shape.last_mut() {
                *last = 1;
            }
        } else {
            new_shape.pop();
        }
        Tensor::new(result, new_shape)
    }

    /// Sum over every dimension except the last: `[*, n] -> [n]`
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = vec![0.0; cols];
        for row in self.data.chunks(cols.max(1)) {
            for (acc, &x) in result.iter_mut().zip(row) {
                *acc += x;
            }
        }
        Tensor::new(result, vec![cols])
    }

    /// Gather slices along dimension 0
    pub fn index_select(&self, indices: &[usize]) -> Tensor {
        let width = self.row_width();
        let rows = self.shape.first().copied().unwrap_or(0);
        let mut data = Vec::with_capacity(indices.len() * width);
        for &idx in indices {
            assert!(idx < rows, "Index {} out of range for {} rows", idx, rows);
            data.extend_from_slice(&self.data[idx * width..(idx + 1) * width]);
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Tensor::new(data, shape)
    }

    /// Scatter-add `src` rows into `self`: `self[indices[i]] += src[i]`
    pub fn index_add_rows(&mut self, indices: &[usize], src: &Tensor) {
        let width = self.row_width();
        assert_eq!(src.row_width(), width, "Row widths must match for index_add_rows");
        assert_eq!(src.shape[0], indices.len(), "One source row per index");
        for (i, &idx) in indices.iter().enumerate() {
            let dst = &mut self.data[idx * width..(idx + 1) * width];
            for (d, &s) in dst.iter_mut().zip(&src.data[i * width..(i + 1) * width]) {
                *d += s;
            }
        }
    }

    /// Slice `len` entries of dimension 0 starting at `start`
    pub fn narrow_rows(&self, start: usize, len: usize) -> Tensor {
        let width = self.row_width();
        assert!(
            start + len <= self.shape[0],
            "Rows {}..{} out of range for shape {:?}",
            start,
            start + len,
            self.shape
        );
        let mut shape = self.shape.clone();
        shape[0] = len;
        Tensor::new(self.data[start * width..(start + len) * width].to_vec(), shape)
    }

    /// Split dimension 0 into consecutive groups of the given sizes
    pub fn split_rows(&self, sizes: &[usize]) -> Vec<Tensor> {
        let total: usize = sizes.iter().sum();
        assert_eq!(
            total, self.shape[0],
            "Split sizes sum to {} but tensor has {} rows",
            total, self.shape[0]
        );
        let mut start = 0;
        sizes
            .iter()
            .map(|&len| {
                let part = self.narrow_rows(start, len);
                start += len;
                part
            })
            .collect()
    }
}
