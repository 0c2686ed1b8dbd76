//! Padding and seeding helpers
//!
//! Masks follow one convention throughout the crate: a non-zero entry marks
//! a padded position, zero marks a valid one.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `N` seeds drawn from a generator seeded with `seed`.
///
/// Constructors hand one child seed to each sub-layer, so no two parameter
/// tensors share a random stream.
pub fn child_seeds<const N: usize>(seed: u64) -> [u64; N] {
    let mut rng = StdRng::seed_from_u64(seed);
    std::array::from_fn(|_| rng.random())
}

/// `n` seeds drawn from a generator seeded with `seed`.
pub fn seed_stream(seed: u64, n: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.random()).collect()
}

/// Stack variable-length groups of rows into one zero-padded tensor.
///
/// Each part has shape `[n_i, ...]`; the result is
/// `[parts.len(), max(n_i), ...]` with part `i` in slot `i`.
///
/// # Panics
///
/// Panics if `parts` is empty or the trailing dimensions differ.
///
/// # Example
///
/// ```rust
/// use graphtrans::{utils::pad, Tensor};
///
/// let a = Tensor::new(vec![1.0, 2.0], vec![1, 2]);
/// let b = Tensor::new(vec![3.0, 4.0, 5.0, 6.0], vec![2, 2]);
/// let padded = pad(&[a, b]);
/// assert_eq!(padded.shape, vec![2, 2, 2]);
/// assert_eq!(padded.data, vec![1.0, 2.0, 0.0, 0.0, 3.0, 4.0, 5.0, 6.0]);
/// ```
pub fn pad(parts: &[Tensor]) -> Tensor {
    assert!(!parts.is_empty(), "pad needs at least one part");
    let trailing = parts[0].shape[1..].to_vec();
    let width: usize = trailing.iter().product();
    let max_len = parts.iter().map(|p| p.shape[0]).max().unwrap_or(0);

    let mut data = vec![0.0; parts.len() * max_len * width];
    for (i, part) in parts.iter().enumerate() {
        assert_eq!(
            part.shape[1..],
            trailing[..],
            "All parts must share trailing dimensions"
        );
        let offset = i * max_len * width;
        data[offset..offset + part.data.len()].copy_from_slice(&part.data);
    }

    let mut shape = vec![parts.len(), max_len];
    shape.extend(trailing);
    Tensor::new(data, shape)
}

/// Number of valid (zero) positions in each row of a `[batch, len]` mask.
pub fn lengths_from_mask(mask: &Tensor) -> Vec<usize> {
    let len = mask.last_dim();
    if len == 0 {
        return vec![0; mask.shape.first().copied().unwrap_or(0)];
    }
    mask.data
        .chunks(len)
        .map(|row| row.iter().filter(|&&m| m == 0.0).count())
        .collect()
}

/// Positions of the valid (zero) entries in row `row` of a `[batch, len]` mask.
pub fn valid_rows(mask: &Tensor, row: usize) -> Vec<usize> {
    let len = mask.last_dim();
    mask.data[row * len..(row + 1) * len]
        .iter()
        .enumerate()
        .filter(|(_, &m)| m == 0.0)
        .map(|(i, _)| i)
        .collect()
}
