//! Blending weights for overlapping patches.
//!
//! The map is the outer product of a Hann window with itself, floored at
//! `epsilon` both before and after the product, so every pixel of a patch
//! contributes at least `epsilon`, including its border and corners.
//! Wherever the plain product `w_i * w_j` falls below `epsilon` the map is
//! flat, so it is not bit-compatible with an unfloored `outer(w, w)` map.

use std::sync::Arc;

use dashmap::DashMap;
use ndarray::{Array1, Array3, ArrayView3, Axis};
use tracing::debug;

use crate::error::TileError;
use crate::types::validate_epsilon;

/// Symmetric Hann window: `0.5 - 0.5 * cos(2πi / (n - 1))`.
///
/// Zero at both ends, 1.0 at the center for odd `n`. A single-sample window is `[1.0]`.
pub fn hann_window(n: usize) -> Array1<f32> {
    if n == 1 {
        return Array1::ones(1);
    }
    let denom = (n - 1) as f64;
    Array1::from_iter((0..n).map(|i| {
        // Evaluate on the nearer half so the window is bit-exact under reversal.
        let k = i.min(n - 1 - i);
        let phase = 2.0 * std::f64::consts::PI * k as f64 / denom;
        (0.5 - 0.5 * phase.cos()) as f32
    }))
}

/// Read-only `P x P x 1` blending weights.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMap {
    weights: Array3<f32>,
    epsilon: f32,
}

impl WeightMap {
    pub fn patch_size(&self) -> usize {
        self.weights.dim().0
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.weights.view()
    }
}

/// Build the `patch_size` blending map with every weight in `[epsilon, 1.0]`.
pub fn weight_map(patch_size: usize, epsilon: f32) -> Result<WeightMap, TileError> {
    if patch_size == 0 {
        return Err(TileError::InvalidPatchSize(patch_size));
    }
    validate_epsilon(epsilon)?;

    let window = hann_window(patch_size).mapv(|w| w.max(epsilon));
    let column = window.view().insert_axis(Axis(1));
    let row = window.view().insert_axis(Axis(0));
    let outer = (&column * &row).mapv_into(|w| w.max(epsilon));

    Ok(WeightMap {
        weights: outer.insert_axis(Axis(2)),
        epsilon,
    })
}

/// Process-wide memo of weight maps keyed by patch size and epsilon.
///
/// Constructed and cleared explicitly by its owner; handing out `Arc`s keeps
/// maps alive for in-flight merges even after [`WeightMapCache::clear`].
#[derive(Debug, Default)]
pub struct WeightMapCache {
    maps: DashMap<(usize, u32), Arc<WeightMap>>,
}

impl WeightMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, patch_size: usize, epsilon: f32) -> Result<Arc<WeightMap>, TileError> {
        let key = (patch_size, epsilon.to_bits());
        if let Some(map) = self.maps.get(&key) {
            return Ok(Arc::clone(map.value()));
        }

        let map = Arc::new(weight_map(patch_size, epsilon)?);
        debug!(patch_size, epsilon, "Cached new weight map");
        Ok(Arc::clone(self.maps.entry(key).or_insert(map).value()))
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn clear(&self) {
        self.maps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    #[test]
    fn test_hann_window_endpoints_and_peak() {
        let w = hann_window(5);
        let expected = [0.0, 0.5, 1.0, 0.5, 0.0];
        for (got, want) in w.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{w:?}");
        }
    }

    #[test]
    fn test_hann_window_single_sample() {
        assert_eq!(hann_window(1).to_vec(), vec![1.0]);
        assert_eq!(hann_window(2).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_weight_map_shape_and_peak() {
        let map = weight_map(9, 0.05).unwrap();
        assert_eq!(map.view().dim(), (9, 9, 1));
        assert_eq!(map.patch_size(), 9);
        assert!((map.view()[[4, 4, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(map.view()[[0, 0, 0]], 0.05);
        assert_eq!(map.view()[[0, 4, 0]], 0.05);
    }

    #[test]
    fn test_weight_map_is_symmetric_and_floored() {
        for patch_size in [1, 2, 3, 8, 17, 64, 224] {
            let map = weight_map(patch_size, 0.05).unwrap();
            let w = map.view();
            let flipped_rows = w.slice(s![..;-1, .., ..]);
            let flipped_cols = w.slice(s![.., ..;-1, ..]);
            assert_eq!(w, flipped_rows, "row symmetry for {patch_size}");
            assert_eq!(w, flipped_cols, "column symmetry for {patch_size}");
            assert!(w.iter().all(|&v| (0.05..=1.0).contains(&v)));
        }
    }

    #[test]
    fn test_weight_map_rejects_bad_input() {
        assert_eq!(weight_map(0, 0.05), Err(TileError::InvalidPatchSize(0)));
        assert!(weight_map(8, 0.0).is_err());
        assert!(weight_map(8, -0.1).is_err());
    }

    #[test]
    fn test_weight_map_is_deterministic() {
        assert_eq!(weight_map(31, 0.1).unwrap(), weight_map(31, 0.1).unwrap());
    }

    #[test]
    fn test_cache_reuses_and_clears() {
        let cache = WeightMapCache::new();
        assert!(cache.is_empty());

        let first = cache.get(16, 0.05).unwrap();
        let second = cache.get(16, 0.05).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other_eps = cache.get(16, 0.1).unwrap();
        assert!(!Arc::ptr_eq(&first, &other_eps));
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
        // Outstanding handles survive the clear.
        assert_eq!(first.patch_size(), 16);
        let rebuilt = cache.get(16, 0.05).unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(*first, *rebuilt);
    }

    #[test]
    fn test_cache_does_not_store_failures() {
        let cache = WeightMapCache::new();
        assert!(cache.get(0, 0.05).is_err());
        assert!(cache.is_empty());
    }
}
