//! Mergeable sketches backing the approximate aggregations: a merging
//! quantile digest for `percentiles` and a dense HyperLogLog for
//! `cardinality`. Both merge deterministically and serialize for RPC.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const DEFAULT_CENTROIDS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Merging-digest style quantile sketch: centroids kept sorted by mean,
/// compressed so no centroid exceeds `count / max_centroids` weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileSketch {
    centroids: Vec<Centroid>,
    count: f64,
    min: f64,
    max: f64,
    max_centroids: usize,
}

impl Default for QuantileSketch {
    fn default() -> Self {
        Self::new()
    }
}

impl QuantileSketch {
    pub fn new() -> Self {
        Self {
            centroids: Vec::new(),
            count: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            max_centroids: DEFAULT_CENTROIDS,
        }
    }

    pub fn add(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.centroids.push(Centroid {
            mean: value,
            weight: 1.0,
        });
        self.count += 1.0;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.centroids.len() > self.max_centroids * 2 {
            self.compress();
        }
    }

    pub fn merge(&mut self, other: &QuantileSketch) {
        self.centroids.extend_from_slice(&other.centroids);
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.compress();
    }

    pub fn count(&self) -> u64 {
        self.count as u64
    }

    fn compress(&mut self) {
        if self.centroids.is_empty() {
            return;
        }
        self.centroids
            .sort_by(|a, b| a.mean.total_cmp(&b.mean).then(a.weight.total_cmp(&b.weight)));
        let cap = (self.count / self.max_centroids as f64).max(1.0);
        let mut merged: Vec<Centroid> = Vec::with_capacity(self.max_centroids + 1);
        for c in self.centroids.drain(..) {
            match merged.last_mut() {
                Some(last) if last.weight + c.weight <= cap => {
                    let w = last.weight + c.weight;
                    last.mean = (last.mean * last.weight + c.mean * c.weight) / w;
                    last.weight = w;
                }
                _ => merged.push(c),
            }
        }
        self.centroids = merged;
    }

    /// Estimate the q-th quantile, `q` in [0, 1]. Returns `None` on an
    /// empty sketch.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0.0 {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        if q == 0.0 {
            return Some(self.min);
        }
        if q == 1.0 {
            return Some(self.max);
        }
        let mut sorted = self.centroids.clone();
        sorted.sort_by(|a, b| a.mean.total_cmp(&b.mean));
        let target = q * self.count;
        let mut cumulative = 0.0;
        for (i, c) in sorted.iter().enumerate() {
            let next = cumulative + c.weight;
            if target <= next {
                // Interpolate toward the neighbouring centroid.
                let within = (target - cumulative) / c.weight;
                let lo = if i == 0 { self.min } else { sorted[i - 1].mean };
                let hi = if i + 1 == sorted.len() {
                    self.max
                } else {
                    sorted[i + 1].mean
                };
                let left = (lo + c.mean) / 2.0;
                let right = (c.mean + hi) / 2.0;
                return Some(left + (right - left) * within);
            }
            cumulative = next;
        }
        Some(self.max)
    }
}

const HLL_PRECISION: u32 = 11;
const HLL_REGISTERS: usize = 1 << HLL_PRECISION;

/// Dense HyperLogLog over a stable 64-bit hash, so sketches built on
/// different nodes merge into consistent estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardinalitySketch {
    registers: Vec<u8>,
}

impl Default for CardinalitySketch {
    fn default() -> Self {
        Self::new()
    }
}

impl CardinalitySketch {
    pub fn new() -> Self {
        Self {
            registers: vec![0; HLL_REGISTERS],
        }
    }

    pub fn add_bytes(&mut self, value: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(value);
        let digest = hasher.finalize();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        self.add_hash(u64::from_be_bytes(raw));
    }

    pub fn add_str(&mut self, value: &str) {
        self.add_bytes(value.as_bytes());
    }

    fn add_hash(&mut self, hash: u64) {
        let idx = (hash >> (64 - HLL_PRECISION)) as usize;
        let rest = hash << HLL_PRECISION;
        let rho = (rest.leading_zeros() + 1).min(64 - HLL_PRECISION + 1) as u8;
        if rho > self.registers[idx] {
            self.registers[idx] = rho;
        }
    }

    pub fn merge(&mut self, other: &CardinalitySketch) {
        for (r, o) in self.registers.iter_mut().zip(&other.registers) {
            if *o > *r {
                *r = *o;
            }
        }
    }

    pub fn estimate(&self) -> u64 {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        let raw = alpha * m * m / sum;
        let zeros = self.registers.iter().filter(|&&r| r == 0).count();
        if raw <= 2.5 * m && zeros > 0 {
            // Linear counting in the small range.
            (m * (m / zeros as f64).ln()).round() as u64
        } else {
            raw.round() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_small_exactish() {
        let mut sketch = QuantileSketch::new();
        for v in 1..=100 {
            sketch.add(v as f64);
        }
        let median = sketch.quantile(0.5).unwrap();
        assert!((median - 50.0).abs() < 5.0, "median {}", median);
        assert_eq!(sketch.quantile(0.0), Some(1.0));
        assert_eq!(sketch.quantile(1.0), Some(100.0));
    }

    #[test]
    fn test_quantile_merge_matches_union() {
        let mut left = QuantileSketch::new();
        let mut right = QuantileSketch::new();
        let mut whole = QuantileSketch::new();
        for v in 0..1000 {
            let x = v as f64;
            if v % 2 == 0 {
                left.add(x);
            } else {
                right.add(x);
            }
            whole.add(x);
        }
        left.merge(&right);
        let merged = left.quantile(0.9).unwrap();
        let direct = whole.quantile(0.9).unwrap();
        assert!(
            (merged - direct).abs() < 50.0,
            "merged {} direct {}",
            merged,
            direct
        );
        assert_eq!(left.count(), 1000);
    }

    #[test]
    fn test_empty_quantile() {
        assert_eq!(QuantileSketch::new().quantile(0.5), None);
    }

    #[test]
    fn test_nan_ignored() {
        let mut sketch = QuantileSketch::new();
        sketch.add(f64::NAN);
        assert_eq!(sketch.count(), 0);
    }

    #[test]
    fn test_cardinality_accuracy() {
        let mut sketch = CardinalitySketch::new();
        for i in 0..10_000 {
            sketch.add_str(&format!("value-{}", i));
        }
        let estimate = sketch.estimate() as f64;
        assert!(
            (estimate - 10_000.0).abs() / 10_000.0 < 0.1,
            "estimate {}",
            estimate
        );
    }

    #[test]
    fn test_cardinality_merge() {
        let mut a = CardinalitySketch::new();
        let mut b = CardinalitySketch::new();
        for i in 0..500 {
            a.add_str(&format!("a-{}", i));
            b.add_str(&format!("b-{}", i));
        }
        // Shared values must not double-count.
        for i in 0..500 {
            b.add_str(&format!("a-{}", i));
        }
        a.merge(&b);
        let estimate = a.estimate() as f64;
        assert!(
            (estimate - 1000.0).abs() / 1000.0 < 0.1,
            "estimate {}",
            estimate
        );
    }

    #[test]
    fn test_cardinality_duplicates() {
        let mut sketch = CardinalitySketch::new();
        for _ in 0..1000 {
            sketch.add_str("same");
        }
        assert_eq!(sketch.estimate(), 1);
    }
}
