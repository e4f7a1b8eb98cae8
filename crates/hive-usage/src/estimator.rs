//! Compressed-size estimation.
//!
//! The buffer needs a byte estimate before it compresses anything, to decide
//! whether a flush must be split. In fixed mode the estimate is
//! `units * default_bytes_per_unit`. In dynamic mode the bytes-per-unit ratio
//! is learned from every validated flush with an exponential moving average:
//!
//! ```text
//! ratio' = ratio + ALPHA * (observed - ratio)
//! ```

/// Smoothing weight given to each new observation.
const ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct SizeEstimator {
    dynamic: bool,
    bytes_per_unit: f64,
}

impl SizeEstimator {
    pub fn new(default_bytes_per_unit: usize, dynamic: bool) -> Self {
        let seed = default_bytes_per_unit.max(1) as f64;
        Self {
            dynamic,
            bytes_per_unit: seed,
        }
    }

    /// Estimated compressed bytes for `units` size units.
    pub fn estimate(&self, units: usize) -> usize {
        (units as f64 * self.bytes_per_unit).ceil() as usize
    }

    /// Feed back the real compressed size of a payload of `units` units.
    /// No-op in fixed mode or for empty payloads.
    pub fn teach(&mut self, actual_bytes: usize, units: usize) {
        if !self.dynamic || actual_bytes == 0 || units == 0 {
            return;
        }
        let observed = actual_bytes as f64 / units as f64;
        self.bytes_per_unit += ALPHA * (observed - self.bytes_per_unit);
    }

    pub fn bytes_per_unit(&self) -> f64 {
        self.bytes_per_unit
    }
}
