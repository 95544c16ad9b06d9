use std::collections::BTreeMap;

use oc_core::DType;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    #[must_use]
    pub const fn new(atol: f64, rtol: f64) -> Self {
        Self { atol, rtol }
    }

    /// Largest admissible `|actual - expected|` for this expected value.
    #[must_use]
    pub fn bound(self, expected: f64) -> f64 {
        self.atol + self.rtol * expected.abs()
    }

    /// `|actual - expected| <= atol + rtol * |expected|`, with exactly equal
    /// values (same-signed infinities included) always passing. NaN on either
    /// side never passes.
    #[must_use]
    pub fn accepts(self, actual: f64, expected: f64) -> bool {
        actual == expected || (actual - expected).abs() <= self.bound(expected)
    }
}

pub const FALLBACK_TOLERANCE: Tolerance = Tolerance::new(0.0, 1e-3);

/// Per-dtype comparison thresholds, read-only once a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct TolerancePolicy {
    by_dtype: BTreeMap<DType, Tolerance>,
}

impl Default for TolerancePolicy {
    fn default() -> Self {
        Self {
            by_dtype: BTreeMap::from([
                (DType::F16, Tolerance::new(1e-3, 1e-3)),
                (DType::F32, Tolerance::new(1e-6, 1e-6)),
                (DType::BF16, Tolerance::new(1e-3, 1e-3)),
            ]),
        }
    }
}

impl TolerancePolicy {
    #[must_use]
    pub fn tolerance_for(&self, dtype: DType) -> Tolerance {
        self.by_dtype
            .get(&dtype)
            .copied()
            .unwrap_or(FALLBACK_TOLERANCE)
    }
}
