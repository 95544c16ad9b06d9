use std::fmt;

use oc_core::DType;
use serde::Serialize;

use crate::tolerance::Tolerance;

pub const MAX_REPORTED_MISMATCHES: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MismatchSample {
    pub index: usize,
    pub actual: f64,
    pub expected: f64,
    pub abs_diff: f64,
    pub bound: f64,
}

/// Diagnostic for a failed comparison. `samples` holds the first mismatching
/// elements, or every one of them in debug mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MismatchReport {
    pub dtype: &'static str,
    pub atol: f64,
    pub rtol: f64,
    pub total: usize,
    pub mismatched: usize,
    pub max_abs_diff: f64,
    pub max_rel_diff: f64,
    pub actual_len: usize,
    pub expected_len: usize,
    pub samples: Vec<MismatchSample>,
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.actual_len != self.expected_len {
            return write!(
                f,
                "{} result has {} elements, reference has {}",
                self.dtype, self.actual_len, self.expected_len
            );
        }
        write!(
            f,
            "{}/{} {} elements outside atol={:e} rtol={:e} (max |diff|={:e}, max rel={:e})",
            self.mismatched,
            self.total,
            self.dtype,
            self.atol,
            self.rtol,
            self.max_abs_diff,
            self.max_rel_diff
        )?;
        for sample in &self.samples {
            write!(
                f,
                "\n  [{}] actual={} expected={} |diff|={:e} bound={:e}",
                sample.index, sample.actual, sample.expected, sample.abs_diff, sample.bound
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompareSummary {
    pub total: usize,
    pub max_abs_diff: f64,
    pub atol: f64,
    pub rtol: f64,
}

/// Element-wise `|a - e| <= atol + rtol * |e|` over the whole tensor.
pub fn compare(
    actual: &[f64],
    expected: &[f64],
    dtype: DType,
    tolerance: Tolerance,
    debug: bool,
) -> Result<CompareSummary, Box<MismatchReport>> {
    let mut report = MismatchReport {
        dtype: dtype.name(),
        atol: tolerance.atol,
        rtol: tolerance.rtol,
        total: expected.len(),
        mismatched: 0,
        max_abs_diff: 0.0,
        max_rel_diff: 0.0,
        actual_len: actual.len(),
        expected_len: expected.len(),
        samples: Vec::new(),
    };
    if actual.len() != expected.len() {
        report.mismatched = actual.len().abs_diff(expected.len());
        return Err(Box::new(report));
    }

    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        let abs_diff = if a == e { 0.0 } else { (a - e).abs() };
        if abs_diff.is_nan() || abs_diff > report.max_abs_diff {
            report.max_abs_diff = abs_diff;
        }
        if e.abs() > 0.0 {
            report.max_rel_diff = report.max_rel_diff.max(abs_diff / e.abs());
        }
        if tolerance.accepts(*a, *e) {
            continue;
        }
        report.mismatched += 1;
        if debug || report.samples.len() < MAX_REPORTED_MISMATCHES {
            report.samples.push(MismatchSample {
                index,
                actual: *a,
                expected: *e,
                abs_diff,
                bound: tolerance.bound(*e),
            });
        }
    }

    if report.mismatched > 0 {
        return Err(Box::new(report));
    }
    Ok(CompareSummary {
        total: report.total,
        max_abs_diff: report.max_abs_diff,
        atol: tolerance.atol,
        rtol: tolerance.rtol,
    })
}
