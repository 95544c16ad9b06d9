use std::time::Instant;

use serde::Serialize;

/// Latency summary for one profiled path, in nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileReport {
    pub label: String,
    pub iterations: usize,
    pub mean_ns: u128,
    pub p50_ns: u128,
    pub p95_ns: u128,
    pub p99_ns: u128,
}

/// Runs `op` `prerun` times untimed, then `iterations` times timed with a
/// `sync` after each call so device work is included in the sample.
pub fn profile_operation<E, S, F>(
    label: &str,
    prerun: usize,
    iterations: usize,
    mut sync: S,
    mut op: F,
) -> Result<ProfileReport, E>
where
    S: FnMut() -> Result<(), E>,
    F: FnMut() -> Result<(), E>,
{
    for _ in 0..prerun {
        op()?;
    }
    sync()?;

    let mut samples = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let started = Instant::now();
        op()?;
        sync()?;
        samples.push(started.elapsed().as_nanos());
    }
    samples.sort_unstable();

    let mean_ns = if samples.is_empty() {
        0
    } else {
        samples.iter().sum::<u128>() / samples.len() as u128
    };
    Ok(ProfileReport {
        label: label.to_string(),
        iterations,
        mean_ns,
        p50_ns: percentile(&samples, 50),
        p95_ns: percentile(&samples, 95),
        p99_ns: percentile(&samples, 99),
    })
}

fn percentile(samples: &[u128], p: usize) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let clamped = p.min(100);
    let idx = ((samples.len() - 1) * clamped) / 100;
    samples[idx]
}
