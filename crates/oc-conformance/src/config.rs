use std::path::PathBuf;

use oc_core::{DType, Device};

use crate::cases::DEFAULT_DTYPES;

pub const ENV_SEED: &str = "OC_CONFORMANCE_SEED";
pub const ENV_DEBUG: &str = "OC_CONFORMANCE_DEBUG";
pub const ENV_PROFILE: &str = "OC_CONFORMANCE_PROFILE";

pub const DEFAULT_SEED: u64 = 0x5eed;
pub const DEFAULT_NUM_PRERUN: usize = 10;
pub const DEFAULT_NUM_ITERATIONS: usize = 1000;

/// Everything a conformance run needs, passed explicitly to every entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub devices: Vec<Device>,
    pub dtypes: Vec<DType>,
    /// Embed full actual/expected tensors in logs and mismatch reports.
    pub debug: bool,
    pub profile: bool,
    pub num_prerun: usize,
    pub num_iterations: usize,
    pub seed: u64,
    pub forensics_path: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            devices: vec![Device::Cpu],
            dtypes: DEFAULT_DTYPES.to_vec(),
            debug: false,
            profile: false,
            num_prerun: DEFAULT_NUM_PRERUN,
            num_iterations: DEFAULT_NUM_ITERATIONS,
            seed: DEFAULT_SEED,
            forensics_path: None,
        }
    }
}

impl HarnessConfig {
    /// Defaults overlaid with the `OC_CONFORMANCE_*` environment variables.
    pub fn from_env() -> Result<Self, String> {
        Self::default().with_env_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_env_lookup<F>(mut self, lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_SEED) {
            self.seed = parse_seed(&raw).map_err(|error| format!("{ENV_SEED}: {error}"))?;
        }
        if let Some(raw) = lookup(ENV_DEBUG) {
            self.debug = parse_flag(&raw).map_err(|error| format!("{ENV_DEBUG}: {error}"))?;
        }
        if let Some(raw) = lookup(ENV_PROFILE) {
            self.profile = parse_flag(&raw).map_err(|error| format!("{ENV_PROFILE}: {error}"))?;
        }
        Ok(self)
    }
}

/// Decimal or `0x`-prefixed hexadecimal seed.
pub fn parse_seed(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|error| format!("invalid seed '{raw}': {error}"))
}

pub fn parse_flag(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!("invalid boolean '{raw}'")),
    }
}

/// Comma-separated dtype names, e.g. `F16,BF16`.
pub fn parse_dtype_list(raw: &str) -> Result<Vec<DType>, String> {
    let dtypes = raw
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            DType::from_name(part).ok_or_else(|| {
                format!("unsupported dtype '{}'; expected F16|F32|BF16|F64", part.trim())
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if dtypes.is_empty() {
        return Err("dtype list must not be empty".to_string());
    }
    Ok(dtypes)
}
