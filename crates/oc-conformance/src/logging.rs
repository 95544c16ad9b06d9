use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

pub const LOG_SCHEMA_VERSION: &str = "oc-conformance-log-v1";

/// One JSONL forensics record per (device, dtype, case).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u64,
    pub suite_id: &'static str,
    pub scenario_id: String,
    pub case_name: String,
    pub device: &'static str,
    pub dtype: &'static str,
    pub inplace: &'static str,
    pub seed: u64,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: &'static str,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

const ENVELOPE_KEYS: [&str; 14] = [
    "schema_version",
    "ts_unix_ms",
    "suite_id",
    "scenario_id",
    "case_name",
    "device",
    "dtype",
    "inplace",
    "seed",
    "env_fingerprint",
    "artifact_refs",
    "replay_command",
    "outcome",
    "reason_code",
];

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &'static str,
        case_name: &str,
        device: &'static str,
        dtype: &'static str,
        inplace: &'static str,
        seed: u64,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &'static str,
        reason_code: &str,
    ) -> Self {
        let scenario_id = format!("{suite_id}/{device}/{dtype}:{case_name}");
        let env_fingerprint = format!(
            "det64:{:016x}",
            det_seed(&[
                LOG_SCHEMA_VERSION,
                suite_id,
                std::env::consts::OS,
                std::env::consts::ARCH,
                env!("CARGO_PKG_VERSION"),
            ])
        );
        Self {
            schema_version: LOG_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            suite_id,
            scenario_id,
            case_name: case_name.to_string(),
            device,
            dtype,
            inplace,
            seed,
            env_fingerprint,
            artifact_refs,
            replay_command,
            outcome,
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    /// Extra keys are flattened into the record; keys that would shadow the
    /// envelope are dropped.
    #[must_use]
    pub fn with_extra_fields(mut self, mut extra_fields: BTreeMap<String, Value>) -> Self {
        for key in ENVELOPE_KEYS {
            extra_fields.remove(key);
        }
        self.extra_fields = extra_fields;
        self
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

/// FNV-1a over the parts, with a separator byte between them.
#[must_use]
pub fn det_seed(parts: &[&str]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for part in parts {
        for byte in part.as_bytes().iter().copied().chain(std::iter::once(0xff)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}
