#![forbid(unsafe_code)]

mod cases;
mod compare;
mod config;
mod legality;
mod logging;
mod oracle;
mod profile;
mod protocol;
mod tensor;
mod tolerance;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use oc_core::{DType, Device};
use oc_device::{DeviceError, DeviceHandle, Stream};
use oc_dispatch::GeluBackwardLibrary;
use oc_runtime::{EvidenceEntry, SessionContext};
use serde::Serialize;
use serde_json::{Value, json};

pub use cases::{
    BaseCase, DEFAULT_DTYPES, DEFAULT_INPLACE_MODES, InplaceMode, TestCase, default_base_cases,
    default_cases, generate_cases,
};
pub use compare::{
    CompareSummary, MAX_REPORTED_MISMATCHES, MismatchReport, MismatchSample, compare,
};
pub use config::{
    DEFAULT_NUM_ITERATIONS, DEFAULT_NUM_PRERUN, DEFAULT_SEED, ENV_DEBUG, ENV_PROFILE, ENV_SEED,
    HarnessConfig, parse_dtype_list, parse_flag, parse_seed,
};
pub use legality::{Operand, SkipReason, check_broadcast_operands, check_inplace_strides};
pub use logging::{LOG_SCHEMA_VERSION, StructuredCaseLog, det_seed};
pub use oracle::{OracleError, gelu_backward_reference, reduce_to_destination};
pub use profile::{ProfileReport, profile_operation};
pub use protocol::{CaseContext, CaseError, CaseOutcome, CaseRun, LifecycleStage, run_case};
pub use tensor::{CaseOperands, TestTensor};
pub use tolerance::{FALLBACK_TOLERANCE, Tolerance, TolerancePolicy};

pub const SUITE_ID: &str = "gelu_backward";

#[derive(Debug, Clone, PartialEq)]
pub struct GeluBackwardCaseReport {
    pub name: String,
    pub case_index: usize,
    pub device: Device,
    pub dtype: DType,
    pub inplace: InplaceMode,
    pub seed: u64,
    pub outcome: CaseOutcome,
    pub forensic_log: StructuredCaseLog,
}

impl GeluBackwardCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(self.outcome, CaseOutcome::Passed(_))
    }

    #[must_use]
    pub fn skipped(&self) -> bool {
        matches!(self.outcome, CaseOutcome::Skipped(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeluBackwardReport {
    pub suite: &'static str,
    pub device: &'static str,
    pub cases_total: usize,
    pub cases_executed: usize,
    pub cases_passed: usize,
    pub cases_skipped: usize,
    /// Barriers requested on the device handle over the whole run.
    pub synchronizations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForensicsSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub skipped_entries: usize,
}

/// A run-stopping failure. The first one aborts the whole run.
#[derive(Debug, Clone, PartialEq)]
pub enum HarnessError {
    Handle {
        device: Device,
        error: DeviceError,
    },
    Case {
        label: String,
        device: Device,
        dtype: DType,
        seed: u64,
        error: CaseError,
    },
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle { device, error } => write!(
                f,
                "cannot open {} handle: {error} ({})",
                device.name(),
                error.status()
            ),
            Self::Case {
                label,
                device,
                dtype,
                seed,
                error,
            } => write!(
                f,
                "{} {} [{label}] seed={seed:#x}: {error}",
                device.name(),
                dtype.name()
            ),
        }
    }
}

impl std::error::Error for HarnessError {}

/// Per-case data seed, stable for a given run seed and case coordinates.
#[must_use]
pub fn case_seed(run_seed: u64, device: Device, dtype: DType, case_index: usize) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let words = [
        run_seed,
        device as u64,
        dtype as u64,
        u64::try_from(case_index).unwrap_or(u64::MAX),
    ];
    for byte in words.iter().flat_map(|word| word.to_le_bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Runs the default case table on one device, dtypes outer and cases inner.
pub fn run_gelu_backward_conformance<L: GeluBackwardLibrary>(
    library: &L,
    device: Device,
    config: &HarnessConfig,
) -> Result<(GeluBackwardReport, Vec<GeluBackwardCaseReport>), HarnessError> {
    run_gelu_backward_cases(library, device, config, &default_cases())
}

pub fn run_gelu_backward_cases<L: GeluBackwardLibrary>(
    library: &L,
    device: Device,
    config: &HarnessConfig,
    cases: &[TestCase],
) -> Result<(GeluBackwardReport, Vec<GeluBackwardCaseReport>), HarnessError> {
    let handle =
        DeviceHandle::create(device).map_err(|error| HarnessError::Handle { device, error })?;
    let stream = Stream::new(device);
    let tolerances = TolerancePolicy::default();
    let ctx = CaseContext {
        config,
        tolerances: &tolerances,
        handle: &handle,
        stream: Some(&stream),
    };
    let mut session = SessionContext::new(device);

    let mut case_reports = Vec::with_capacity(config.dtypes.len() * cases.len());
    for dtype in config.dtypes.iter().copied() {
        for case in cases {
            let seed = case_seed(config.seed, device, dtype, case.index);
            let evidence_start = session.ledger().len();
            let outcome = run_case(library, ctx, &mut session, case, dtype, seed).map_err(
                |error| HarnessError::Case {
                    label: case.label(),
                    device,
                    dtype,
                    seed,
                    error,
                },
            )?;
            let evidence = &session.ledger().entries()[evidence_start..];
            case_reports.push(case_report(
                case, device, dtype, seed, outcome, evidence, config,
            ));
        }
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(|case| case.passed()));
    let cases_skipped = case_reports.iter().filter(|case| case.skipped()).count();
    let report = GeluBackwardReport {
        suite: SUITE_ID,
        device: device.name(),
        cases_total,
        cases_executed: cases_total - cases_skipped,
        cases_passed,
        cases_skipped,
        synchronizations: handle.sync_count(),
    };
    Ok((report, case_reports))
}

/// Every configured device in order; stops at the first failure.
pub fn run_gelu_backward_matrix<L: GeluBackwardLibrary>(
    library: &L,
    config: &HarnessConfig,
) -> Result<Vec<(GeluBackwardReport, Vec<GeluBackwardCaseReport>)>, HarnessError> {
    config
        .devices
        .iter()
        .map(|device| run_gelu_backward_conformance(library, *device, config))
        .collect()
}

pub fn emit_forensics_jsonl(
    output_path: &Path,
    logs: &[StructuredCaseLog],
) -> Result<ForensicsSummary, String> {
    let mut lines = String::new();
    for entry in logs {
        let line = serde_json::to_string(entry)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create forensics output dir {}: {error}",
                parent.display()
            )
        })?;
    }
    fs::write(output_path, lines).map_err(|error| {
        format!(
            "failed to write forensics log {}: {error}",
            output_path.display()
        )
    })?;

    Ok(ForensicsSummary {
        output_path: output_path.to_path_buf(),
        log_entries: logs.len(),
        skipped_entries: logs.iter().filter(|entry| entry.outcome == "skip").count(),
    })
}

fn case_report(
    case: &TestCase,
    device: Device,
    dtype: DType,
    seed: u64,
    outcome: CaseOutcome,
    evidence: &[EvidenceEntry],
    config: &HarnessConfig,
) -> GeluBackwardCaseReport {
    let name = case.label();
    let result = match outcome {
        CaseOutcome::Passed(_) => "pass",
        CaseOutcome::Skipped(_) => "skip",
    };
    let artifact_refs = config
        .forensics_path
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    let replay_command = format!(
        "cargo run -p oc-conformance --bin run_gelu_backward -- --{} --dtype {} --seed {:#x}",
        device.name().to_ascii_lowercase(),
        dtype.name(),
        config.seed
    );
    let forensic_log = StructuredCaseLog::new(
        SUITE_ID,
        &name,
        device.name(),
        dtype.name(),
        case.inplace.label(),
        seed,
        artifact_refs,
        replay_command,
        result,
        outcome.reason_code(),
    )
    .with_extra_fields(forensic_fields(case, &outcome, evidence, config));

    GeluBackwardCaseReport {
        name,
        case_index: case.index,
        device,
        dtype,
        inplace: case.inplace,
        seed,
        outcome,
        forensic_log,
    }
}

fn forensic_fields(
    case: &TestCase,
    outcome: &CaseOutcome,
    evidence: &[EvidenceEntry],
    config: &HarnessConfig,
) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("case_index".to_string(), json!(case.index));
    fields.insert("shape".to_string(), json!(case.shape));
    fields.insert(
        "grad_output_stride".to_string(),
        json!(case.grad_output_stride.as_explicit()),
    );
    fields.insert("input_stride".to_string(), json!(case.input_stride.as_explicit()));
    fields.insert(
        "grad_input_stride".to_string(),
        json!(case.grad_input_stride.as_explicit()),
    );
    fields.insert(
        "runtime_evidence".to_string(),
        json!(
            evidence
                .iter()
                .map(|entry| format!("{}: {}", entry.kind.as_str(), entry.summary))
                .collect::<Vec<_>>()
        ),
    );

    match outcome {
        CaseOutcome::Skipped(reason) => {
            fields.insert("skip_detail".to_string(), json!(reason.to_string()));
        }
        CaseOutcome::Passed(run) => {
            fields.insert("workspace_size".to_string(), json!(run.workspace_size));
            fields.insert("aliased".to_string(), json!(run.aliased));
            fields.insert("comparison".to_string(), json!(run.comparison));
            fields.insert(
                "lifecycle_trace".to_string(),
                json!(run.trace.iter().map(|stage| stage.name()).collect::<Vec<_>>()),
            );
            if !run.profiles.is_empty() {
                fields.insert("profile".to_string(), json!(run.profiles));
            }
            if config.debug {
                fields.insert("actual".to_string(), json!(run.actual));
                fields.insert("expected".to_string(), json!(run.expected));
            }
        }
    }
    fields
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}
