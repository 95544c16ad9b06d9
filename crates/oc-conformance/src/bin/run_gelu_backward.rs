#![forbid(unsafe_code)]

use std::path::PathBuf;

use oc_conformance::{
    HarnessConfig, emit_forensics_jsonl, parse_dtype_list, parse_seed, run_gelu_backward_matrix,
};
use oc_core::Device;
use oc_dispatch::GeluBackwardOperator;
use serde_json::json;

const USAGE: &str = "usage: run_gelu_backward [--cpu|--nvidia|--cambricon|--ascend|--metax|--moore|--iluvatar|--kunlun] [--dtype F16,F32,BF16] [--debug] [--profile] [--num-prerun N] [--num-iterations N] [--seed N] [--output path]";

fn main() -> Result<(), String> {
    let mut config = HarnessConfig::from_env()?;
    let mut devices: Vec<Device> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dtype" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--dtype requires a comma-separated list".to_string())?;
                config.dtypes = parse_dtype_list(&value)?;
            }
            "--debug" => config.debug = true,
            "--profile" => config.profile = true,
            "--num-prerun" => config.num_prerun = parse_count(&arg, args.next())?,
            "--num-iterations" => config.num_iterations = parse_count(&arg, args.next())?,
            "--seed" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--seed requires a decimal or 0x-hex value".to_string())?;
                config.seed = parse_seed(&value)?;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                config.forensics_path = Some(PathBuf::from(value));
            }
            other => {
                let device = other
                    .strip_prefix("--")
                    .and_then(Device::from_name)
                    .ok_or_else(|| format!("unknown arg '{other}'. {USAGE}"))?;
                if !devices.contains(&device) {
                    devices.push(device);
                }
            }
        }
    }
    if !devices.is_empty() {
        config.devices = devices;
    }

    let runs = run_gelu_backward_matrix(&GeluBackwardOperator::new(), &config)
        .map_err(|error| format!("gelu_backward conformance failed: {error}"))?;

    let forensics = match config.forensics_path.as_deref() {
        Some(path) => {
            let logs = runs
                .iter()
                .flat_map(|(_, cases)| cases.iter().map(|case| case.forensic_log.clone()))
                .collect::<Vec<_>>();
            Some(emit_forensics_jsonl(path, &logs)?)
        }
        None => None,
    };

    let reports = runs.iter().map(|(report, _)| report).collect::<Vec<_>>();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "seed": config.seed,
            "dtypes": config.dtypes.iter().map(|dtype| dtype.name()).collect::<Vec<_>>(),
            "debug": config.debug,
            "profile": config.profile,
            "devices": reports,
            "forensics": forensics,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    Ok(())
}

fn parse_count(flag: &str, value: Option<String>) -> Result<usize, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a non-negative integer"))?;
    value
        .parse::<usize>()
        .map_err(|error| format!("invalid {flag} '{value}': {error}"))
}
