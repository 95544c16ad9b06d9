use std::fmt;

use oc_autograd::{AutogradError, DenseTensor};
use oc_core::{DType, Status, TensorMetaError, decode_status};
use oc_device::{DeviceError, DeviceHandle, Stream, Workspace};
use oc_dispatch::GeluBackwardLibrary;
use oc_runtime::SessionContext;

use crate::cases::TestCase;
use crate::compare::{CompareSummary, MismatchReport, compare};
use crate::config::HarnessConfig;
use crate::legality::{SkipReason, check_inplace_strides};
use crate::oracle::{OracleError, gelu_backward_reference};
use crate::profile::{ProfileReport, profile_operation};
use crate::tensor::CaseOperands;
use crate::tolerance::TolerancePolicy;

/// States of one operator invocation, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleStage {
    Constructed,
    OracleComputed,
    DescriptorCreated,
    ViewsInvalidated,
    WorkspaceSized,
    Executed,
    Compared,
    Destroyed,
}

impl LifecycleStage {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Constructed => "constructed",
            Self::OracleComputed => "oracle_computed",
            Self::DescriptorCreated => "descriptor_created",
            Self::ViewsInvalidated => "views_invalidated",
            Self::WorkspaceSized => "workspace_sized",
            Self::Executed => "executed",
            Self::Compared => "compared",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseError {
    Construction(TensorMetaError),
    Device(DeviceError),
    Oracle(OracleError),
    Library { stage: LifecycleStage, status: Status },
    Mismatch(Box<MismatchReport>),
}

impl CaseError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Construction(_) => "tensor_construction_failed",
            Self::Device(_) => "device_failure",
            Self::Oracle(_) => "reference_failed",
            Self::Library { .. } => "library_status_error",
            Self::Mismatch(_) => "numerical_mismatch",
        }
    }
}

impl fmt::Display for CaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Construction(error) => write!(f, "tensor construction failed: {error}"),
            Self::Device(error) => write!(f, "device failure: {error}"),
            Self::Oracle(error) => write!(f, "{error}"),
            Self::Library { stage, status } => write!(
                f,
                "library returned {} during {stage}",
                decode_status(status.code())
            ),
            Self::Mismatch(report) => write!(f, "result mismatch: {report}"),
        }
    }
}

impl std::error::Error for CaseError {}

impl From<TensorMetaError> for CaseError {
    fn from(value: TensorMetaError) -> Self {
        Self::Construction(value)
    }
}

impl From<DeviceError> for CaseError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<OracleError> for CaseError {
    fn from(value: OracleError) -> Self {
        Self::Oracle(value)
    }
}

impl From<AutogradError> for CaseError {
    fn from(value: AutogradError) -> Self {
        Self::Oracle(OracleError::Autograd(value))
    }
}

impl From<Box<MismatchReport>> for CaseError {
    fn from(value: Box<MismatchReport>) -> Self {
        Self::Mismatch(value)
    }
}

/// Read-only collaborators shared by every case on one device.
#[derive(Debug, Clone, Copy)]
pub struct CaseContext<'a> {
    pub config: &'a HarnessConfig,
    pub tolerances: &'a TolerancePolicy,
    pub handle: &'a DeviceHandle,
    pub stream: Option<&'a Stream>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseRun {
    pub trace: Vec<LifecycleStage>,
    pub workspace_size: usize,
    pub comparison: CompareSummary,
    pub profiles: Vec<ProfileReport>,
    pub aliased: bool,
    pub actual: Vec<f64>,
    pub expected: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    Passed(Box<CaseRun>),
    Skipped(SkipReason),
}

impl CaseOutcome {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Passed(_) => "parity_ok",
            Self::Skipped(reason) => reason.reason_code(),
        }
    }
}

struct Trace<'s> {
    label: String,
    stages: Vec<LifecycleStage>,
    session: &'s mut SessionContext,
}

impl Trace<'_> {
    fn enter(&mut self, stage: LifecycleStage) {
        self.session.record_stage(&self.label, stage);
        self.stages.push(stage);
    }

    fn skip(&mut self, reason: SkipReason) -> CaseOutcome {
        self.session.record_skip(&self.label, reason.reason_code());
        CaseOutcome::Skipped(reason)
    }

    fn library<T>(
        &mut self,
        stage: LifecycleStage,
        result: Result<T, Status>,
    ) -> Result<T, CaseError> {
        result.map_err(|status| {
            self.session.record_status_failure(&self.label, stage, status);
            CaseError::Library { stage, status }
        })
    }
}

/// Oracle inputs captured before the library runs, so the reference can be
/// re-evaluated for profiling after grad_input has been overwritten.
struct Reference {
    grad_output: DenseTensor,
    input: DenseTensor,
    grad_input_shape: Vec<usize>,
    expected: Vec<f64>,
}

impl Reference {
    fn compute(operands: &CaseOperands, dtype: DType) -> Result<Self, CaseError> {
        let grad_output = operands.grad_output.to_dense()?;
        let input = operands.input.to_dense()?;
        let grad_input_shape = operands.grad_input.meta().shape().to_vec();
        let expected = gelu_backward_reference(&grad_output, &input, &grad_input_shape)?
            .into_values()
            .into_iter()
            .map(|value| dtype.round(value))
            .collect();
        Ok(Self {
            grad_output,
            input,
            grad_input_shape,
            expected,
        })
    }

    fn rerun(&self) -> Result<(), CaseError> {
        gelu_backward_reference(&self.grad_output, &self.input, &self.grad_input_shape)?;
        Ok(())
    }
}

/// Drives one (case, dtype) pair on one device through the full operator
/// lifecycle. Legality skips return `Ok(CaseOutcome::Skipped)` before the
/// library is touched; every other failure is an error. Once created, the
/// descriptor is destroyed exactly once on every path.
pub fn run_case<L: GeluBackwardLibrary>(
    library: &L,
    ctx: CaseContext<'_>,
    session: &mut SessionContext,
    case: &TestCase,
    dtype: DType,
    seed: u64,
) -> Result<CaseOutcome, CaseError> {
    let mut trace = Trace {
        label: format!("{} dtype:{}", case.label(), dtype.name()),
        stages: Vec::with_capacity(8),
        session,
    };
    if let Err(reason) = check_inplace_strides(case) {
        return Ok(trace.skip(reason));
    }

    let operands = CaseOperands::construct(case, dtype, ctx.handle.device(), seed)?;
    trace.enter(LifecycleStage::Constructed);
    if let Err(reason) = operands.check_broadcast() {
        return Ok(trace.skip(reason));
    }

    let reference = Reference::compute(&operands, dtype)?;
    ctx.handle.synchronize()?;
    trace.enter(LifecycleStage::OracleComputed);

    let created = library.create_descriptor(
        ctx.handle,
        operands.grad_input.view(),
        operands.grad_output.view(),
        operands.input.view(),
    );
    let desc = trace.library(LifecycleStage::DescriptorCreated, created)?;
    trace.enter(LifecycleStage::DescriptorCreated);

    operands.destroy_views();
    trace.enter(LifecycleStage::ViewsInvalidated);

    let driven = drive_descriptor(library, ctx, &mut trace, &desc, &operands, &reference, dtype);
    // A teardown failure is recorded even when the drive error is the one returned.
    let destroyed = trace.library(LifecycleStage::Destroyed, library.destroy_descriptor(desc));
    let mut run = driven?;
    destroyed?;
    trace.enter(LifecycleStage::Destroyed);

    run.trace = trace.stages;
    Ok(CaseOutcome::Passed(Box::new(run)))
}

fn drive_descriptor<L: GeluBackwardLibrary>(
    library: &L,
    ctx: CaseContext<'_>,
    trace: &mut Trace<'_>,
    desc: &L::Descriptor,
    operands: &CaseOperands,
    reference: &Reference,
    dtype: DType,
) -> Result<CaseRun, CaseError> {
    let sized = library.workspace_size(desc);
    let workspace_size = trace.library(LifecycleStage::WorkspaceSized, sized)?;
    let workspace = Workspace::new(ctx.handle.device(), workspace_size);
    trace.enter(LifecycleStage::WorkspaceSized);

    let execute = || {
        library.execute(
            desc,
            workspace.ptr(),
            workspace.size(),
            operands.grad_input.raw_pointer(),
            operands.grad_output.raw_pointer(),
            operands.input.raw_pointer(),
            ctx.stream,
        )
    };
    trace.library(LifecycleStage::Executed, execute())?;
    trace.enter(LifecycleStage::Executed);

    let actual = operands.grad_input.logical_values()?;
    let comparison = compare(
        &actual,
        &reference.expected,
        dtype,
        ctx.tolerances.tolerance_for(dtype),
        ctx.config.debug,
    )?;
    trace.enter(LifecycleStage::Compared);

    let mut profiles = Vec::new();
    if ctx.config.profile {
        let sync = || ctx.handle.synchronize().map_err(CaseError::from);
        let (prerun, iterations) = (ctx.config.num_prerun, ctx.config.num_iterations);
        profiles.push(profile_operation("reference", prerun, iterations, sync, || {
            reference.rerun()
        })?);
        profiles.push(profile_operation("library", prerun, iterations, sync, || {
            execute().map_err(|status| CaseError::Library {
                stage: LifecycleStage::Executed,
                status,
            })
        })?);
        for report in &profiles {
            trace
                .session
                .record_profile(&trace.label, &report.label, report.mean_ns);
        }
    }

    Ok(CaseRun {
        trace: Vec::new(),
        workspace_size,
        comparison,
        profiles,
        aliased: operands.is_aliased(),
        actual,
        expected: reference.expected.clone(),
    })
}
