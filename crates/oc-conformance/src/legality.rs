use std::fmt;

use oc_core::TensorMeta;

use crate::cases::{InplaceMode, TestCase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    GradOutput,
    Input,
    GradInput,
}

impl Operand {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GradOutput => "grad_output",
            Self::Input => "input",
            Self::GradInput => "grad_input",
        }
    }
}

/// Why a generated case is not submitted to the library. Skips are not failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    InplaceStrideConflict,
    BroadcastOperand { operands: Vec<Operand> },
}

impl SkipReason {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InplaceStrideConflict => "skip_inplace_stride_conflict",
            Self::BroadcastOperand { .. } => "skip_broadcast_operand",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InplaceStrideConflict => {
                write!(f, "grad_input stride differs from grad_output under in-place mode")
            }
            Self::BroadcastOperand { operands } => {
                let names = operands.iter().map(|op| op.name()).collect::<Vec<_>>();
                write!(f, "broadcast layout on {}", names.join(", "))
            }
        }
    }
}

/// In-place aliasing needs grad_input's requested layout to be unset or equal
/// to grad_output's.
pub fn check_inplace_strides(case: &TestCase) -> Result<(), SkipReason> {
    if case.inplace == InplaceMode::InplaceGradOutput
        && case.grad_input_stride.is_explicit()
        && case.grad_input_stride != case.grad_output_stride
    {
        return Err(SkipReason::InplaceStrideConflict);
    }
    Ok(())
}

/// Rejects the case when any operand resolves to a broadcast layout.
pub fn check_broadcast_operands(operands: &[(Operand, &TensorMeta)]) -> Result<(), SkipReason> {
    let broadcast = operands
        .iter()
        .filter(|(_, meta)| meta.is_broadcast())
        .map(|(operand, _)| *operand)
        .collect::<Vec<_>>();
    if broadcast.is_empty() {
        Ok(())
    } else {
        Err(SkipReason::BroadcastOperand {
            operands: broadcast,
        })
    }
}
