#![forbid(unsafe_code)]

use std::fmt;

use oc_core::{Device, Status, TensorDescriptor};
use oc_device::{DeviceHandle, DevicePtr, Stream};
use oc_kernel_cpu::GeluBackwardDescriptor;

/// The native operator surface exercised by the conformance harness. Every
/// call reports failure as a library [`Status`].
pub trait GeluBackwardLibrary {
    type Descriptor;

    fn create_descriptor(
        &self,
        handle: &DeviceHandle,
        grad_input: &TensorDescriptor,
        grad_output: &TensorDescriptor,
        input: &TensorDescriptor,
    ) -> Result<Self::Descriptor, Status>;

    fn workspace_size(&self, desc: &Self::Descriptor) -> Result<usize, Status>;

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        desc: &Self::Descriptor,
        workspace: Option<&DevicePtr>,
        workspace_size: usize,
        grad_input: &DevicePtr,
        grad_output: &DevicePtr,
        input: &DevicePtr,
        stream: Option<&Stream>,
    ) -> Result<(), Status>;

    fn destroy_descriptor(&self, desc: Self::Descriptor) -> Result<(), Status>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatchKey {
    Undefined = 0,
    Cpu = 1,
    Nvidia = 2,
    Cambricon = 3,
    Ascend = 4,
    Metax = 5,
    Moore = 6,
    Iluvatar = 7,
    Kunlun = 8,
}

impl DispatchKey {
    #[must_use]
    pub const fn for_device(device: Device) -> Self {
        match device {
            Device::Cpu => Self::Cpu,
            Device::Nvidia => Self::Nvidia,
            Device::Cambricon => Self::Cambricon,
            Device::Ascend => Self::Ascend,
            Device::Metax => Self::Metax,
            Device::Moore => Self::Moore,
            Device::Iluvatar => Self::Iluvatar,
            Device::Kunlun => Self::Kunlun,
        }
    }

    #[must_use]
    pub const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }
}

const BACKEND_PRIORITY: [DispatchKey; 8] = [
    DispatchKey::Cpu,
    DispatchKey::Nvidia,
    DispatchKey::Cambricon,
    DispatchKey::Ascend,
    DispatchKey::Metax,
    DispatchKey::Moore,
    DispatchKey::Iluvatar,
    DispatchKey::Kunlun,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DispatchKeySet {
    bits: u64,
}

impl DispatchKeySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub fn from_keys(keys: &[DispatchKey]) -> Self {
        let mut out = Self::empty();
        for key in keys {
            out.add(*key);
        }
        out
    }

    /// Backends compiled into this build.
    #[must_use]
    pub fn compiled_backends() -> Self {
        Self::from_keys(&[DispatchKey::Cpu])
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn add(&mut self, key: DispatchKey) {
        self.bits |= key.bit();
    }

    #[must_use]
    pub const fn has(self, key: DispatchKey) -> bool {
        (self.bits & key.bit()) != 0
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }

    pub fn highest_priority_backend(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        BACKEND_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoBackendKey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKeyError {
    EmptySet,
    NoBackendKey,
}

impl fmt::Display for DispatchKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySet => write!(f, "dispatch keyset is empty"),
            Self::NoBackendKey => write!(f, "dispatch keyset has no backend key"),
        }
    }
}

impl std::error::Error for DispatchKeyError {}

impl From<DispatchKeyError> for Status {
    fn from(_: DispatchKeyError) -> Self {
        Status::DeviceTypeNotSupported
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDecision {
    pub device: Device,
    pub kernel: &'static str,
    pub backend_key: DispatchKey,
    pub keyset_bits: u64,
}

/// Resolves the backend for `device` among the compiled backends.
pub fn resolve_backend(device: Device) -> Result<DispatchDecision, DispatchKeyError> {
    let requested = DispatchKeySet::from_keys(&[DispatchKey::for_device(device)]);
    let keyset = requested.intersection(DispatchKeySet::compiled_backends());
    let backend_key = keyset.highest_priority_backend()?;
    let kernel = match backend_key {
        DispatchKey::Cpu => "cpu::gelu_backward",
        _ => return Err(DispatchKeyError::NoBackendKey),
    };
    Ok(DispatchDecision {
        device,
        kernel,
        backend_key,
        keyset_bits: keyset.bits(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackendDescriptor {
    Cpu(GeluBackwardDescriptor),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorDescriptor {
    decision: DispatchDecision,
    backend: BackendDescriptor,
}

/// The shipped operator library, backed by the host kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeluBackwardOperator;

impl GeluBackwardOperator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl GeluBackwardLibrary for GeluBackwardOperator {
    type Descriptor = OperatorDescriptor;

    fn create_descriptor(
        &self,
        handle: &DeviceHandle,
        grad_input: &TensorDescriptor,
        grad_output: &TensorDescriptor,
        input: &TensorDescriptor,
    ) -> Result<OperatorDescriptor, Status> {
        let decision = resolve_backend(handle.device())?;
        let grad_input = grad_input.meta()?;
        let grad_output = grad_output.meta()?;
        let input = input.meta()?;
        let backend = match decision.backend_key {
            DispatchKey::Cpu => BackendDescriptor::Cpu(GeluBackwardDescriptor::create(
                handle.device(),
                &grad_input,
                &grad_output,
                &input,
            )?),
            _ => return Err(Status::DeviceTypeNotSupported),
        };
        Ok(OperatorDescriptor { decision, backend })
    }

    fn workspace_size(&self, desc: &OperatorDescriptor) -> Result<usize, Status> {
        match &desc.backend {
            BackendDescriptor::Cpu(inner) => Ok(inner.workspace_size()),
        }
    }

    fn execute(
        &self,
        desc: &OperatorDescriptor,
        workspace: Option<&DevicePtr>,
        workspace_size: usize,
        grad_input: &DevicePtr,
        grad_output: &DevicePtr,
        input: &DevicePtr,
        stream: Option<&Stream>,
    ) -> Result<(), Status> {
        if stream.is_some_and(|stream| stream.device() != desc.decision.device) {
            return Err(Status::BadParam);
        }
        match &desc.backend {
            BackendDescriptor::Cpu(inner) => {
                inner.calculate(workspace, workspace_size, grad_input, grad_output, input)?;
            }
        }
        Ok(())
    }

    fn destroy_descriptor(&self, desc: OperatorDescriptor) -> Result<(), Status> {
        drop(desc);
        Ok(())
    }
}
