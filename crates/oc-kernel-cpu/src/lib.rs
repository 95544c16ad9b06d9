#![forbid(unsafe_code)]

use std::fmt;

use oc_core::{
    DType, Device, Status, TensorCompatError, TensorMeta, TensorMetaError, ensure_compatible,
    storage_offsets,
};
use oc_device::{DeviceError, DeviceGuard, DevicePtr};

const WORD: usize = std::mem::size_of::<u64>();
const SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;
const GELU_COEFF: f64 = 0.044_715;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Incompatible(TensorCompatError),
    UnsupportedDtype {
        dtype: DType,
    },
    ShapeMismatch {
        side: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    BroadcastOutput {
        dims: Vec<usize>,
    },
    InsufficientWorkspace {
        needed: usize,
        available: usize,
    },
    MissingWorkspace {
        needed: usize,
    },
    InsufficientStorage {
        side: &'static str,
        needed: usize,
        available: usize,
    },
    CorruptWorkspace {
        reason: &'static str,
    },
    Meta(TensorMetaError),
    Device(DeviceError),
}

impl KernelError {
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Incompatible(TensorCompatError::DTypeMismatch { .. })
            | Self::UnsupportedDtype { .. } => Status::BadTensorDtype,
            Self::Incompatible(TensorCompatError::DeviceMismatch { .. })
            | Self::InsufficientStorage { .. }
            | Self::Meta(_) => Status::BadParam,
            Self::ShapeMismatch { .. } => Status::BadTensorShape,
            Self::BroadcastOutput { .. } => Status::BadTensorStrides,
            Self::InsufficientWorkspace { .. } => Status::InsufficientWorkspace,
            Self::MissingWorkspace { .. } => Status::NullPointer,
            Self::CorruptWorkspace { .. } => Status::InternalError,
            Self::Device(error) => error.status(),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible(error) => write!(f, "incompatible tensors: {error}"),
            Self::UnsupportedDtype { dtype } => {
                write!(f, "unsupported dtype {} for gelu backward", dtype.name())
            }
            Self::ShapeMismatch {
                side,
                expected,
                actual,
            } => write!(
                f,
                "shape mismatch on {side}: expected={expected:?}, actual={actual:?}"
            ),
            Self::BroadcastOutput { dims } => {
                write!(f, "output has broadcast dims {dims:?}")
            }
            Self::InsufficientWorkspace { needed, available } => write!(
                f,
                "insufficient workspace: needed={needed}, available={available}"
            ),
            Self::MissingWorkspace { needed } => {
                write!(f, "workspace of {needed} bytes required but none given")
            }
            Self::InsufficientStorage {
                side,
                needed,
                available,
            } => write!(
                f,
                "insufficient storage on {side}: needed={needed}, available={available}"
            ),
            Self::CorruptWorkspace { reason } => write!(f, "corrupt workspace: {reason}"),
            Self::Meta(error) => write!(f, "tensor layout error: {error}"),
            Self::Device(error) => write!(f, "device error: {error}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorCompatError> for KernelError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

impl From<TensorMetaError> for KernelError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

impl From<DeviceError> for KernelError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<KernelError> for Status {
    fn from(value: KernelError) -> Self {
        value.status()
    }
}

/// Broadcast-free layout of one elementwise call: the output shape and the
/// per-element strides of the output and each input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementwiseInfo {
    output_shape: Vec<usize>,
    output_strides: Vec<usize>,
    input_strides: Vec<Vec<usize>>,
}

impl ElementwiseInfo {
    pub fn create(output: &TensorMeta, inputs: &[&TensorMeta]) -> Result<Self, KernelError> {
        let dims = output.broadcast_dims();
        if !dims.is_empty() {
            return Err(KernelError::BroadcastOutput { dims });
        }

        for (idx, input) in inputs.iter().enumerate() {
            if input.shape() != output.shape() {
                return Err(KernelError::ShapeMismatch {
                    side: input_side(idx),
                    expected: output.shape().to_vec(),
                    actual: input.shape().to_vec(),
                });
            }
        }

        Ok(Self {
            output_shape: output.shape().to_vec(),
            output_strides: output.strides().to_vec(),
            input_strides: inputs
                .iter()
                .map(|input| input.strides().to_vec())
                .collect(),
        })
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.output_shape.len()
    }

    #[must_use]
    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    #[must_use]
    pub fn output_strides(&self) -> &[usize] {
        &self.output_strides
    }

    #[must_use]
    pub fn input_strides(&self) -> &[Vec<usize>] {
        &self.input_strides
    }

    /// Bytes needed to stage this info: rank and input count, then the output
    /// shape, the output strides and each input's strides, all as LE u64.
    #[must_use]
    pub fn packed_len(&self) -> usize {
        let words = 2 + self.ndim() * (2 + self.input_strides.len());
        words * WORD
    }

    pub fn pack_into(&self, dst: &mut [u8]) -> Result<(), KernelError> {
        let needed = self.packed_len();
        if dst.len() < needed {
            return Err(KernelError::InsufficientWorkspace {
                needed,
                available: dst.len(),
            });
        }

        let words = [self.ndim(), self.input_strides.len()]
            .into_iter()
            .chain(self.output_shape.iter().copied())
            .chain(self.output_strides.iter().copied())
            .chain(self.input_strides.iter().flatten().copied());
        for (chunk, word) in dst.chunks_exact_mut(WORD).zip(words) {
            chunk.copy_from_slice(&(word as u64).to_le_bytes());
        }
        Ok(())
    }

    pub fn unpack(src: &[u8]) -> Result<Self, KernelError> {
        let mut words = src.chunks_exact(WORD).map(|chunk| {
            let mut raw = [0u8; WORD];
            raw.copy_from_slice(chunk);
            usize::try_from(u64::from_le_bytes(raw))
        });
        let mut next = || -> Result<usize, KernelError> {
            match words.next() {
                Some(Ok(word)) => Ok(word),
                Some(Err(_)) => Err(KernelError::CorruptWorkspace {
                    reason: "word exceeds host usize",
                }),
                None => Err(KernelError::CorruptWorkspace {
                    reason: "truncated metadata",
                }),
            }
        };

        let ndim = next()?;
        let num_inputs = next()?;
        let needed = 2usize
            .checked_add(ndim.saturating_mul(num_inputs.saturating_add(2)))
            .and_then(|words| words.checked_mul(WORD))
            .ok_or(KernelError::CorruptWorkspace {
                reason: "metadata size overflow",
            })?;
        if src.len() < needed {
            return Err(KernelError::CorruptWorkspace {
                reason: "truncated metadata",
            });
        }

        let mut read_dims = || (0..ndim).map(|_| next()).collect::<Result<Vec<_>, _>>();
        let output_shape = read_dims()?;
        let output_strides = read_dims()?;
        let input_strides = (0..num_inputs)
            .map(|_| read_dims())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            output_shape,
            output_strides,
            input_strides,
        })
    }
}

fn input_side(idx: usize) -> &'static str {
    match idx {
        0 => "grad_output",
        1 => "input",
        _ => "extra_input",
    }
}

/// Derivative of the tanh-approximated GeLU at `x`.
#[must_use]
pub fn gelu_backward_scalar(x: f64) -> f64 {
    let x_sq = x * x;
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x_sq * x);
    let tanh_inner = inner.tanh();
    let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x_sq);
    0.5 * (1.0 + tanh_inner) + 0.5 * x * (1.0 - tanh_inner * tanh_inner) * d_inner
}

/// Host GeLU backward descriptor. Layout metadata is copied at creation, so
/// the caller's tensor views may be released before `calculate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeluBackwardDescriptor {
    dtype: DType,
    device: Device,
    info: ElementwiseInfo,
}

impl GeluBackwardDescriptor {
    pub fn create(
        device: Device,
        grad_input: &TensorMeta,
        grad_output: &TensorMeta,
        input: &TensorMeta,
    ) -> Result<Self, KernelError> {
        let guard = DeviceGuard::new(device);
        for meta in [grad_input, grad_output, input] {
            guard.ensure_meta_device(meta).map_err(|_| {
                KernelError::Incompatible(TensorCompatError::DeviceMismatch {
                    lhs: device,
                    rhs: meta.device(),
                })
            })?;
        }

        let dtype = grad_input.dtype();
        if !matches!(dtype, DType::F16 | DType::F32 | DType::BF16) {
            return Err(KernelError::UnsupportedDtype { dtype });
        }
        ensure_compatible(grad_input, grad_output)?;
        ensure_compatible(grad_input, input)?;

        let info = ElementwiseInfo::create(grad_input, &[grad_output, input])?;
        Ok(Self {
            dtype,
            device,
            info,
        })
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn info(&self) -> &ElementwiseInfo {
        &self.info
    }

    #[must_use]
    pub fn workspace_size(&self) -> usize {
        self.info.packed_len()
    }

    /// Writes `grad_output * gelu'(input)` into `grad_input`. Both inputs are
    /// read in full before the output is written, so `grad_input` may alias
    /// `grad_output`.
    pub fn calculate(
        &self,
        workspace: Option<&DevicePtr>,
        workspace_size: usize,
        grad_input: &DevicePtr,
        grad_output: &DevicePtr,
        input: &DevicePtr,
    ) -> Result<(), KernelError> {
        let needed = self.workspace_size();
        if workspace_size < needed {
            return Err(KernelError::InsufficientWorkspace {
                needed,
                available: workspace_size,
            });
        }
        let workspace = workspace.ok_or(KernelError::MissingWorkspace { needed })?;

        let guard = DeviceGuard::new(self.device);
        for ptr in [workspace, grad_input, grad_output, input] {
            guard.ensure_ptr_device(ptr)?;
        }

        let available = workspace.len()?;
        if available < needed {
            return Err(KernelError::InsufficientWorkspace { needed, available });
        }

        let mut staged = vec![0u8; needed];
        self.info.pack_into(&mut staged)?;
        workspace.copy_from_host(&staged)?;
        let info = workspace.with_bytes(|bytes| ElementwiseInfo::unpack(&bytes[..needed]))??;
        let [grad_output_strides, input_strides] = info.input_strides() else {
            return Err(KernelError::CorruptWorkspace {
                reason: "expected two input layouts",
            });
        };

        let shape = info.output_shape();
        let out_offsets = storage_offsets(shape, info.output_strides());
        let grad_output_offsets = storage_offsets(shape, grad_output_strides);
        let input_offsets = storage_offsets(shape, input_strides);

        let grad_output_bytes = grad_output.to_vec()?;
        let input_bytes = input.to_vec()?;
        self.ensure_storage("grad_output", &grad_output_offsets, grad_output_bytes.len())?;
        self.ensure_storage("input", &input_offsets, input_bytes.len())?;
        self.ensure_storage("grad_input", &out_offsets, grad_input.len()?)?;

        let values = grad_output_offsets
            .iter()
            .zip(input_offsets.iter())
            .map(|(go_offset, x_offset)| {
                let dy = self.dtype.read_element(&grad_output_bytes, *go_offset)?;
                let x = self.dtype.read_element(&input_bytes, *x_offset)?;
                Ok(dy * gelu_backward_scalar(x))
            })
            .collect::<Result<Vec<f64>, TensorMetaError>>()?;

        grad_input.with_bytes_mut(|dst| {
            out_offsets
                .iter()
                .zip(values.iter())
                .try_for_each(|(offset, value)| self.dtype.write_element(dst, *offset, *value))
        })??;
        Ok(())
    }

    fn ensure_storage(
        &self,
        side: &'static str,
        offsets: &[usize],
        available: usize,
    ) -> Result<(), KernelError> {
        let Some(max_offset) = offsets.iter().copied().max() else {
            return Ok(());
        };
        let needed = (max_offset + 1) * self.dtype.size_in_bytes();
        if available < needed {
            return Err(KernelError::InsufficientStorage {
                side,
                needed,
                available,
            });
        }
        Ok(())
    }
}
