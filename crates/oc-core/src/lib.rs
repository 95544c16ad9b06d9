#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use half::{bf16, f16};

static NEXT_DESCRIPTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Largest byte length a single host allocation can have.
const MAX_STORAGE_BYTES: usize = isize::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    #[must_use]
    pub const fn all() -> &'static [DType] {
        &[DType::F16, DType::BF16, DType::F32, DType::F64]
    }

    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F16 | Self::BF16 => 2,
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::F32 => "F32",
            Self::F64 => "F64",
        }
    }

    #[must_use]
    pub fn from_name(raw: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|dtype| dtype.name().eq_ignore_ascii_case(raw.trim()))
    }

    /// Rounds `value` to the nearest representable value of this dtype.
    #[must_use]
    pub fn round(self, value: f64) -> f64 {
        match self {
            Self::F16 => f16::from_f64(value).to_f64(),
            Self::BF16 => bf16::from_f64(value).to_f64(),
            Self::F32 => f64::from(value as f32),
            Self::F64 => value,
        }
    }

    /// Decodes element `index` of a little-endian buffer holding this dtype.
    pub fn read_element(self, bytes: &[u8], index: usize) -> Result<f64, TensorMetaError> {
        let width = self.size_in_bytes();
        let chunk = element_bytes(bytes, index, width)?;
        Ok(match self {
            Self::F16 => f16::from_le_bytes([chunk[0], chunk[1]]).to_f64(),
            Self::BF16 => bf16::from_le_bytes([chunk[0], chunk[1]]).to_f64(),
            Self::F32 => f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            Self::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            }
        })
    }

    pub fn write_element(
        self,
        bytes: &mut [u8],
        index: usize,
        value: f64,
    ) -> Result<(), TensorMetaError> {
        let width = self.size_in_bytes();
        let available = bytes.len() / width;
        let start = index
            .checked_mul(width)
            .ok_or(TensorMetaError::StorageOutOfBounds { index, available })?;
        let Some(chunk) = bytes.get_mut(start..start + width) else {
            return Err(TensorMetaError::StorageOutOfBounds { index, available });
        };
        match self {
            Self::F16 => chunk.copy_from_slice(&f16::from_f64(value).to_le_bytes()),
            Self::BF16 => chunk.copy_from_slice(&bf16::from_f64(value).to_le_bytes()),
            Self::F32 => chunk.copy_from_slice(&(value as f32).to_le_bytes()),
            Self::F64 => chunk.copy_from_slice(&value.to_le_bytes()),
        }
        Ok(())
    }
}

fn element_bytes(bytes: &[u8], index: usize, width: usize) -> Result<&[u8], TensorMetaError> {
    let available = bytes.len() / width;
    let start = index
        .checked_mul(width)
        .ok_or(TensorMetaError::StorageOutOfBounds { index, available })?;
    bytes
        .get(start..start + width)
        .ok_or(TensorMetaError::StorageOutOfBounds { index, available })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    Nvidia,
    Cambricon,
    Ascend,
    Metax,
    Moore,
    Iluvatar,
    Kunlun,
}

impl Device {
    #[must_use]
    pub const fn all() -> &'static [Device] {
        &[
            Device::Cpu,
            Device::Nvidia,
            Device::Cambricon,
            Device::Ascend,
            Device::Metax,
            Device::Moore,
            Device::Iluvatar,
            Device::Kunlun,
        ]
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Nvidia => "NVIDIA",
            Self::Cambricon => "CAMBRICON",
            Self::Ascend => "ASCEND",
            Self::Metax => "METAX",
            Self::Moore => "MOORE",
            Self::Iluvatar => "ILUVATAR",
            Self::Kunlun => "KUNLUN",
        }
    }

    #[must_use]
    pub fn from_name(raw: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|device| device.name().eq_ignore_ascii_case(raw.trim()))
    }
}

/// Requested layout of one operand: either a dense row-major default or an
/// explicit per-dimension stride list in elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum StrideSpec {
    #[default]
    Dense,
    Explicit(Vec<usize>),
}

impl StrideSpec {
    #[must_use]
    pub fn explicit(strides: &[usize]) -> Self {
        Self::Explicit(strides.to_vec())
    }

    #[must_use]
    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Explicit(_))
    }

    #[must_use]
    pub fn as_explicit(&self) -> Option<&[usize]> {
        match self {
            Self::Dense => None,
            Self::Explicit(strides) => Some(strides),
        }
    }

    pub fn resolve(&self, shape: &[usize]) -> Result<Vec<usize>, TensorMetaError> {
        match self {
            Self::Dense => Ok(contiguous_strides(shape)),
            Self::Explicit(strides) => {
                if strides.len() != shape.len() {
                    return Err(TensorMetaError::RankStrideMismatch {
                        rank: shape.len(),
                        strides: strides.len(),
                    });
                }
                Ok(strides.clone())
            }
        }
    }
}

impl fmt::Display for StrideSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dense => write!(f, "None"),
            Self::Explicit(strides) => write!(f, "{}", format_dims(strides)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            dtype,
            device,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            dtype,
            device,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn from_spec(
        shape: &[usize],
        spec: &StrideSpec,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let strides = spec.resolve(shape)?;
        Self::from_shape_and_strides(shape.to_vec(), strides, dtype, device)
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }

        let mut max_linear_offset = 0usize;
        for (dim, (size, stride)) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if size == 0 {
                return Err(TensorMetaError::ZeroExtent { dim });
            }

            let span = stride
                .checked_mul(size - 1)
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset
                .checked_add(span)
                .ok_or(TensorMetaError::SpanOverflow { max_linear_offset })?;
        }

        max_linear_offset
            .checked_add(1)
            .and_then(|span| span.checked_mul(self.dtype.size_in_bytes()))
            .filter(|bytes| *bytes <= MAX_STORAGE_BYTES)
            .ok_or(TensorMetaError::SpanOverflow { max_linear_offset })?;
        Ok(())
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
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
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().copied().product()
    }

    /// Number of storage elements addressed by this layout.
    #[must_use]
    pub fn storage_span(&self) -> usize {
        if self.numel() == 0 {
            return 0;
        }
        self.shape
            .iter()
            .zip(self.strides.iter())
            .fold(1usize, |span, (size, stride)| {
                span.saturating_add(size.saturating_sub(1).saturating_mul(*stride))
            })
    }

    /// Byte length of the storage span. Exact for validated layouts.
    #[must_use]
    pub fn storage_bytes(&self) -> usize {
        self.storage_span().saturating_mul(self.dtype.size_in_bytes())
    }

    /// A dimension is broadcast when its stride is 0 but its extent exceeds 1.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.shape
            .iter()
            .zip(self.strides.iter())
            .any(|(size, stride)| *stride == 0 && *size > 1)
    }

    #[must_use]
    pub fn broadcast_dims(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(self.strides.iter())
            .enumerate()
            .filter(|(_, (size, stride))| **stride == 0 && **size > 1)
            .map(|(dim, _)| dim)
            .collect()
    }

    /// Storage element offsets of every logical element, in row-major order.
    #[must_use]
    pub fn storage_offsets(&self) -> Vec<usize> {
        storage_offsets(&self.shape, &self.strides)
    }
}

/// Row-major walk over `shape`, yielding the storage offset of each element.
/// `strides` must have the same rank as `shape` and describe a validated span.
#[must_use]
pub fn storage_offsets(shape: &[usize], strides: &[usize]) -> Vec<usize> {
    let numel: usize = shape.iter().copied().product();
    let mut offsets = Vec::with_capacity(numel);
    if numel == 0 {
        return offsets;
    }

    let rank = shape.len().min(strides.len());
    let mut index = vec![0usize; rank];
    let mut linear = 0usize;
    for _ in 0..numel {
        offsets.push(linear);
        for dim in (0..rank).rev() {
            if index[dim] + 1 < shape[dim] {
                index[dim] += 1;
                linear += strides[dim];
                break;
            }
            linear -= strides[dim] * (shape[dim] - 1);
            index[dim] = 0;
        }
    }
    offsets
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankStrideMismatch { rank: usize, strides: usize },
    ZeroExtent { dim: usize },
    StrideOverflow { size: usize, stride: usize },
    SpanOverflow { max_linear_offset: usize },
    StorageOutOfBounds { index: usize, available: usize },
    StorageAllocation { bytes: usize },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::ZeroExtent { dim } => write!(f, "extent of dim {dim} must be positive"),
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::SpanOverflow { max_linear_offset } => write!(
                f,
                "storage span overflow past max_linear_offset={max_linear_offset}"
            ),
            Self::StorageOutOfBounds { index, available } => write!(
                f,
                "storage element {index} out of bounds: available={available}"
            ),
            Self::StorageAllocation { bytes } => {
                write!(f, "cannot allocate {bytes} bytes of tensor storage")
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorCompatError {
    DTypeMismatch { lhs: DType, rhs: DType },
    DeviceMismatch { lhs: Device, rhs: Device },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

pub fn ensure_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), TensorCompatError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.device() != rhs.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }

    Ok(())
}

/// Status codes returned across the operator library boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    InternalError = 1,
    NotImplemented = 2,
    BadParam = 3,
    NullPointer = 4,
    DeviceTypeNotSupported = 5,
    DeviceNotFound = 6,
    DeviceNotInitialized = 7,
    DeviceArchitectureNotSupported = 8,
    BadTensorDtype = 10,
    BadTensorShape = 11,
    BadTensorStrides = 12,
    InsufficientWorkspace = 13,
}

impl Status {
    const ALL: [Status; 13] = [
        Status::Success,
        Status::InternalError,
        Status::NotImplemented,
        Status::BadParam,
        Status::NullPointer,
        Status::DeviceTypeNotSupported,
        Status::DeviceNotFound,
        Status::DeviceNotInitialized,
        Status::DeviceArchitectureNotSupported,
        Status::BadTensorDtype,
        Status::BadTensorShape,
        Status::BadTensorStrides,
        Status::InsufficientWorkspace,
    ];

    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.code() == code)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "STATUS_SUCCESS",
            Self::InternalError => "STATUS_INTERNAL_ERROR",
            Self::NotImplemented => "STATUS_NOT_IMPLEMENTED",
            Self::BadParam => "STATUS_BAD_PARAM",
            Self::NullPointer => "STATUS_NULL_POINTER",
            Self::DeviceTypeNotSupported => "STATUS_DEVICE_TYPE_NOT_SUPPORTED",
            Self::DeviceNotFound => "STATUS_DEVICE_NOT_FOUND",
            Self::DeviceNotInitialized => "STATUS_DEVICE_NOT_INITIALIZED",
            Self::DeviceArchitectureNotSupported => "STATUS_DEVICE_ARCHITECTURE_NOT_SUPPORTED",
            Self::BadTensorDtype => "STATUS_BAD_TENSOR_DTYPE",
            Self::BadTensorShape => "STATUS_BAD_TENSOR_SHAPE",
            Self::BadTensorStrides => "STATUS_BAD_TENSOR_STRIDES",
            Self::InsufficientWorkspace => "STATUS_INSUFFICIENT_WORKSPACE",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.name(), self.code())
    }
}

impl std::error::Error for Status {}

/// Diagnostic name for a raw status code, including codes this build does not know.
#[must_use]
pub fn decode_status(code: i32) -> String {
    Status::from_code(code).map_or_else(
        || format!("UNKNOWN_STATUS({code})"),
        |status| status.name().to_string(),
    )
}

/// Library-side view of a tensor's layout. Clones share the same view, and
/// `destroy` invalidates it for every holder.
#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    id: u64,
    meta: Arc<Mutex<Option<TensorMeta>>>,
}

impl TensorDescriptor {
    #[must_use]
    pub fn new(meta: TensorMeta) -> Self {
        Self {
            id: NEXT_DESCRIPTOR_ID.fetch_add(1, Ordering::Relaxed),
            meta: Arc::new(Mutex::new(Some(meta))),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn meta(&self) -> Result<TensorMeta, Status> {
        let guard = self.meta.lock().map_err(|_| Status::InternalError)?;
        guard.clone().ok_or(Status::NullPointer)
    }

    /// Returns whether the view was still live.
    pub fn destroy(&self) -> bool {
        match self.meta.lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(poisoned) => poisoned.into_inner().take().is_some(),
        }
    }
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

/// Tuple-style rendering used in case labels, e.g. `(13, 4)` or `(5,)`.
#[must_use]
pub fn format_dims(dims: &[usize]) -> String {
    match dims {
        [] => "()".to_string(),
        [single] => format!("({single},)"),
        _ => {
            let parts = dims.iter().map(usize::to_string).collect::<Vec<_>>();
            format!("({})", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        DType, Device, Status, StrideSpec, TensorCompatError, TensorDescriptor, TensorMeta,
        TensorMetaError, contiguous_strides, decode_status, ensure_compatible, format_dims,
        storage_offsets,
    };

    #[test]
    fn shape_builds_contiguous_strides() {
        let meta = TensorMeta::from_shape(vec![2, 3, 4], DType::F32, Device::Cpu);
        assert_eq!(meta.strides(), &[12, 4, 1]);
        assert_eq!(meta.numel(), 24);
        assert_eq!(meta.storage_span(), 24);
        assert_eq!(meta.storage_bytes(), 96);
        assert!(!meta.is_broadcast());
    }

    #[test]
    fn singleton_zero_stride_is_not_broadcast() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![1, 3], vec![0, 1], DType::F32, Device::Cpu)
                .expect("singleton zero stride should validate");
        assert_eq!(meta.storage_span(), 3);
        assert!(
            !meta.is_broadcast(),
            "zero stride on an extent-1 dim is not a broadcast"
        );
    }

    #[test]
    fn zero_stride_on_wide_dim_is_broadcast() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![13, 4], vec![0, 1], DType::F16, Device::Cpu)
                .expect("broadcast layout should validate");
        assert!(meta.is_broadcast());
        assert_eq!(meta.broadcast_dims(), vec![0]);
        assert_eq!(meta.storage_span(), 4);
    }

    #[test]
    fn padded_strides_span_more_storage_than_numel() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![13, 4], vec![10, 1], DType::F32, Device::Cpu)
                .expect("padded layout should validate");
        assert_eq!(meta.numel(), 52);
        assert_eq!(meta.storage_span(), 124);
        assert_eq!(meta.storage_bytes(), 496);
        assert!(!meta.is_broadcast());
    }

    #[test]
    fn stride_spec_resolves_dense_and_explicit() {
        assert_eq!(
            StrideSpec::Dense.resolve(&[4, 4, 5632]).expect("dense"),
            vec![22528, 5632, 1]
        );
        assert_eq!(
            StrideSpec::explicit(&[45056, 5632, 1])
                .resolve(&[4, 4, 5632])
                .expect("explicit"),
            vec![45056, 5632, 1]
        );
        let err = StrideSpec::explicit(&[1])
            .resolve(&[13, 4])
            .expect_err("rank mismatch must fail");
        assert!(matches!(
            err,
            TensorMetaError::RankStrideMismatch {
                rank: 2,
                strides: 1
            }
        ));
    }

    #[test]
    fn stride_spec_display_matches_tuple_rendering() {
        assert_eq!(StrideSpec::Dense.to_string(), "None");
        assert_eq!(StrideSpec::explicit(&[10, 1]).to_string(), "(10, 1)");
        assert_eq!(format_dims(&[5]), "(5,)");
        assert_eq!(format_dims(&[]), "()");
    }

    #[test]
    fn zero_extent_is_rejected() {
        let err =
            TensorMeta::from_shape_and_strides(vec![3, 0], vec![1, 1], DType::F32, Device::Cpu)
                .expect_err("zero extent must fail");
        assert!(matches!(err, TensorMetaError::ZeroExtent { dim: 1 }));
    }

    #[test]
    fn storage_offsets_follow_strides_in_row_major_order() {
        assert_eq!(storage_offsets(&[2, 3], &[10, 1]), vec![0, 1, 2, 10, 11, 12]);
        assert_eq!(storage_offsets(&[2, 2], &[1, 2]), vec![0, 2, 1, 3]);
        assert_eq!(storage_offsets(&[2, 3], &[0, 1]), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(storage_offsets(&[], &[]), vec![0]);
    }

    #[test]
    fn storage_byte_length_is_bounded() {
        let wrapping = TensorMeta::from_shape_and_strides(
            vec![2, 1],
            vec![usize::MAX / 2, 1],
            DType::F16,
            Device::Cpu,
        )
        .expect_err("span times element width overflows");
        assert!(matches!(wrapping, TensorMetaError::SpanOverflow { .. }));

        let unaddressable = TensorMeta::from_shape_and_strides(
            vec![2],
            vec![usize::MAX / 16],
            DType::F64,
            Device::Cpu,
        )
        .expect_err("byte length exceeds the largest allocation");
        assert!(matches!(unaddressable, TensorMetaError::SpanOverflow { .. }));

        TensorMeta::from_shape_and_strides(vec![2], vec![1 << 40], DType::F32, Device::Cpu)
            .expect("huge but describable spans still validate");
    }

    #[test]
    fn dtype_elements_round_trip_through_bytes() {
        for dtype in DType::all().iter().copied() {
            let mut bytes = vec![0u8; dtype.size_in_bytes() * 3];
            dtype
                .write_element(&mut bytes, 2, 0.5)
                .expect("write should fit");
            assert_eq!(dtype.read_element(&bytes, 2).expect("read should fit"), 0.5);
            assert_eq!(dtype.read_element(&bytes, 0).expect("read should fit"), 0.0);
            assert!(matches!(
                dtype.read_element(&bytes, 3),
                Err(TensorMetaError::StorageOutOfBounds {
                    index: 3,
                    available: 3
                })
            ));
        }
    }

    #[test]
    fn narrow_dtypes_round_to_their_precision() {
        let value = 1.0 + 1.0 / 4096.0;
        assert_eq!(DType::F16.round(value), 1.0);
        assert_eq!(DType::BF16.round(1.0 + 1.0 / 512.0), 1.0);
        assert_eq!(DType::F32.round(value), value);
        assert_eq!(DType::F64.round(0.1), 0.1);
        assert_eq!(DType::from_name("bf16"), Some(DType::BF16));
        assert_eq!(DType::from_name("i8"), None);
    }

    #[test]
    fn compatibility_checks_dtype_and_device() {
        let lhs = TensorMeta::from_shape(vec![2], DType::F16, Device::Cpu);
        let rhs = TensorMeta::from_shape(vec![2], DType::F32, Device::Cpu);
        assert!(ensure_compatible(&lhs, &lhs).is_ok());
        assert!(matches!(
            ensure_compatible(&lhs, &rhs),
            Err(TensorCompatError::DTypeMismatch {
                lhs: DType::F16,
                rhs: DType::F32
            })
        ));

        let remote = TensorMeta::from_shape(vec![2], DType::F16, Device::Nvidia);
        assert!(matches!(
            ensure_compatible(&lhs, &remote),
            Err(TensorCompatError::DeviceMismatch {
                lhs: Device::Cpu,
                rhs: Device::Nvidia
            })
        ));
    }

    #[test]
    fn status_codes_decode_to_names() {
        assert_eq!(Status::BadTensorStrides.code(), 12);
        assert_eq!(Status::from_code(12), Some(Status::BadTensorStrides));
        assert_eq!(Status::from_code(9), None);
        assert_eq!(decode_status(13), "STATUS_INSUFFICIENT_WORKSPACE");
        assert_eq!(decode_status(99), "UNKNOWN_STATUS(99)");
        assert_eq!(decode_status(Status::Success.code()), "STATUS_SUCCESS");
        assert_eq!(
            Status::BadTensorDtype.to_string(),
            "STATUS_BAD_TENSOR_DTYPE (code 10)"
        );
    }

    #[test]
    fn destroyed_descriptor_is_invalid_for_every_clone() {
        let meta = TensorMeta::from_shape(vec![13, 4], DType::F32, Device::Cpu);
        let view = TensorDescriptor::new(meta.clone());
        let held_by_library = view.clone();
        assert_eq!(held_by_library.meta().expect("live view"), meta);

        assert!(view.destroy());
        assert!(!view.destroy(), "second destroy is a no-op");
        assert_eq!(held_by_library.meta(), Err(Status::NullPointer));
        assert_eq!(view.id(), held_by_library.id());
    }

    proptest! {
        #[test]
        fn prop_contiguous_stride_contract(shape in prop::collection::vec(1usize..=4, 1..=4)) {
            let strides = contiguous_strides(shape.as_slice());
            prop_assert_eq!(strides.len(), shape.len());
            prop_assert_eq!(strides.last().copied(), Some(1));
        }

        #[test]
        fn prop_dense_offsets_enumerate_storage(shape in prop::collection::vec(1usize..=5, 1..=4)) {
            let meta = TensorMeta::from_shape(shape.clone(), DType::F32, Device::Cpu);
            let offsets = meta.storage_offsets();
            prop_assert_eq!(offsets, (0..meta.numel()).collect::<Vec<_>>());
            prop_assert_eq!(meta.storage_span(), meta.numel());
        }

        #[test]
        fn prop_broadcast_iff_zero_stride_on_wide_dim(
            dims in prop::collection::vec((1usize..=4, 0usize..=3), 1..=4),
        ) {
            let shape = dims.iter().map(|(size, _)| *size).collect::<Vec<_>>();
            let strides = dims.iter().map(|(_, stride)| *stride).collect::<Vec<_>>();
            let meta = TensorMeta::from_shape_and_strides(shape, strides, DType::F16, Device::Cpu)
                .expect("small layouts always validate");
            let expected = dims.iter().any(|(size, stride)| *stride == 0 && *size > 1);
            prop_assert_eq!(meta.is_broadcast(), expected);
            prop_assert_eq!(meta.broadcast_dims().is_empty(), !expected);
        }

        #[test]
        fn prop_offsets_stay_inside_span(
            dims in prop::collection::vec((1usize..=4, 0usize..=6), 1..=4),
        ) {
            let shape = dims.iter().map(|(size, _)| *size).collect::<Vec<_>>();
            let strides = dims.iter().map(|(_, stride)| *stride).collect::<Vec<_>>();
            let meta = TensorMeta::from_shape_and_strides(shape, strides, DType::F32, Device::Cpu)
                .expect("small layouts always validate");
            let span = meta.storage_span();
            prop_assert!(meta.storage_offsets().iter().all(|offset| *offset < span));
        }

        #[test]
        fn prop_rank_stride_mismatch_fail_closed(
            shape in prop::collection::vec(1usize..=4, 1..=4),
            extra in 1usize..=3,
        ) {
            let strides = vec![1usize; shape.len() + extra];
            let err = TensorMeta::from_shape_and_strides(shape, strides, DType::F32, Device::Cpu)
                .expect_err("rank/stride mismatch must fail");
            let is_rank_mismatch = matches!(err, TensorMetaError::RankStrideMismatch { .. });
            prop_assert!(is_rank_mismatch, "unexpected error: {}", err);
        }
    }
}
