#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use oc_core::{Device, Status, TensorMeta};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    Mismatch { expected: Device, actual: Device },
    Unsupported { device: Device },
    OutOfBounds { needed: usize, available: usize },
    Poisoned,
}

impl DeviceError {
    #[must_use]
    pub fn status(self) -> Status {
        match self {
            Self::Mismatch { .. } | Self::OutOfBounds { .. } => Status::BadParam,
            Self::Unsupported { .. } => Status::DeviceTypeNotSupported,
            Self::Poisoned => Status::InternalError,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::Unsupported { device } => {
                write!(f, "no backend available for device {}", device.name())
            }
            Self::OutOfBounds { needed, available } => write!(
                f,
                "device buffer too small: needed={needed}, available={available}"
            ),
            Self::Poisoned => write!(f, "device buffer lock poisoned"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<DeviceError> for Status {
    fn from(value: DeviceError) -> Self {
        value.status()
    }
}

/// Library handle bound to one device. Clones share the synchronize counter.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    device: Device,
    syncs: Arc<AtomicU64>,
}

impl DeviceHandle {
    pub fn create(device: Device) -> Result<Self, DeviceError> {
        match device {
            Device::Cpu => Ok(Self {
                device,
                syncs: Arc::new(AtomicU64::new(0)),
            }),
            other => Err(DeviceError::Unsupported { device: other }),
        }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Blocks until queued work finishes. Host execution is synchronous, so
    /// this only records that a barrier was requested.
    pub fn synchronize(&self) -> Result<(), DeviceError> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream {
    id: u64,
    device: Device,
}

impl Stream {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            device,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }
}

/// Device-resident byte buffer. Clones alias the same storage.
#[derive(Debug, Clone)]
pub struct DevicePtr {
    id: u64,
    device: Device,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl DevicePtr {
    #[must_use]
    pub fn allocate(device: Device, len: usize) -> Self {
        Self::from_bytes(device, vec![0u8; len])
    }

    #[must_use]
    pub fn from_bytes(device: Device, bytes: Vec<u8>) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            device,
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> Result<usize, DeviceError> {
        self.with_bytes(<[u8]>::len)
    }

    pub fn is_empty(&self) -> Result<bool, DeviceError> {
        self.with_bytes(<[u8]>::is_empty)
    }

    pub fn with_bytes<R>(&self, read: impl FnOnce(&[u8]) -> R) -> Result<R, DeviceError> {
        let guard = self.bytes.lock().map_err(|_| DeviceError::Poisoned)?;
        Ok(read(&guard))
    }

    pub fn with_bytes_mut<R>(&self, write: impl FnOnce(&mut [u8]) -> R) -> Result<R, DeviceError> {
        let mut guard = self.bytes.lock().map_err(|_| DeviceError::Poisoned)?;
        Ok(write(&mut guard))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, DeviceError> {
        self.with_bytes(<[u8]>::to_vec)
    }

    /// Copies `src` into the front of the buffer.
    pub fn copy_from_host(&self, src: &[u8]) -> Result<(), DeviceError> {
        self.with_bytes_mut(|dst| {
            if dst.len() < src.len() {
                return Err(DeviceError::OutOfBounds {
                    needed: src.len(),
                    available: dst.len(),
                });
            }
            dst[..src.len()].copy_from_slice(src);
            Ok(())
        })?
    }

    #[must_use]
    pub fn same_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

/// Scratch memory sized from a descriptor's workspace query. A zero-byte
/// workspace carries no buffer.
#[derive(Debug, Clone)]
pub struct Workspace {
    size: usize,
    ptr: Option<DevicePtr>,
}

impl Workspace {
    #[must_use]
    pub fn new(device: Device, size: usize) -> Self {
        let ptr = (size > 0).then(|| DevicePtr::allocate(device, size));
        Self { size, ptr }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn ptr(&self) -> Option<&DevicePtr> {
        self.ptr.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ensure_meta_device(&self, meta: &TensorMeta) -> Result<(), DeviceError> {
        self.ensure(meta.device())
    }

    pub fn ensure_ptr_device(&self, ptr: &DevicePtr) -> Result<(), DeviceError> {
        self.ensure(ptr.device())
    }

    fn ensure(&self, actual: Device) -> Result<(), DeviceError> {
        if actual != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use oc_core::{DType, Device, Status, TensorMeta};
    use proptest::prelude::*;

    use super::{DeviceError, DeviceGuard, DeviceHandle, DevicePtr, Stream, Workspace};

    #[test]
    fn cpu_handle_is_created_and_counts_syncs() {
        let handle = DeviceHandle::create(Device::Cpu).expect("cpu handle should exist");
        assert_eq!(handle.device(), Device::Cpu);
        assert_eq!(handle.sync_count(), 0);

        let shared = handle.clone();
        handle.synchronize().expect("sync should succeed");
        shared.synchronize().expect("sync should succeed");
        assert_eq!(handle.sync_count(), 2);
    }

    #[test]
    fn accelerator_handles_are_unsupported() {
        for device in Device::all().iter().copied().filter(|d| *d != Device::Cpu) {
            let err = DeviceHandle::create(device).expect_err("only cpu has a backend");
            assert_eq!(err, DeviceError::Unsupported { device });
            assert_eq!(err.status(), Status::DeviceTypeNotSupported);
            assert!(err.to_string().contains(device.name()));
        }
    }

    #[test]
    fn cloned_pointers_alias_storage() {
        let ptr = DevicePtr::allocate(Device::Cpu, 8);
        let alias = ptr.clone();
        let other = DevicePtr::allocate(Device::Cpu, 8);
        assert!(ptr.same_storage(&alias));
        assert!(!ptr.same_storage(&other));

        alias.copy_from_host(&[1, 2, 3]).expect("copy should fit");
        assert_eq!(
            ptr.to_vec().expect("read back"),
            vec![1, 2, 3, 0, 0, 0, 0, 0]
        );
        assert_eq!(ptr.len().expect("len"), 8);
    }

    #[test]
    fn copy_from_host_rejects_oversized_source() {
        let ptr = DevicePtr::allocate(Device::Cpu, 2);
        let err = ptr
            .copy_from_host(&[0; 3])
            .expect_err("oversized copy must fail");
        assert!(matches!(
            err,
            DeviceError::OutOfBounds {
                needed: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn zero_sized_workspace_has_no_buffer() {
        let empty = Workspace::new(Device::Cpu, 0);
        assert_eq!(empty.size(), 0);
        assert!(empty.ptr().is_none());

        let sized = Workspace::new(Device::Cpu, 64);
        let ptr = sized.ptr().expect("sized workspace allocates");
        assert_eq!(ptr.len().expect("len"), 64);
        assert!(!ptr.is_empty().expect("is_empty"));
    }

    #[test]
    fn guard_rejects_mismatched_device() {
        let meta = TensorMeta::from_shape(vec![2], DType::F32, Device::Nvidia);
        let guard = DeviceGuard::new(Device::Cpu);
        let err = guard
            .ensure_meta_device(&meta)
            .expect_err("mismatched device should fail closed");
        assert!(matches!(
            err,
            DeviceError::Mismatch {
                expected: Device::Cpu,
                actual: Device::Nvidia
            }
        ));
        assert_eq!(Status::from(err), Status::BadParam);

        let ptr = DevicePtr::allocate(Device::Cpu, 4);
        assert!(guard.ensure_ptr_device(&ptr).is_ok());
    }

    #[test]
    fn streams_get_distinct_ids() {
        let first = Stream::new(Device::Cpu);
        let second = Stream::new(Device::Cpu);
        assert_ne!(first.id(), second.id());
        assert_eq!(first.device(), Device::Cpu);
    }

    proptest! {
        #[test]
        fn prop_copy_round_trips_prefix(
            payload in prop::collection::vec(any::<u8>(), 0..=32),
            slack in 0usize..=8,
        ) {
            let ptr = DevicePtr::allocate(Device::Cpu, payload.len() + slack);
            ptr.copy_from_host(&payload).expect("copy fits");
            let stored = ptr.to_vec().expect("read back");
            prop_assert_eq!(&stored[..payload.len()], payload.as_slice());
            prop_assert!(stored[payload.len()..].iter().all(|byte| *byte == 0));
        }
    }
}
