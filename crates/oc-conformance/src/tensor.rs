use oc_autograd::DenseTensor;
use oc_core::{DType, Device, StrideSpec, TensorDescriptor, TensorMeta, TensorMetaError};
use oc_device::DevicePtr;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::cases::{InplaceMode, TestCase};
use crate::legality::{Operand, SkipReason, check_broadcast_operands};
use crate::protocol::CaseError;

/// Harness-owned tensor: the layout the harness keeps for itself, the
/// library-facing view that gets destroyed after descriptor creation, and
/// the device storage.
#[derive(Debug, Clone)]
pub struct TestTensor {
    meta: TensorMeta,
    view: TensorDescriptor,
    storage: DevicePtr,
}

impl TestTensor {
    /// Allocates exactly the storage span the layout addresses and fills it
    /// with uniform values in [-2, 2), rounded through the dtype. A span the
    /// host cannot allocate is a construction error.
    pub fn allocate(
        shape: &[usize],
        spec: &StrideSpec,
        dtype: DType,
        device: Device,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self, CaseError> {
        let meta = TensorMeta::from_spec(shape, spec, dtype, device)?;
        let len = meta.storage_bytes();
        let mut bytes: Vec<u8> = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| TensorMetaError::StorageAllocation { bytes: len })?;
        bytes.resize(len, 0);
        for index in 0..meta.storage_span() {
            dtype.write_element(&mut bytes, index, rng.random_range(-2.0..2.0))?;
        }
        Ok(Self {
            view: TensorDescriptor::new(meta.clone()),
            storage: DevicePtr::from_bytes(device, bytes),
            meta,
        })
    }

    /// The same tensor under a second name: shared view and shared storage.
    #[must_use]
    pub fn alias_of(other: &Self) -> Self {
        other.clone()
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn view(&self) -> &TensorDescriptor {
        &self.view
    }

    #[must_use]
    pub fn raw_pointer(&self) -> &DevicePtr {
        &self.storage
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.meta.is_broadcast()
    }

    pub fn destroy_view(&self) {
        self.view.destroy();
    }

    /// Logical elements in row-major order, gathered through the strides.
    pub fn logical_values(&self) -> Result<Vec<f64>, CaseError> {
        let dtype = self.meta.dtype();
        let bytes = self.storage.to_vec()?;
        self.meta
            .storage_offsets()
            .into_iter()
            .map(|offset| dtype.read_element(&bytes, offset).map_err(CaseError::from))
            .collect()
    }

    pub fn to_dense(&self) -> Result<DenseTensor, CaseError> {
        let values = self.logical_values()?;
        Ok(DenseTensor::new(self.meta.shape().to_vec(), values)?)
    }
}

/// The three operands of one case, in allocation order.
#[derive(Debug, Clone)]
pub struct CaseOperands {
    pub grad_output: TestTensor,
    pub input: TestTensor,
    pub grad_input: TestTensor,
}

impl CaseOperands {
    pub fn construct(
        case: &TestCase,
        dtype: DType,
        device: Device,
        seed: u64,
    ) -> Result<Self, CaseError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let grad_output =
            TestTensor::allocate(&case.shape, &case.grad_output_stride, dtype, device, &mut rng)?;
        let input = TestTensor::allocate(&case.shape, &case.input_stride, dtype, device, &mut rng)?;
        let grad_input = match case.inplace {
            InplaceMode::OutOfPlace => TestTensor::allocate(
                &case.shape,
                &case.grad_input_stride,
                dtype,
                device,
                &mut rng,
            )?,
            InplaceMode::InplaceGradOutput => TestTensor::alias_of(&grad_output),
        };
        Ok(Self {
            grad_output,
            input,
            grad_input,
        })
    }

    #[must_use]
    pub fn is_aliased(&self) -> bool {
        self.grad_input
            .raw_pointer()
            .same_storage(self.grad_output.raw_pointer())
    }

    pub fn check_broadcast(&self) -> Result<(), SkipReason> {
        check_broadcast_operands(&[
            (Operand::GradOutput, self.grad_output.meta()),
            (Operand::Input, self.input.meta()),
            (Operand::GradInput, self.grad_input.meta()),
        ])
    }

    pub fn destroy_views(&self) {
        for tensor in [&self.grad_output, &self.input, &self.grad_input] {
            tensor.destroy_view();
        }
    }
}
