use std::fmt;

use oc_autograd::{AutogradError, DenseTensor, Tape, expand_values, sum_dim_keepdim};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    Autograd(AutogradError),
    MissingGradient,
    ReductionMismatch { from: Vec<usize>, to: Vec<usize> },
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Autograd(error) => write!(f, "reference autograd failed: {error}"),
            Self::MissingGradient => write!(f, "reference backward produced no input gradient"),
            Self::ReductionMismatch { from, to } => {
                write!(f, "cannot reduce reference gradient {from:?} to {to:?}")
            }
        }
    }
}

impl std::error::Error for OracleError {}

impl From<AutogradError> for OracleError {
    fn from(value: AutogradError) -> Self {
        Self::Autograd(value)
    }
}

/// Reference GeLU backward: differentiates the tanh-approximated GeLU at
/// `input`, seeds the backward pass with `grad_output` expanded to the
/// output shape, then reduces the input gradient to `grad_input_shape`.
pub fn gelu_backward_reference(
    grad_output: &DenseTensor,
    input: &DenseTensor,
    grad_input_shape: &[usize],
) -> Result<DenseTensor, OracleError> {
    let mut tape = Tape::new();
    let x = tape.leaf(input.clone(), true);
    let y = tape.gelu_tanh(x)?;
    let out_shape = tape.value(y)?.shape().to_vec();
    let seed = expand_values(grad_output, &out_shape)?;
    let report = tape.backward_with_grad(y, seed)?;
    let grad = report
        .gradient(x)
        .cloned()
        .ok_or(OracleError::MissingGradient)?;
    reduce_to_destination(grad, grad_input_shape)
}

/// Sums every dimension the destination does not carry (beyond its rank, or
/// extent 1 there) keeping it as extent 1, then drops leading unit axes until
/// the ranks agree. Dimensions are aligned from the left, so the result can
/// still differ from `target`; the comparator reports that as a mismatch.
pub fn reduce_to_destination(
    grad: DenseTensor,
    target: &[usize],
) -> Result<DenseTensor, OracleError> {
    if grad.shape() == target {
        return Ok(grad);
    }
    let mut reduced = grad;
    for dim in 0..reduced.ndim() {
        if dim >= target.len() || target[dim] == 1 {
            reduced = sum_dim_keepdim(&reduced, dim)?;
        }
    }
    while reduced.ndim() > target.len() {
        if reduced.shape()[0] != 1 {
            return Err(OracleError::ReductionMismatch {
                from: reduced.shape().to_vec(),
                to: target.to_vec(),
            });
        }
        let shape = reduced.shape()[1..].to_vec();
        reduced = DenseTensor::new(shape, reduced.into_values())?;
    }
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use oc_autograd::DenseTensor;
    use oc_kernel_cpu::gelu_backward_scalar;
    use proptest::prelude::*;

    use super::{OracleError, gelu_backward_reference, reduce_to_destination};

    fn dense(shape: &[usize], values: Vec<f64>) -> DenseTensor {
        DenseTensor::new(shape.to_vec(), values).expect("shape and values agree")
    }

    #[test]
    fn reference_matches_closed_form_derivative() {
        let xs = vec![-2.0, -0.5, 0.0, 0.25, 1.0, 1.75];
        let dys = vec![1.0, -0.5, 2.0, 0.75, -1.25, 0.5];
        let grad = gelu_backward_reference(
            &dense(&[2, 3], dys.clone()),
            &dense(&[2, 3], xs.clone()),
            &[2, 3],
        )
        .expect("reference should evaluate");
        assert_eq!(grad.shape(), &[2, 3]);
        for ((actual, x), dy) in grad.values().iter().zip(&xs).zip(&dys) {
            let expected = dy * gelu_backward_scalar(*x);
            assert!((actual - expected).abs() <= 1e-12, "x={x}: {actual} vs {expected}");
        }
    }

    #[test]
    fn narrower_grad_output_is_expanded_to_output_shape() {
        let xs = vec![0.5, -1.0, 1.5, 0.5, -1.0, 1.5];
        let grad = gelu_backward_reference(
            &dense(&[3], vec![1.0, 2.0, 3.0]),
            &dense(&[2, 3], xs),
            &[2, 3],
        )
        .expect("expanded seed");
        let row = &grad.values()[0..3];
        assert_eq!(row, &grad.values()[3..6]);
        assert!((row[1] - 2.0 * gelu_backward_scalar(-1.0)).abs() <= 1e-12);
    }

    #[test]
    fn reduction_sums_unit_destination_dims_and_drops_leading_axes() {
        let grad = dense(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rows = reduce_to_destination(grad.clone(), &[1, 3]).expect("keepdim");
        assert_eq!(rows.values(), &[5.0, 7.0, 9.0]);
        let cols = reduce_to_destination(grad.clone(), &[2, 1]).expect("keepdim");
        assert_eq!(cols.values(), &[6.0, 15.0]);

        let lifted = dense(&[1, 2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let squeezed = reduce_to_destination(lifted, &[2, 3]).expect("squeeze");
        assert_eq!(squeezed.shape(), &[2, 1]);
        assert_eq!(squeezed.values(), &[6.0, 15.0]);
    }

    #[test]
    fn reduction_rejects_non_unit_leading_axis() {
        let grad = dense(&[2, 3], vec![0.0; 6]);
        let err = reduce_to_destination(grad, &[3]).expect_err("leading extent 2 cannot squeeze");
        assert!(matches!(err, OracleError::ReductionMismatch { .. }));
    }

    proptest! {
        #[test]
        fn prop_matching_shape_is_untouched(
            values in prop::collection::vec(-4.0f64..4.0, 1..=24),
        ) {
            let shape = [values.len()];
            let grad = dense(&shape, values.clone());
            let out = reduce_to_destination(grad, &shape).expect("identity");
            prop_assert_eq!(out.values(), values.as_slice());
        }

        #[test]
        fn prop_full_reduction_preserves_total(
            rows in 1usize..=5,
            cols in 1usize..=5,
            seed in -3.0f64..3.0,
        ) {
            let values = (0..rows * cols).map(|idx| seed + idx as f64).collect::<Vec<_>>();
            let total = values.iter().sum::<f64>();
            let out = reduce_to_destination(dense(&[rows, cols], values), &[1, 1]).expect("reduce");
            prop_assert!((out.values()[0] - total).abs() <= 1e-9);
        }
    }
}
