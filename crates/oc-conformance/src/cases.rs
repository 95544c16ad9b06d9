use oc_core::{DType, StrideSpec, format_dims};

/// How grad_input relates to grad_output storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InplaceMode {
    OutOfPlace,
    InplaceGradOutput,
}

impl InplaceMode {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::OutOfPlace => "OUT_OF_PLACE",
            Self::InplaceGradOutput => "INPLACE_GRAD_OUTPUT",
        }
    }
}

pub const DEFAULT_INPLACE_MODES: [InplaceMode; 2] =
    [InplaceMode::OutOfPlace, InplaceMode::InplaceGradOutput];

pub const DEFAULT_DTYPES: [DType; 3] = [DType::F16, DType::F32, DType::BF16];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseCase {
    pub shape: Vec<usize>,
    pub grad_output_stride: StrideSpec,
    pub input_stride: StrideSpec,
    pub grad_input_stride: StrideSpec,
}

impl BaseCase {
    #[must_use]
    pub fn new(
        shape: &[usize],
        grad_output_stride: Option<&[usize]>,
        input_stride: Option<&[usize]>,
        grad_input_stride: Option<&[usize]>,
    ) -> Self {
        let spec = |strides: Option<&[usize]>| strides.map_or(StrideSpec::Dense, StrideSpec::explicit);
        Self {
            shape: shape.to_vec(),
            grad_output_stride: spec(grad_output_stride),
            input_stride: spec(input_stride),
            grad_input_stride: spec(grad_input_stride),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestCase {
    pub index: usize,
    pub shape: Vec<usize>,
    pub grad_output_stride: StrideSpec,
    pub input_stride: StrideSpec,
    pub grad_input_stride: StrideSpec,
    pub inplace: InplaceMode,
}

impl TestCase {
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "shape:{} grad_output_stride:{} input_stride:{} grad_input_stride:{} inplace:{}",
            format_dims(&self.shape),
            self.grad_output_stride,
            self.input_stride,
            self.grad_input_stride,
            self.inplace.label()
        )
    }
}

/// Every base tuple crossed with every mode, base tuples outer.
#[must_use]
pub fn generate_cases(bases: &[BaseCase], modes: &[InplaceMode]) -> Vec<TestCase> {
    bases
        .iter()
        .flat_map(|base| modes.iter().map(move |mode| (base, *mode)))
        .enumerate()
        .map(|(index, (base, inplace))| TestCase {
            index,
            shape: base.shape.clone(),
            grad_output_stride: base.grad_output_stride.clone(),
            input_stride: base.input_stride.clone(),
            grad_input_stride: base.grad_input_stride.clone(),
            inplace,
        })
        .collect()
}

#[must_use]
pub fn default_base_cases() -> Vec<BaseCase> {
    vec![
        BaseCase::new(&[13, 4], None, None, None),
        BaseCase::new(&[13, 4], Some(&[10, 1]), Some(&[10, 1]), Some(&[10, 1])),
        BaseCase::new(&[13, 4], Some(&[0, 1]), None, None),
        BaseCase::new(&[13, 4, 4], None, None, None),
        BaseCase::new(
            &[13, 4, 4],
            Some(&[20, 4, 1]),
            Some(&[20, 4, 1]),
            Some(&[20, 4, 1]),
        ),
        BaseCase::new(&[13, 4, 4], Some(&[4, 0, 1]), Some(&[0, 4, 1]), None),
        BaseCase::new(&[16, 5632], None, None, None),
        BaseCase::new(
            &[16, 5632],
            Some(&[13312, 1]),
            Some(&[13312, 1]),
            Some(&[13312, 1]),
        ),
        BaseCase::new(&[4, 4, 5632], None, None, None),
        BaseCase::new(
            &[4, 4, 5632],
            Some(&[45056, 5632, 1]),
            Some(&[45056, 5632, 1]),
            Some(&[45056, 5632, 1]),
        ),
    ]
}

#[must_use]
pub fn default_cases() -> Vec<TestCase> {
    generate_cases(&default_base_cases(), &DEFAULT_INPLACE_MODES)
}

#[cfg(test)]
mod tests {
    use oc_core::StrideSpec;
    use proptest::prelude::*;

    use super::{
        BaseCase, DEFAULT_INPLACE_MODES, InplaceMode, default_base_cases, default_cases,
        generate_cases,
    };

    #[test]
    fn default_table_has_twenty_cases_in_order() {
        let cases = default_cases();
        assert_eq!(cases.len(), 20);
        assert_eq!(cases[0].inplace, InplaceMode::OutOfPlace);
        assert_eq!(cases[1].inplace, InplaceMode::InplaceGradOutput);
        assert_eq!(cases[0].shape, cases[1].shape);
        assert_eq!(cases[19].shape, vec![4, 4, 5632]);
        assert!(cases.iter().enumerate().all(|(idx, case)| case.index == idx));
    }

    #[test]
    fn label_renders_tuple_layouts() {
        let cases = default_cases();
        assert_eq!(
            cases[0].label(),
            "shape:(13, 4) grad_output_stride:None input_stride:None grad_input_stride:None inplace:OUT_OF_PLACE"
        );
        assert_eq!(
            cases[3].label(),
            "shape:(13, 4) grad_output_stride:(10, 1) input_stride:(10, 1) grad_input_stride:(10, 1) inplace:INPLACE_GRAD_OUTPUT"
        );
    }

    #[test]
    fn base_case_maps_missing_strides_to_dense() {
        let base = BaseCase::new(&[13, 4, 4], Some(&[4, 0, 1]), Some(&[0, 4, 1]), None);
        assert_eq!(base.grad_output_stride, StrideSpec::explicit(&[4, 0, 1]));
        assert_eq!(base.grad_input_stride, StrideSpec::Dense);
        assert_eq!(default_base_cases()[5], base);
    }

    proptest! {
        #[test]
        fn prop_generation_is_deterministic_and_exhaustive(
            extents in prop::collection::vec(1usize..=8, 1..=6),
            both_modes in any::<bool>(),
        ) {
            let bases = extents
                .iter()
                .map(|extent| BaseCase::new(&[*extent, 2], None, None, None))
                .collect::<Vec<_>>();
            let modes: &[InplaceMode] = if both_modes {
                &DEFAULT_INPLACE_MODES
            } else {
                &[InplaceMode::OutOfPlace]
            };

            let first = generate_cases(&bases, modes);
            let second = generate_cases(&bases, modes);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), bases.len() * modes.len());
            for (idx, case) in first.iter().enumerate() {
                prop_assert_eq!(&case.shape, &bases[idx / modes.len()].shape);
                prop_assert_eq!(case.inplace, modes[idx % modes.len()]);
            }
        }
    }
}
