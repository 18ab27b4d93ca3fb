//! Centralized storage for WGSL shader sources and their entry points.

pub mod compute {
    pub const LINEAR: &str = include_str!("kernels/linear.wgsl");

    /// Threads per workgroup declared by every linear entry point.
    pub const WORKGROUP_SIZE: u32 = 64;

    pub const FORWARD_ENTRY: &str = "linear_forward";
    pub const BACKWARD_INPUT_ENTRY: &str = "linear_backward_input";
    pub const BACKWARD_WEIGHT_ENTRY: &str = "linear_backward_weight";
    pub const BACKWARD_BIAS_ENTRY: &str = "linear_backward_bias";
}

#[cfg(test)]
mod tests {
    use super::*;
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    fn parse_and_validate(label: &str, source: &str) -> naga::Module {
        let module =
            naga::front::wgsl::parse_str(source).unwrap_or_else(|err| panic!("{label}: {err:?}"));
        let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
        validator
            .validate(&module)
            .unwrap_or_else(|err| panic!("{label}: {err:?}"));
        module
    }

    #[test]
    fn linear_shader_validates() {
        parse_and_validate("linear", compute::LINEAR);
    }

    #[test]
    fn linear_shader_exports_every_entry_point() {
        let module = parse_and_validate("linear", compute::LINEAR);
        for entry in [
            compute::FORWARD_ENTRY,
            compute::BACKWARD_INPUT_ENTRY,
            compute::BACKWARD_WEIGHT_ENTRY,
            compute::BACKWARD_BIAS_ENTRY,
        ] {
            let found = module.entry_points.iter().find(|ep| ep.name == entry);
            let ep = found.unwrap_or_else(|| panic!("missing entry point {entry}"));
            assert_eq!(ep.workgroup_size, [compute::WORKGROUP_SIZE, 1, 1]);
            let reads_grid = ep.function.arguments.iter().any(|arg| {
                matches!(
                    arg.binding,
                    Some(naga::Binding::BuiltIn(naga::BuiltIn::NumWorkGroups))
                )
            });
            assert!(reads_grid, "{entry} must index through the 2-D dispatch grid");
        }
    }

    #[test]
    fn dims_uniform_is_32_bytes_with_mode_at_offset_16() {
        let module = parse_and_validate("linear", compute::LINEAR);
        let (members, span) = module
            .types
            .iter()
            .find_map(|(_, ty)| match &ty.inner {
                naga::TypeInner::Struct { members, span } if ty.name.as_deref() == Some("LinearDims") => {
                    Some((members.clone(), *span))
                }
                _ => None,
            })
            .expect("LinearDims struct missing");
        assert_eq!(span, 32);
        assert_eq!(members.len(), 8);
        assert_eq!(members[4].name.as_deref(), Some("precision_mode"));
        assert_eq!(members[4].offset, 16);
    }
}
