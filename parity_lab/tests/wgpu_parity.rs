//! GPU parity checks. Each test returns early when no wgpu adapter is available.

use linear_core::{config::Epilogue, Precision};
use parity_lab::{
    build_operator, build_operator_with, compare, run_forward_backward, LinearSpec, Operator,
    OperatorKind, ParityError,
};

fn gpu_operator(spec: LinearSpec, seed: u64) -> Option<Operator> {
    match build_operator_with(OperatorKind::Wgpu, spec, seed) {
        Ok(op) => Some(op),
        Err(ParityError::BackendUnavailable(reason)) => {
            eprintln!("skipping wgpu parity: {reason}");
            None
        }
        Err(err) => panic!("unexpected construction error: {err}"),
    }
}

#[test]
fn wgpu_matches_reference_for_literal_configuration() {
    for precision in [Precision::Float32, Precision::BFloat16] {
        let spec = LinearSpec::new(16, 1, precision);
        let Some(mut gpu) = gpu_operator(spec, 0xC0FFEE) else {
            return;
        };
        let mut reference = build_operator(OperatorKind::Reference, 16, 1, precision, 0xC0FFEE).unwrap();
        assert!(gpu.weight().value().bit_eq(reference.weight().value()));

        let lhs = run_forward_backward(&mut gpu, 0xBEEF, 28, precision).unwrap();
        let rhs = run_forward_backward(&mut reference, 0xBEEF, 28, precision).unwrap();
        compare(&lhs, &rhs, precision)
            .ensure_passed()
            .unwrap_or_else(|err| panic!("{precision}: {err}"));
    }
}

#[test]
fn wgpu_relu_without_bias_matches_reference() {
    let spec = LinearSpec::new(33, 70, Precision::Float32)
        .with_bias(false)
        .with_epilogue(Epilogue::Relu);
    let Some(mut gpu) = gpu_operator(spec, 3) else {
        return;
    };
    let mut reference = build_operator_with(OperatorKind::Reference, spec, 3).unwrap();
    let lhs = run_forward_backward(&mut gpu, 4, 65, Precision::Float32).unwrap();
    let rhs = run_forward_backward(&mut reference, 4, 65, Precision::Float32).unwrap();
    assert!(lhs.bias.is_none());
    compare(&lhs, &rhs, Precision::Float32)
        .ensure_passed()
        .unwrap_or_else(|err| panic!("{err}"));
}

#[test]
fn wgpu_handles_outputs_beyond_one_dispatch_row() {
    // The 4096 x 1100 weight gradient needs more than 65535 workgroups.
    let spec = LinearSpec::new(4096, 1100, Precision::Float32);
    let Some(mut gpu) = gpu_operator(spec, 21) else {
        return;
    };
    let mut reference = build_operator_with(OperatorKind::Reference, spec, 21).unwrap();
    let lhs = run_forward_backward(&mut gpu, 22, 2, Precision::Float32).unwrap();
    let rhs = run_forward_backward(&mut reference, 22, 2, Precision::Float32).unwrap();
    compare(&lhs, &rhs, Precision::Float32)
        .ensure_passed()
        .unwrap_or_else(|err| panic!("{err}"));
}
