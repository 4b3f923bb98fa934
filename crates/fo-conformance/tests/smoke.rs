use std::fs;
use std::path::PathBuf;

use fo_api::FrankenOpsSession;
use fo_autograd::AutogradError;
use fo_conformance::{
    HarnessConfig, emit_differential_report, emit_e2e_forensics_matrix_filtered,
    run_dtype_support_conformance, run_gradient_conformance, run_jit_conformance,
    run_out_variant_conformance, run_smoke, run_variant_conformance,
};
use fo_core::{DType, DenseTensor, Device, ExecutionMode, TensorData};
use fo_runtime::EvidenceKind;

fn tensor(dtype: DType, shape: &[usize], values: &[f64]) -> DenseTensor {
    DenseTensor::from_values(
        TensorData::from_f64_values(dtype, values),
        shape.to_vec(),
        Device::Cpu,
    )
    .expect("test tensor should build")
}

fn scratch_path(stem: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{stem}_{}.out", std::process::id()))
}

#[test]
fn smoke_report_is_stable() {
    let cfg = HarnessConfig::default_paths();
    let report = run_smoke(&cfg);
    assert_eq!(report.suite, "frankenops_smoke");
    assert!(report.fixture_count >= 6);
    assert_eq!(report.oracle_present, cfg.oracle_root.exists());
    assert_eq!(report.cases_total, report.cases_passed);

    let fixture_path = cfg.fixture_root.join("dtype_support_matrix.json");
    assert!(fixture_path.exists());
}

#[test]
fn dtype_support_fixture_executes_in_both_modes() {
    let cfg = HarnessConfig::default_paths();
    let (strict_report, _) = run_dtype_support_conformance(&cfg, ExecutionMode::Strict)
        .expect("strict dtype support should run");
    let (hardened_report, _) = run_dtype_support_conformance(&cfg, ExecutionMode::Hardened)
        .expect("hardened dtype support should run");

    assert_eq!(strict_report.cases_total, strict_report.cases_passed);
    assert_eq!(hardened_report.cases_total, hardened_report.cases_passed);
}

#[test]
fn gradient_fixture_executes_in_both_modes() {
    let cfg = HarnessConfig::default_paths();
    let (strict_report, _) = run_gradient_conformance(&cfg, ExecutionMode::Strict)
        .expect("strict gradient should run");
    let (hardened_report, _) = run_gradient_conformance(&cfg, ExecutionMode::Hardened)
        .expect("hardened gradient should run");

    assert_eq!(strict_report.cases_total, strict_report.cases_passed);
    assert_eq!(hardened_report.cases_total, hardened_report.cases_passed);
}

#[test]
fn variant_fixture_executes_in_both_modes() {
    let cfg = HarnessConfig::default_paths();
    let (strict_report, _) =
        run_variant_conformance(&cfg, ExecutionMode::Strict).expect("strict variant should run");
    let (hardened_report, _) = run_variant_conformance(&cfg, ExecutionMode::Hardened)
        .expect("hardened variant should run");

    assert_eq!(strict_report.cases_total, strict_report.cases_passed);
    assert_eq!(hardened_report.cases_total, hardened_report.cases_passed);
}

#[test]
fn jit_fixture_executes_in_both_modes() {
    let cfg = HarnessConfig::default_paths();
    let (strict_report, _) =
        run_jit_conformance(&cfg, ExecutionMode::Strict).expect("strict jit should run");
    let (hardened_report, _) =
        run_jit_conformance(&cfg, ExecutionMode::Hardened).expect("hardened jit should run");

    assert_eq!(strict_report.cases_total, strict_report.cases_passed);
    assert_eq!(hardened_report.cases_total, hardened_report.cases_passed);
}

#[test]
fn out_variant_fixture_executes_in_both_modes() {
    let cfg = HarnessConfig::default_paths();
    let (strict_report, _) = run_out_variant_conformance(&cfg, ExecutionMode::Strict)
        .expect("strict out-variant should run");
    let (hardened_report, _) = run_out_variant_conformance(&cfg, ExecutionMode::Hardened)
        .expect("hardened out-variant should run");

    assert_eq!(strict_report.cases_total, strict_report.cases_passed);
    assert_eq!(hardened_report.cases_total, hardened_report.cases_passed);
}

#[test]
fn session_add_backward_path_executes_in_strict_mode() {
    let mut session =
        FrankenOpsSession::new(ExecutionMode::Strict).expect("session should build");
    let x = session
        .tensor_variable(tensor(DType::F64, &[3], &[1.0, 2.0, 3.0]))
        .expect("lhs variable should build");
    let y = session
        .tensor_variable(tensor(DType::F64, &[3], &[4.0, 5.0, 6.0]))
        .expect("rhs variable should build");
    let z = session.call_function("add", &[x, y]).expect("add should run");
    assert_eq!(
        session.values_f64(z).expect("values should resolve"),
        vec![5.0, 7.0, 9.0]
    );

    let report = session.backward(z).expect("backward should run");
    let x_grad = session.grad_of(&report, x).expect("x gradient should exist");
    let y_grad = session.grad_of(&report, y).expect("y gradient should exist");
    assert_eq!(
        session.values_f64(x_grad).expect("grad values"),
        vec![1.0, 1.0, 1.0]
    );
    assert_eq!(
        session.values_f64(y_grad).expect("grad values"),
        vec![1.0, 1.0, 1.0]
    );
}

#[test]
fn session_mul_backward_path_executes_in_strict_mode() {
    let mut session =
        FrankenOpsSession::new(ExecutionMode::Strict).expect("session should build");
    let x = session
        .tensor_variable(tensor(DType::F64, &[2], &[2.0, 4.0]))
        .expect("lhs variable should build");
    let y = session
        .tensor_variable(tensor(DType::F64, &[2], &[3.0, 2.0]))
        .expect("rhs variable should build");
    let z = session.call_function("mul", &[x, y]).expect("mul should run");
    assert_eq!(
        session.values_f64(z).expect("values should resolve"),
        vec![6.0, 8.0]
    );

    let report = session.backward(z).expect("backward should run");
    let x_grad = session.grad_of(&report, x).expect("x gradient should exist");
    let y_grad = session.grad_of(&report, y).expect("y gradient should exist");
    assert_eq!(session.values_f64(x_grad).expect("grad values"), vec![3.0, 2.0]);
    assert_eq!(session.values_f64(y_grad).expect("grad values"), vec![2.0, 4.0]);
}

#[test]
fn session_div_promotes_integer_inputs() {
    let mut session =
        FrankenOpsSession::new(ExecutionMode::Strict).expect("session should build");
    let x = session.tensor_constant(tensor(DType::I32, &[2], &[7.0, -8.0]));
    let y = session.tensor_constant(tensor(DType::I32, &[2], &[2.0, 5.0]));
    let z = session.call_function("div", &[x, y]).expect("div should run");
    assert_eq!(
        session.meta_of(z).expect("output meta").dtype(),
        DType::F32
    );
    let values = session.values_f64(z).expect("values should resolve");
    assert!((values[0] - 3.5).abs() <= 1e-6);
    assert!((values[1] + 1.6).abs() <= 1e-6);
}

#[test]
fn session_fails_closed_on_bool_inputs() {
    let mut session =
        FrankenOpsSession::new(ExecutionMode::Strict).expect("session should build");
    let x = session.tensor_constant(tensor(DType::Bool, &[2], &[1.0, 0.0]));
    let y = session.tensor_constant(tensor(DType::Bool, &[2], &[0.0, 1.0]));
    let err = session
        .call_function("add", &[x, y])
        .expect_err("bool inputs must fail closed");
    assert!(err.is_unsupported_dtype(), "unexpected error: {err}");
}

#[test]
fn session_rejects_out_shape_mismatch_and_preserves_dest() {
    let mut session =
        FrankenOpsSession::new(ExecutionMode::Strict).expect("session should build");
    let x = session.tensor_constant(tensor(DType::F64, &[2], &[1.0, 2.0]));
    let y = session.tensor_constant(tensor(DType::F64, &[2], &[3.0, 4.0]));
    let dest = session.tensor_constant(DenseTensor::zeros(vec![3], DType::F64, Device::Cpu));
    session
        .call_out("add", &[x, y], dest)
        .expect_err("shape-mismatched destination must fail closed");
    assert_eq!(
        session.values_f64(dest).expect("dest values"),
        vec![0.0, 0.0, 0.0]
    );
}

#[test]
fn session_rejects_inplace_rewrite_of_leaf_variables() {
    let mut session =
        FrankenOpsSession::new(ExecutionMode::Strict).expect("session should build");
    let x = session
        .tensor_variable(tensor(DType::F64, &[2], &[1.0, 2.0]))
        .expect("leaf variable should build");
    let y = session.tensor_constant(tensor(DType::F64, &[2], &[3.0, 4.0]));
    let err = session
        .call_inplace(x, "add_", &[y])
        .expect_err("leaf rewrite must fail closed");
    assert!(matches!(
        err,
        fo_api::ApiError::Op {
            source: AutogradError::InplaceOnLeafVariable { .. },
            ..
        }
    ));
}

#[test]
fn registry_gaps_match_published_surface() {
    let session = FrankenOpsSession::new(ExecutionMode::Strict).expect("session should build");
    let registry = session.registry();
    assert!(!registry.has_method("sigmoid"));
    assert!(!registry.has_out("sigmoid"));
    assert!(registry.has_method("log"));
    assert!(registry.resolve_inplace("log_").is_err());
    assert!(registry.has_out("add"));
}

#[test]
fn differential_report_round_trips_from_disk() {
    let cfg = HarnessConfig::default_paths();
    let output = scratch_path("fo_smoke_differential");
    let report = emit_differential_report(
        &cfg,
        output.as_path(),
        &[ExecutionMode::Strict, ExecutionMode::Hardened],
    )
    .expect("differential report should emit");
    assert!(report.oracle.available, "{}", report.oracle.message);
    assert_eq!(report.blocking_drifts, 0);
    assert_eq!(report.failed_checks, 0);

    let raw = fs::read_to_string(output.as_path()).expect("report should be written");
    let parsed: serde_json::Value = serde_json::from_str(&raw).expect("report should parse");
    assert_eq!(parsed["total_checks"].as_u64(), Some(report.total_checks as u64));
    let _ = fs::remove_file(output.as_path());
}

#[test]
fn e2e_matrix_scoped_to_gradient_packet_stays_green() {
    let cfg = HarnessConfig::default_paths();
    let output = scratch_path("fo_smoke_e2e_gradient");
    let summary = emit_e2e_forensics_matrix_filtered(
        &cfg,
        output.as_path(),
        &[ExecutionMode::Strict],
        Some("FO-OPS-002"),
    )
    .expect("scoped matrix should emit");
    assert!(summary.log_entries > 0);
    assert_eq!(summary.failed_entries, 0);

    let raw = fs::read_to_string(output.as_path()).expect("matrix should be written");
    for line in raw.lines() {
        let entry: serde_json::Value = serde_json::from_str(line).expect("entry should parse");
        assert_eq!(entry["packet_id"], "FO-OPS-002");
        assert!(entry["extra_fields"]["runtime_evidence"]["total_entries"]
            .as_u64()
            .is_some());
    }
    let _ = fs::remove_file(output.as_path());
}

#[test]
fn session_ledger_records_dispatch_evidence() {
    let mut session =
        FrankenOpsSession::new(ExecutionMode::Strict).expect("session should build");
    let x = session.tensor_constant(tensor(DType::F64, &[2], &[1.0, 2.0]));
    let _ = session.call_function("neg", &[x]).expect("neg should run");
    let ledger = session.evidence();
    assert!(!ledger.is_empty());
    assert!(
        ledger
            .entries()
            .iter()
            .any(|entry| entry.kind == EvidenceKind::OpDispatched),
        "dispatch evidence should be recorded"
    );
}
