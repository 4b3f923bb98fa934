//! Fixture-driven conformance suites for the frankenops operator registry.
//!
//! Each suite loads a JSON fixture, replays its cases against a
//! [`FrankenOpsSession`], and emits one structured forensic log line per case.
//! The differential harness replays recorded legacy-runtime snapshots and
//! classifies any drift against a per-packet allowlist.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use fo_api::{ApiError, FrankenOpsSession};
use fo_autograd::{AutogradError, GradcheckError, GradcheckOptions, NodeId};
use fo_core::{DType, DTypeSet, DenseTensor, Device, ExecutionMode, TensorData};
use fo_dispatch::DispatchError;
use fo_jit::{AliasProbe, TraceRecorder, check_alias_annotation};
use fo_opinfo::{OpInfo, SampleInput, find_op};
use fo_runtime::EvidenceLedger;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

mod logging;

pub use logging::{FORENSICS_SCHEMA_VERSION, StructuredCaseLog, mode_label};

pub const DTYPE_SUPPORT_SUITE: &str = "dtype_support";
pub const DTYPE_SUPPORT_PACKET: &str = "FO-OPS-001";
pub const GRADIENT_SUITE: &str = "gradient";
pub const GRADIENT_PACKET: &str = "FO-OPS-002";
pub const VARIANT_SUITE: &str = "variant_consistency";
pub const VARIANT_PACKET: &str = "FO-OPS-003";
pub const JIT_SUITE: &str = "jit_consistency";
pub const JIT_PACKET: &str = "FO-OPS-004";
pub const OUT_VARIANT_SUITE: &str = "out_variant";
pub const OUT_VARIANT_PACKET: &str = "FO-OPS-005";
pub const ORACLE_ELEMENTWISE_SUITE: &str = "oracle_elementwise";
pub const ORACLE_GRADIENT_SUITE: &str = "oracle_gradient";
pub const DIFFERENTIAL_PACKET: &str = "FO-OPS-006";

pub const DIFFERENTIAL_SCHEMA_VERSION: &str = "fo-differential-report-v1";

/// Snapshot files the differential harness expects under the oracle root.
pub const ORACLE_SNAPSHOT_FILES: [&str; 2] = ["legacy_elementwise.json", "legacy_gradients.json"];

/// Fixtures are committed test data; anything larger than this is a mistake.
const MAX_FIXTURE_BYTES: u64 = 1_048_576;

/// Observed/expected diagnostics are truncated to keep log lines greppable.
const DIAGNOSTIC_BYTES: usize = 160;

/// Filesystem layout and mode policy for a harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub oracle_root: PathBuf,
    pub fixture_root: PathBuf,
    pub allowlist_path: PathBuf,
    pub strict_mode: bool,
}

impl HarnessConfig {
    /// Paths relative to this crate's manifest, which is where the committed
    /// fixtures and oracle snapshots live.
    #[must_use]
    pub fn default_paths() -> Self {
        let manifest_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let fixture_root = manifest_root.join("fixtures");
        Self {
            oracle_root: manifest_root.join("oracle"),
            allowlist_path: fixture_root.join("differential_allowlist.json"),
            fixture_root,
            strict_mode: true,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

/// Per-suite roll-up, also produced as the aggregate smoke summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub oracle_present: bool,
    pub fixture_count: usize,
    pub strict_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DTypeSupportCaseReport {
    pub case_name: String,
    pub operator: String,
    pub claims_match_fixture: bool,
    pub accepted_dtypes_execute: bool,
    pub rejected_dtypes_fail_closed: bool,
    pub promotion_policy_observed: bool,
    pub log: StructuredCaseLog,
}

impl DTypeSupportCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.claims_match_fixture
            && self.accepted_dtypes_execute
            && self.rejected_dtypes_fail_closed
            && self.promotion_policy_observed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientCaseReport {
    pub case_name: String,
    pub operator: String,
    pub gradcheck_passed: bool,
    pub gradgradcheck_passed: bool,
    pub inplace_grad_passed: bool,
    pub non_float_rejected: bool,
    pub max_abs_difference: f64,
    pub waiver_applied: bool,
    pub log: StructuredCaseLog,
}

impl GradientCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.gradcheck_passed
            && self.gradgradcheck_passed
            && self.inplace_grad_passed
            && self.non_float_rejected
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantCaseReport {
    pub case_name: String,
    pub operator: String,
    pub variants_agree: bool,
    pub backward_parity: bool,
    pub inplace_policy_ok: bool,
    pub missing_variants_rejected: bool,
    pub log: StructuredCaseLog,
}

impl VariantCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.variants_agree
            && self.backward_parity
            && self.inplace_policy_ok
            && self.missing_variants_rejected
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JitCaseReport {
    pub case_name: String,
    pub operators: Vec<String>,
    pub traced_matches_eager: bool,
    pub scripted_matches_eager: bool,
    pub graphs_isomorphic: bool,
    pub autodiff_partition_ok: bool,
    pub alias_annotations_ok: bool,
    pub log: StructuredCaseLog,
}

impl JitCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.traced_matches_eager
            && self.scripted_matches_eager
            && self.graphs_isomorphic
            && self.autodiff_partition_ok
            && self.alias_annotations_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutVariantCaseReport {
    pub case_name: String,
    pub operator: String,
    pub out_matches_function: bool,
    pub shape_mismatch_fails_closed: bool,
    pub integral_out_policy_ok: bool,
    pub missing_out_rejected: bool,
    pub log: StructuredCaseLog,
}

impl OutVariantCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.out_matches_function
            && self.shape_mismatch_fails_closed
            && self.integral_out_policy_ok
            && self.missing_out_rejected
    }
}

/// What `emit_e2e_forensics_matrix` wrote and how much of it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct E2EForensicsSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub failed_entries: usize,
    pub modes: Vec<ExecutionMode>,
}

/// Availability of the recorded legacy-runtime snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleStatus {
    pub oracle_root: String,
    pub available: bool,
    pub message: String,
}

/// One comparison between this runtime and a recorded oracle value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DifferentialCheck {
    pub suite: &'static str,
    pub packet_id: &'static str,
    pub scenario_id: String,
    pub case_name: String,
    pub mode: &'static str,
    pub comparator: &'static str,
    pub status: &'static str,
    pub allowlisted: bool,
    pub drift_id: Option<String>,
    pub reason_code: String,
    pub observed: String,
    pub expected: String,
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DifferentialHarnessReport {
    pub schema_version: &'static str,
    pub oracle: OracleStatus,
    pub modes: Vec<&'static str>,
    pub total_checks: usize,
    pub failed_checks: usize,
    pub allowlisted_drifts: usize,
    pub blocking_drifts: usize,
    pub checks: Vec<DifferentialCheck>,
}

/// Per-packet index of drift ids the allowlist tolerates in hardened mode.
#[derive(Debug, Clone, Default)]
pub struct AllowlistIndex {
    by_packet: BTreeMap<String, BTreeSet<String>>,
}

impl AllowlistIndex {
    #[must_use]
    pub fn contains(&self, packet_id: &str, drift_id: &str) -> bool {
        self.by_packet
            .get(packet_id)
            .is_some_and(|ids| ids.contains(drift_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchReport {
    pub iterations: usize,
    pub p50_ns: u128,
    pub p95_ns: u128,
    pub p99_ns: u128,
    pub mean_ns: u128,
}

/// Runs every fixture suite once in the configured mode and rolls the counts
/// into a single report. Suites that fail to load contribute zero cases.
#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(config.fixture_root.as_path())
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0);
    let mode = if config.strict_mode {
        ExecutionMode::Strict
    } else {
        ExecutionMode::Hardened
    };
    let suite_counts = [
        run_dtype_support_conformance(config, mode)
            .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed)),
        run_gradient_conformance(config, mode)
            .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed)),
        run_variant_conformance(config, mode)
            .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed)),
        run_jit_conformance(config, mode)
            .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed)),
        run_out_variant_conformance(config, mode)
            .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed)),
    ];
    let cases_total = suite_counts.iter().map(|(total, _)| total).sum();
    let cases_passed = suite_counts.iter().map(|(_, passed)| passed).sum();
    HarnessReport {
        suite: "frankenops_smoke",
        oracle_present: config.oracle_root.exists(),
        fixture_count,
        strict_mode: config.strict_mode,
        cases_total,
        cases_passed,
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DTypeSupportFixture {
    cases: Vec<DTypeSupportFixtureCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct DTypeSupportFixtureCase {
    name: String,
    op: String,
    expected_dtypes: Vec<String>,
    #[serde(default)]
    rejected_dtypes: Vec<String>,
    #[serde(default)]
    promotes_integer_to_float: bool,
}

/// Checks every registry operator's dtype claims against the fixture matrix:
/// claimed dtypes must execute, rejected dtypes must fail closed, and the
/// integer-to-float promotion policy must be observable on the output meta.
pub fn run_dtype_support_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<DTypeSupportCaseReport>), String> {
    let fixture_path = config.fixture_root.join("dtype_support_matrix.json");
    let fixture: DTypeSupportFixture = load_fixture(fixture_path.as_path())?;
    run_dtype_support_with_fixture(config, &fixture, fixture_path.as_path(), mode)
}

fn run_dtype_support_with_fixture(
    config: &HarnessConfig,
    fixture: &DTypeSupportFixture,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<DTypeSupportCaseReport>), String> {
    let mut cases = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        cases.push(run_dtype_support_case(config, case, fixture_path, mode)?);
    }
    let (cases_total, cases_passed) =
        summarize_passes(cases.iter().map(DTypeSupportCaseReport::passed));
    Ok((
        HarnessReport {
            suite: DTYPE_SUPPORT_SUITE,
            oracle_present: config.oracle_root.exists(),
            fixture_count: 1,
            strict_mode: mode == ExecutionMode::Strict,
            cases_total,
            cases_passed,
        },
        cases,
    ))
}

fn run_dtype_support_case(
    config: &HarnessConfig,
    case: &DTypeSupportFixtureCase,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<DTypeSupportCaseReport, String> {
    let info = find_op(&case.op)
        .ok_or_else(|| format!("case '{}' names unknown operator '{}'", case.name, case.op))?;
    let expected = dtype_set_from_tokens(&case.expected_dtypes, &case.name)?;
    let rejected = dtype_set_from_tokens(&case.rejected_dtypes, &case.name)?;
    let seed = case_seed(&case.name);

    let claims = info.supported_dtypes(Device::Cpu);
    let claims_match_fixture = claims == expected
        && info.promotes_integers_to_float == case.promotes_integer_to_float
        && expected.iter().all(|dtype| info.supports_dtype(dtype, Device::Cpu))
        && rejected.iter().all(|dtype| !info.supports_dtype(dtype, Device::Cpu));

    let mut session = FrankenOpsSession::with_seed(mode, seed)
        .map_err(|error| format!("case '{}' session: {error}", case.name))?;

    let mut accepted_dtypes_execute = true;
    let mut promotion_policy_observed = true;
    for dtype in claims.iter() {
        let samples = info
            .sample_inputs(Device::Cpu, dtype, false, seed)
            .map_err(|error| format!("case '{}' samples for {}: {error}", case.name, dtype.token()))?;
        for sample in samples {
            match execute_sample(&mut session, info, sample) {
                Ok(out_dtype) => {
                    let expected_out = if info.promotes_integers_to_float {
                        dtype.promote_to_float()
                    } else {
                        dtype
                    };
                    promotion_policy_observed &= out_dtype == expected_out;
                }
                Err(_) => accepted_dtypes_execute = false,
            }
        }
    }

    let mut rejected_dtypes_fail_closed = true;
    for dtype in rejected.iter() {
        // Rejected dtypes never build autograd samples; drive the call with
        // raw constants instead.
        let mut nodes = vec![session.tensor_constant(case_tensor(dtype, &[2], &[1.0, 0.0])?)];
        if info.is_binary() {
            nodes.push(session.tensor_constant(case_tensor(dtype, &[2], &[1.0, 1.0])?));
        }
        rejected_dtypes_fail_closed &= match session.call_function(info.name, &nodes) {
            Err(error) => error.is_unsupported_dtype(),
            Ok(_) => false,
        };
    }

    let outcome_pass = claims_match_fixture
        && accepted_dtypes_execute
        && rejected_dtypes_fail_closed
        && promotion_policy_observed;

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("operator".to_string(), json!(case.op));
    extra_fields.insert(
        "claimed_dtypes".to_string(),
        json!(claims.iter().map(DType::token).collect::<Vec<_>>()),
    );
    extra_fields.insert(
        "promotes_integer_to_float".to_string(),
        json!(info.promotes_integers_to_float),
    );
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );

    let log = StructuredCaseLog::new(
        DTYPE_SUPPORT_SUITE,
        "dtype_support_matrix",
        DTYPE_SUPPORT_PACKET,
        &case.name,
        mode,
        vec![
            fixture_path.display().to_string(),
            config.oracle_root.display().to_string(),
        ],
        format!(
            "cargo test -p fo-conformance dtype_support_suite_is_green_in_strict_mode -- --nocapture # mode={}",
            mode_label(mode)
        ),
        if outcome_pass { "pass" } else { "fail" },
        if outcome_pass { "dtype_claims_verified" } else { "dtype_claim_mismatch" },
    )
    .with_extra_fields(extra_fields);

    Ok(DTypeSupportCaseReport {
        case_name: case.name.clone(),
        operator: case.op.clone(),
        claims_match_fixture,
        accepted_dtypes_execute,
        rejected_dtypes_fail_closed,
        promotion_policy_observed,
        log,
    })
}

fn execute_sample(
    session: &mut FrankenOpsSession,
    info: &OpInfo,
    sample: SampleInput,
) -> Result<DType, ApiError> {
    let input = if sample.requires_grad {
        session.tensor_variable(sample.input)?
    } else {
        session.tensor_constant(sample.input)
    };
    let mut nodes = vec![input];
    for arg in sample.args {
        nodes.push(session.tensor_constant(arg));
    }
    let out = session.call_function(info.name, &nodes)?;
    Ok(session.meta_of(out)?.dtype())
}

#[derive(Debug, Clone, Deserialize)]
struct GradientFixture {
    #[serde(default)]
    default_tolerances: Option<GradientTolerances>,
    #[serde(default)]
    hardened_relaxation_factor: Option<f64>,
    cases: Vec<GradientFixtureCase>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct GradientTolerances {
    #[serde(default)]
    eps: Option<f64>,
    #[serde(default)]
    atol: Option<f64>,
    #[serde(default)]
    rtol: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct GradientFixtureCase {
    name: String,
    op: String,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    check_gradgrad: bool,
    #[serde(default)]
    eps: Option<f64>,
    #[serde(default)]
    atol: Option<f64>,
    #[serde(default)]
    rtol: Option<f64>,
    #[serde(default)]
    waiver: Option<GradientWaiver>,
}

#[derive(Debug, Clone, Deserialize)]
struct GradientWaiver {
    id: String,
    relaxation_factor: f64,
    reason: String,
}

/// Numeric-vs-analytic gradient checks over the registry's double-precision
/// samples. Hardened runs relax tolerances by the fixture factor, or by a
/// case waiver when one is on file; strict runs never relax.
pub fn run_gradient_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<GradientCaseReport>), String> {
    let fixture_path = config.fixture_root.join("gradient_policies.json");
    let fixture: GradientFixture = load_fixture(fixture_path.as_path())?;
    run_gradient_with_fixture(config, &fixture, fixture_path.as_path(), mode)
}

fn run_gradient_with_fixture(
    config: &HarnessConfig,
    fixture: &GradientFixture,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<GradientCaseReport>), String> {
    let mut cases = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        cases.push(run_gradient_case(config, fixture, case, fixture_path, mode)?);
    }
    let (cases_total, cases_passed) = summarize_passes(cases.iter().map(GradientCaseReport::passed));
    Ok((
        HarnessReport {
            suite: GRADIENT_SUITE,
            oracle_present: config.oracle_root.exists(),
            fixture_count: 1,
            strict_mode: mode == ExecutionMode::Strict,
            cases_total,
            cases_passed,
        },
        cases,
    ))
}

fn run_gradient_case(
    config: &HarnessConfig,
    fixture: &GradientFixture,
    case: &GradientFixtureCase,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<GradientCaseReport, String> {
    let info = find_op(&case.op)
        .ok_or_else(|| format!("case '{}' names unknown operator '{}'", case.name, case.op))?;
    let seed = case.seed.unwrap_or_else(|| case_seed(&case.name));
    let defaults = fixture.default_tolerances;
    let base_eps = case.eps.or(defaults.and_then(|t| t.eps)).unwrap_or(1e-6);
    let base_atol = case.atol.or(defaults.and_then(|t| t.atol)).unwrap_or(1e-5);
    let base_rtol = case.rtol.or(defaults.and_then(|t| t.rtol)).unwrap_or(1e-3);
    let relaxation = match mode {
        ExecutionMode::Strict => 1.0,
        ExecutionMode::Hardened => case
            .waiver
            .as_ref()
            .map(|waiver| waiver.relaxation_factor)
            .or(fixture.hardened_relaxation_factor)
            .unwrap_or(1.0),
    };
    let waiver_applied = mode == ExecutionMode::Hardened && case.waiver.is_some();
    let options = GradcheckOptions {
        eps: base_eps,
        atol: base_atol * relaxation,
        rtol: base_rtol * relaxation,
        check_grad_dtypes: true,
        gen_non_contig_grad_outputs: false,
        mode,
    };

    let mut session = FrankenOpsSession::with_seed(mode, seed)
        .map_err(|error| format!("case '{}' session: {error}", case.name))?;
    let kind = session
        .registry()
        .resolve_function(info.name)
        .map_err(|error| format!("case '{}' schema: {error}", case.name))?
        .kind;
    let stage_kind = session
        .registry()
        .resolve_function("mul")
        .map_err(|error| format!("case '{}' staging schema: {error}", case.name))?
        .kind;
    let promotes = info.promotes_integers_to_float;

    let mut gradcheck_passed = true;
    let mut gradgradcheck_passed = true;
    let mut inplace_grad_passed = true;
    let mut max_abs_difference = 0.0_f64;

    let samples = info
        .sample_inputs(Device::Cpu, DType::F64, true, seed)
        .map_err(|error| format!("case '{}' samples: {error}", case.name))?;
    for sample in samples {
        let shape = sample.input.shape().to_vec();
        let mut inputs = Vec::with_capacity(1 + sample.args.len());
        inputs.push(
            session
                .tensor_variable(sample.input)
                .map_err(|error| format!("case '{}' variable: {error}", case.name))?,
        );
        for arg in sample.args {
            inputs.push(
                session
                    .tensor_variable(arg)
                    .map_err(|error| format!("case '{}' partner variable: {error}", case.name))?,
            );
        }

        match session.run_gradcheck(
            "conformance_gradcheck",
            |tape, nodes| Ok(vec![tape.apply(kind, nodes, promotes, mode)?.0]),
            &inputs,
            &options,
        ) {
            Ok(report) => max_abs_difference = max_abs_difference.max(report.max_abs_difference),
            Err(ApiError::Check { source, .. }) if source.is_jacobian_mismatch() => {
                gradcheck_passed = false;
            }
            Err(error) => {
                return Err(format!("case '{}' gradcheck aborted: {error}", case.name));
            }
        }

        if case.check_gradgrad {
            let grad_output = session
                .tensor_variable(ones_tensor(&shape, DType::F64)?)
                .map_err(|error| format!("case '{}' grad seed: {error}", case.name))?;
            let second_order = GradcheckOptions {
                gen_non_contig_grad_outputs: true,
                ..options
            };
            match session.run_gradgradcheck(
                "conformance_gradgradcheck",
                |tape, nodes| Ok(vec![tape.apply(kind, nodes, promotes, mode)?.0]),
                &inputs,
                &[grad_output],
                &second_order,
            ) {
                Ok(report) => {
                    max_abs_difference = max_abs_difference.max(report.max_abs_difference);
                }
                Err(ApiError::Check { source, .. }) if source.is_jacobian_mismatch() => {
                    gradgradcheck_passed = false;
                }
                Err(error) => {
                    return Err(format!("case '{}' gradgradcheck aborted: {error}", case.name));
                }
            }
        }

        if info.has_inplace && info.test_inplace_grad {
            // In-place rewrites of leaf variables are refused, so the check
            // stages the receiver through a mul against ones. Gradients flow
            // through the staging op unchanged.
            let ones_node = session.tensor_constant(ones_tensor(&shape, DType::F64)?);
            match session.run_gradcheck(
                "conformance_inplace_gradcheck",
                |tape, nodes| {
                    let staged = tape.apply(stage_kind, &[nodes[0], ones_node], false, mode)?.0;
                    let mut dest_inputs = Vec::with_capacity(nodes.len());
                    dest_inputs.push(staged);
                    dest_inputs.extend_from_slice(&nodes[1..]);
                    Ok(vec![tape.apply_inplace(kind, &dest_inputs, promotes, mode)?.0])
                },
                &inputs,
                &options,
            ) {
                Ok(report) => {
                    max_abs_difference = max_abs_difference.max(report.max_abs_difference);
                }
                Err(ApiError::Check { source, .. }) if source.is_jacobian_mismatch() => {
                    inplace_grad_passed = false;
                }
                Err(error) => {
                    return Err(format!("case '{}' in-place gradcheck aborted: {error}", case.name));
                }
            }
        }
    }

    // The gradient gate is double-precision only: integral tensors cannot
    // become variables at all, and F32 leaves are turned away by gradcheck.
    let variable_rejected = matches!(
        session.tensor_variable(case_tensor(DType::I64, &[3], &[1.0, 2.0, 3.0])?),
        Err(ApiError::Op {
            source: AutogradError::RequiresGradNeedsFloat { .. },
            ..
        })
    );
    let mut single_inputs = vec![
        session
            .tensor_variable(case_tensor(DType::F32, &[2], &[0.5, -1.5])?)
            .map_err(|error| format!("case '{}' f32 variable: {error}", case.name))?,
    ];
    if info.is_binary() {
        single_inputs.push(
            session
                .tensor_variable(case_tensor(DType::F32, &[2], &[1.0, 1.5])?)
                .map_err(|error| format!("case '{}' f32 partner: {error}", case.name))?,
        );
    }
    let precision_rejected = matches!(
        session.run_gradcheck(
            "conformance_precision_gate",
            |tape, nodes| Ok(vec![tape.apply(kind, nodes, promotes, mode)?.0]),
            &single_inputs,
            &options,
        ),
        Err(ApiError::Check {
            source: GradcheckError::InputNotDoublePrecision { .. },
            ..
        })
    );
    let non_float_rejected = variable_rejected && precision_rejected;

    let outcome_pass =
        gradcheck_passed && gradgradcheck_passed && inplace_grad_passed && non_float_rejected;

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("operator".to_string(), json!(case.op));
    extra_fields.insert("eps".to_string(), json!(options.eps));
    extra_fields.insert("atol".to_string(), json!(options.atol));
    extra_fields.insert("rtol".to_string(), json!(options.rtol));
    extra_fields.insert("relaxation_factor".to_string(), json!(relaxation));
    extra_fields.insert("max_abs_difference".to_string(), json!(max_abs_difference));
    extra_fields.insert("check_gradgrad".to_string(), json!(case.check_gradgrad));
    if let Some(waiver) = &case.waiver {
        extra_fields.insert(
            "waiver".to_string(),
            json!({ "id": waiver.id, "reason": waiver.reason, "applied": waiver_applied }),
        );
    }
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );

    let log = StructuredCaseLog::new(
        GRADIENT_SUITE,
        "gradient_policies",
        GRADIENT_PACKET,
        &case.name,
        mode,
        vec![
            fixture_path.display().to_string(),
            config.oracle_root.display().to_string(),
        ],
        format!(
            "cargo test -p fo-conformance gradient_suite_is_green_in_strict_mode -- --nocapture # mode={}",
            mode_label(mode)
        ),
        if outcome_pass { "pass" } else { "fail" },
        if outcome_pass { "gradcheck_parity_ok" } else { "gradcheck_mismatch" },
    )
    .with_extra_fields(extra_fields);

    Ok(GradientCaseReport {
        case_name: case.name.clone(),
        operator: case.op.clone(),
        gradcheck_passed,
        gradgradcheck_passed,
        inplace_grad_passed,
        non_float_rejected,
        max_abs_difference,
        waiver_applied,
        log,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct VariantFixture {
    cases: Vec<VariantFixtureCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct VariantFixtureCase {
    name: String,
    op: String,
    dtype: String,
    shape: Vec<usize>,
    values: Vec<f64>,
    #[serde(default)]
    partner: Option<Vec<f64>>,
    #[serde(default)]
    tolerance: Option<f64>,
}

/// Function, method, and in-place renditions of an operator must agree on
/// values and gradients; registry gaps must be rejected by name resolution.
pub fn run_variant_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<VariantCaseReport>), String> {
    let fixture_path = config.fixture_root.join("variant_cases.json");
    let fixture: VariantFixture = load_fixture(fixture_path.as_path())?;
    run_variant_with_fixture(config, &fixture, fixture_path.as_path(), mode)
}

fn run_variant_with_fixture(
    config: &HarnessConfig,
    fixture: &VariantFixture,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<VariantCaseReport>), String> {
    let mut cases = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        cases.push(run_variant_case(config, case, fixture_path, mode)?);
    }
    let (cases_total, cases_passed) = summarize_passes(cases.iter().map(VariantCaseReport::passed));
    Ok((
        HarnessReport {
            suite: VARIANT_SUITE,
            oracle_present: config.oracle_root.exists(),
            fixture_count: 1,
            strict_mode: mode == ExecutionMode::Strict,
            cases_total,
            cases_passed,
        },
        cases,
    ))
}

fn run_variant_case(
    config: &HarnessConfig,
    case: &VariantFixtureCase,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<VariantCaseReport, String> {
    let info = find_op(&case.op)
        .ok_or_else(|| format!("case '{}' names unknown operator '{}'", case.name, case.op))?;
    if info.is_binary() != case.partner.is_some() {
        return Err(format!("case '{}' arity does not match its fixture inputs", case.name));
    }
    let dtype = parse_dtype(&case.dtype, &case.name)?;
    let tolerance = case.tolerance.unwrap_or(1e-12);
    let is_float = dtype.is_floating_point();
    let partner = case.partner.as_deref();

    let mut session = FrankenOpsSession::with_seed(mode, case_seed(&case.name))
        .map_err(|error| format!("case '{}' session: {error}", case.name))?;

    let fn_inputs =
        build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, is_float)
            .map_err(|error| format!("case '{}': {error}", case.name))?;
    let fn_out = session
        .call_function(info.name, &fn_inputs)
        .map_err(|error| format!("case '{}' function call: {error}", case.name))?;
    let fn_values = session
        .values_f64(fn_out)
        .map_err(|error| format!("case '{}' function values: {error}", case.name))?;

    let mut variants_agree = true;
    let mut backward_parity = true;
    let mut inplace_policy_ok = true;
    let mut missing_variants_rejected = true;

    if dtype.is_integer() && info.promotes_integers_to_float {
        let out_dtype = session
            .meta_of(fn_out)
            .map_err(|error| format!("case '{}' output meta: {error}", case.name))?
            .dtype();
        variants_agree &= out_dtype == dtype.promote_to_float();
    }

    if info.has_method {
        let m_inputs =
            build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, is_float)
                .map_err(|error| format!("case '{}': {error}", case.name))?;
        let m_out = session
            .call_method(m_inputs[0], info.name, &m_inputs[1..])
            .map_err(|error| format!("case '{}' method call: {error}", case.name))?;
        let m_values = session
            .values_f64(m_out)
            .map_err(|error| format!("case '{}' method values: {error}", case.name))?;
        variants_agree &= vec_within(&m_values, &fn_values, tolerance);

        if is_float {
            let fn_report = session
                .backward(fn_out)
                .map_err(|error| format!("case '{}' function backward: {error}", case.name))?;
            let m_report = session
                .backward(m_out)
                .map_err(|error| format!("case '{}' method backward: {error}", case.name))?;
            for (left, right) in fn_inputs.iter().zip(m_inputs.iter()) {
                match (session.grad_of(&fn_report, *left), session.grad_of(&m_report, *right)) {
                    (Some(a), Some(b)) => {
                        let a_values = session
                            .values_f64(a)
                            .map_err(|error| format!("case '{}' grads: {error}", case.name))?;
                        let b_values = session
                            .values_f64(b)
                            .map_err(|error| format!("case '{}' grads: {error}", case.name))?;
                        backward_parity &= vec_within(&a_values, &b_values, tolerance);
                    }
                    _ => backward_parity = false,
                }
            }
        }
    } else {
        let probe =
            build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
                .map_err(|error| format!("case '{}': {error}", case.name))?;
        missing_variants_rejected &= matches!(
            session.call_method(probe[0], info.name, &probe[1..]),
            Err(ApiError::Op {
                source: AutogradError::Dispatch(DispatchError::UnknownMethod { .. }),
                ..
            })
        );
    }

    let inplace_name = format!("{}_", info.name);
    if info.has_inplace {
        if is_float || !info.promotes_integers_to_float {
            let nodes =
                build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
                    .map_err(|error| format!("case '{}': {error}", case.name))?;
            let receiver = nodes[0];
            let out = session
                .call_inplace(receiver, &inplace_name, &nodes[1..])
                .map_err(|error| format!("case '{}' in-place call: {error}", case.name))?;
            let out_values = session
                .values_f64(out)
                .map_err(|error| format!("case '{}' in-place values: {error}", case.name))?;
            variants_agree &= vec_within(&out_values, &fn_values, tolerance);
            let out_storage = session
                .value(out)
                .map_err(|error| format!("case '{}': {error}", case.name))?
                .storage_id();
            let receiver_storage = session
                .value(receiver)
                .map_err(|error| format!("case '{}': {error}", case.name))?
                .storage_id();
            inplace_policy_ok &= out_storage == receiver_storage;
        } else {
            let nodes =
                build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
                    .map_err(|error| format!("case '{}': {error}", case.name))?;
            inplace_policy_ok &= match session.call_inplace(nodes[0], &inplace_name, &nodes[1..]) {
                Err(error) => error.is_promotion_failure(),
                Ok(_) => false,
            };
        }
        if is_float {
            let leaves =
                build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, true)
                    .map_err(|error| format!("case '{}': {error}", case.name))?;
            inplace_policy_ok &= matches!(
                session.call_inplace(leaves[0], &inplace_name, &leaves[1..]),
                Err(ApiError::Op {
                    source: AutogradError::InplaceOnLeafVariable { .. },
                    ..
                })
            );
        }
    } else {
        let nodes =
            build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
                .map_err(|error| format!("case '{}': {error}", case.name))?;
        missing_variants_rejected &= matches!(
            session.call_inplace(nodes[0], &inplace_name, &nodes[1..]),
            Err(ApiError::Op {
                source: AutogradError::Dispatch(DispatchError::UnknownInplace { .. }),
                ..
            })
        );
    }

    let outcome_pass =
        variants_agree && backward_parity && inplace_policy_ok && missing_variants_rejected;

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("operator".to_string(), json!(case.op));
    extra_fields.insert("dtype".to_string(), json!(case.dtype));
    extra_fields.insert("tolerance".to_string(), json!(tolerance));
    extra_fields.insert("has_method".to_string(), json!(info.has_method));
    extra_fields.insert("has_inplace".to_string(), json!(info.has_inplace));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );

    let log = StructuredCaseLog::new(
        VARIANT_SUITE,
        "variant_cases",
        VARIANT_PACKET,
        &case.name,
        mode,
        vec![
            fixture_path.display().to_string(),
            config.oracle_root.display().to_string(),
        ],
        format!(
            "cargo test -p fo-conformance variant_suite_is_green_in_strict_mode -- --nocapture # mode={}",
            mode_label(mode)
        ),
        if outcome_pass { "pass" } else { "fail" },
        if outcome_pass { "variant_parity_ok" } else { "variant_divergence" },
    )
    .with_extra_fields(extra_fields);

    Ok(VariantCaseReport {
        case_name: case.name.clone(),
        operator: case.op.clone(),
        variants_agree,
        backward_parity,
        inplace_policy_ok,
        missing_variants_rejected,
        log,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct JitFixture {
    cases: Vec<JitFixtureCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct JitFixtureCase {
    name: String,
    ops: Vec<String>,
    dtype: String,
    shape: Vec<usize>,
    values: Vec<f64>,
    #[serde(default)]
    partner: Option<Vec<f64>>,
    #[serde(default)]
    check_alias: bool,
    #[serde(default)]
    tolerance: Option<f64>,
}

/// Eager, traced, and scripted executions of an op chain must agree on
/// values; traced and scripted graphs must be isomorphic; the autodiff
/// partition and schema alias annotations must match the registry claims.
pub fn run_jit_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<JitCaseReport>), String> {
    let fixture_path = config.fixture_root.join("jit_cases.json");
    let fixture: JitFixture = load_fixture(fixture_path.as_path())?;
    run_jit_with_fixture(config, &fixture, fixture_path.as_path(), mode)
}

fn run_jit_with_fixture(
    config: &HarnessConfig,
    fixture: &JitFixture,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<JitCaseReport>), String> {
    let mut cases = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        cases.push(run_jit_case(config, case, fixture_path, mode)?);
    }
    let (cases_total, cases_passed) = summarize_passes(cases.iter().map(JitCaseReport::passed));
    Ok((
        HarnessReport {
            suite: JIT_SUITE,
            oracle_present: config.oracle_root.exists(),
            fixture_count: 1,
            strict_mode: mode == ExecutionMode::Strict,
            cases_total,
            cases_passed,
        },
        cases,
    ))
}

fn run_jit_case(
    config: &HarnessConfig,
    case: &JitFixtureCase,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<JitCaseReport, String> {
    if case.ops.is_empty() {
        return Err(format!("case '{}' declares an empty op chain", case.name));
    }
    let mut infos = Vec::with_capacity(case.ops.len());
    for op in &case.ops {
        infos.push(
            find_op(op)
                .ok_or_else(|| format!("case '{}' names unknown operator '{op}'", case.name))?,
        );
    }
    let binary_first = infos[0].is_binary();
    if binary_first != case.partner.is_some() {
        return Err(format!("case '{}' arity does not match its fixture inputs", case.name));
    }
    if infos.iter().skip(1).any(|info| info.is_binary()) {
        return Err(format!("case '{}' chains a binary operator past the first step", case.name));
    }
    let dtype = parse_dtype(&case.dtype, &case.name)?;
    let tolerance = case.tolerance.unwrap_or(1e-12);
    let float_inputs = dtype.is_floating_point();
    let partner = case.partner.as_deref();

    let mut session = FrankenOpsSession::with_seed(mode, case_seed(&case.name))
        .map_err(|error| format!("case '{}' session: {error}", case.name))?;
    let mut qualified = Vec::with_capacity(case.ops.len());
    for op in &case.ops {
        let entry = session
            .registry()
            .resolve_function(op)
            .map_err(|error| format!("case '{}' schema: {error}", case.name))?;
        qualified.push(entry.schema.qualified_name.clone());
    }

    // Eager reference.
    let eager_inputs =
        build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
            .map_err(|error| format!("case '{}': {error}", case.name))?;
    let mut eager_out = eager_inputs[0];
    for (index, op) in case.ops.iter().enumerate() {
        let args: Vec<NodeId> = if index == 0 && binary_first {
            vec![eager_out, eager_inputs[1]]
        } else {
            vec![eager_out]
        };
        eager_out = session
            .call_function(op, &args)
            .map_err(|error| format!("case '{}' eager step '{op}': {error}", case.name))?;
    }
    let eager_values = session
        .values_f64(eager_out)
        .map_err(|error| format!("case '{}' eager values: {error}", case.name))?;

    // Trace the same chain on fresh inputs.
    let trace_inputs =
        build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
            .map_err(|error| format!("case '{}': {error}", case.name))?;
    let keys: Vec<u64> = trace_inputs.iter().map(|node| node.0 as u64).collect();
    let mut recorder = TraceRecorder::new(&keys);
    let mut current = trace_inputs[0];
    for (index, op) in case.ops.iter().enumerate() {
        let args: Vec<NodeId> = if index == 0 && binary_first {
            vec![current, trace_inputs[1]]
        } else {
            vec![current]
        };
        let next = session
            .call_function(op, &args)
            .map_err(|error| format!("case '{}' trace step '{op}': {error}", case.name))?;
        let arg_keys: Vec<u64> = args.iter().map(|node| node.0 as u64).collect();
        recorder
            .record_op(&qualified[index], &arg_keys, next.0 as u64)
            .map_err(|error| format!("case '{}' trace record '{op}': {error}", case.name))?;
        current = next;
    }
    let traced_graph = recorder
        .finish(current.0 as u64)
        .map_err(|error| format!("case '{}' trace finish: {error}", case.name))?;

    let replay_inputs =
        build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
            .map_err(|error| format!("case '{}': {error}", case.name))?;
    let traced_run = session
        .run_graph(&traced_graph, &replay_inputs)
        .map_err(|error| format!("case '{}' traced replay: {error}", case.name))?;
    let traced_values = session
        .values_f64(traced_run)
        .map_err(|error| format!("case '{}' traced values: {error}", case.name))?;
    let traced_matches_eager = vec_within(&traced_values, &eager_values, tolerance);

    let source = chain_script_source(&session, &case.ops, &qualified, binary_first)?;
    let scripted_graph = session
        .compile_script(&source)
        .map_err(|error| format!("case '{}' script compile: {error}", case.name))?;
    let script_inputs =
        build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
            .map_err(|error| format!("case '{}': {error}", case.name))?;
    let scripted_run = session
        .run_graph(&scripted_graph, &script_inputs)
        .map_err(|error| format!("case '{}' scripted replay: {error}", case.name))?;
    let scripted_values = session
        .values_f64(scripted_run)
        .map_err(|error| format!("case '{}' scripted values: {error}", case.name))?;
    let scripted_matches_eager = vec_within(&scripted_values, &eager_values, tolerance);

    let graphs_isomorphic = traced_graph.canonical_dump() == scripted_graph.canonical_dump();

    let partition = session
        .differentiability_of(&traced_graph, float_inputs)
        .map_err(|error| format!("case '{}' partition: {error}", case.name))?;
    let (expected_groups, expected_standalone, expected_opaque) =
        expected_autodiff_partition(&infos, float_inputs);
    let autodiff_partition_ok = partition.fusion_groups == expected_groups
        && partition.standalone_nodes == expected_standalone
        && partition.opaque_nodes == expected_opaque;

    let alias_annotations_ok = if case.check_alias {
        run_alias_checks(&mut session, infos[0], dtype, &case.shape, &case.values, partner)
            .map_err(|error| format!("case '{}': {error}", case.name))?
    } else {
        true
    };

    let outcome_pass = traced_matches_eager
        && scripted_matches_eager
        && graphs_isomorphic
        && autodiff_partition_ok
        && alias_annotations_ok;

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("operators".to_string(), json!(case.ops));
    extra_fields.insert("dtype".to_string(), json!(case.dtype));
    extra_fields.insert(
        "canonical_graph".to_string(),
        json!(bounded_diagnostic(&traced_graph.canonical_dump(), DIAGNOSTIC_BYTES)),
    );
    extra_fields.insert(
        "fusion_groups".to_string(),
        json!(partition.fusion_groups.len()),
    );
    extra_fields.insert(
        "standalone_nodes".to_string(),
        json!(partition.standalone_nodes.len()),
    );
    extra_fields.insert("opaque_nodes".to_string(), json!(partition.opaque_nodes.len()));
    extra_fields.insert("alias_checked".to_string(), json!(case.check_alias));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );

    let log = StructuredCaseLog::new(
        JIT_SUITE,
        "jit_cases",
        JIT_PACKET,
        &case.name,
        mode,
        vec![
            fixture_path.display().to_string(),
            config.oracle_root.display().to_string(),
        ],
        format!(
            "cargo test -p fo-conformance jit_suite_is_green_in_strict_mode -- --nocapture # mode={}",
            mode_label(mode)
        ),
        if outcome_pass { "pass" } else { "fail" },
        if outcome_pass { "jit_parity_ok" } else { "jit_divergence" },
    )
    .with_extra_fields(extra_fields);

    Ok(JitCaseReport {
        case_name: case.name.clone(),
        operators: case.ops.clone(),
        traced_matches_eager,
        scripted_matches_eager,
        graphs_isomorphic,
        autodiff_partition_ok,
        alias_annotations_ok,
        log,
    })
}

/// Mirrors the executor's run partitioning over the registry claims: maximal
/// runs of fusible differentiable nodes fuse, but a run of one stays
/// standalone; non-float inputs make every node opaque.
fn expected_autodiff_partition(
    infos: &[&OpInfo],
    float_inputs: bool,
) -> (Vec<Vec<usize>>, Vec<usize>, Vec<usize>) {
    let mut fusion_groups = Vec::new();
    let mut standalone_nodes = Vec::new();
    let mut opaque_nodes = Vec::new();
    let mut run: Vec<usize> = Vec::new();
    let mut flush = |run: &mut Vec<usize>,
                     fusion_groups: &mut Vec<Vec<usize>>,
                     standalone_nodes: &mut Vec<usize>| {
        match run.len() {
            0 => {}
            1 => standalone_nodes.push(run[0]),
            _ => fusion_groups.push(std::mem::take(run)),
        }
        run.clear();
    };
    for (index, info) in infos.iter().enumerate() {
        let fusible = !info.default_autodiff_nodes().1.is_empty();
        if float_inputs && fusible {
            run.push(index);
        } else {
            flush(&mut run, &mut fusion_groups, &mut standalone_nodes);
            if float_inputs {
                standalone_nodes.push(index);
            } else {
                opaque_nodes.push(index);
            }
        }
    }
    flush(&mut run, &mut fusion_groups, &mut standalone_nodes);
    (fusion_groups, standalone_nodes, opaque_nodes)
}

fn chain_script_source(
    session: &FrankenOpsSession,
    ops: &[String],
    qualified: &[String],
    binary_first: bool,
) -> Result<String, String> {
    if ops.len() == 1 {
        return session
            .script_source_for(&ops[0])
            .map_err(|error| format!("script source for '{}': {error}", ops[0]));
    }
    let mut source =
        String::from(if binary_first { "graph(%x, %y):\n" } else { "graph(%x):\n" });
    let mut current = String::from("%x");
    for (index, name) in qualified.iter().enumerate() {
        let dest = format!("%t{index}");
        if index == 0 && binary_first {
            source.push_str(&format!("  {dest} = {name}(%x, %y)\n"));
        } else {
            source.push_str(&format!("  {dest} = {name}({current})\n"));
        }
        current = dest;
    }
    source.push_str(&format!("  return {current}\n"));
    Ok(source)
}

fn run_alias_checks(
    session: &mut FrankenOpsSession,
    info: &OpInfo,
    dtype: DType,
    shape: &[usize],
    values: &[f64],
    partner: Option<&[f64]>,
) -> Result<bool, String> {
    // Functional variant: arguments come back untouched, output on fresh
    // storage.
    let nodes = build_input_nodes(session, dtype, shape, values, partner, false)?;
    let probe = {
        let refs = node_tensors(session, &nodes)?;
        AliasProbe::before(&refs).map_err(|error| format!("alias probe: {error}"))?
    };
    let out = session
        .call_function(info.name, &nodes)
        .map_err(|error| format!("alias function call: {error}"))?;
    let observation = {
        let refs = node_tensors(session, &nodes)?;
        let out_tensor = session
            .value(out)
            .map_err(|error| format!("alias output: {error}"))?;
        probe
            .observe(&refs, out_tensor)
            .map_err(|error| format!("alias observation: {error}"))?
    };
    let function_report = check_alias_annotation(session.registry(), info.name, &observation)
        .map_err(|error| format!("alias annotation: {error}"))?;
    let mut ok = function_report.passed();

    // In-place variant: the receiver is rewritten and returned.
    if info.has_inplace && (dtype.is_floating_point() || !info.promotes_integers_to_float) {
        let inplace_name = format!("{}_", info.name);
        let nodes = build_input_nodes(session, dtype, shape, values, partner, false)?;
        let probe = {
            let refs = node_tensors(session, &nodes)?;
            AliasProbe::before(&refs).map_err(|error| format!("alias probe: {error}"))?
        };
        let out = session
            .call_inplace(nodes[0], &inplace_name, &nodes[1..])
            .map_err(|error| format!("alias in-place call: {error}"))?;
        let observation = {
            let refs = node_tensors(session, &nodes)?;
            let out_tensor = session
                .value(out)
                .map_err(|error| format!("alias output: {error}"))?;
            probe
                .observe(&refs, out_tensor)
                .map_err(|error| format!("alias observation: {error}"))?
        };
        let inplace_report = check_alias_annotation(session.registry(), &inplace_name, &observation)
            .map_err(|error| format!("alias annotation: {error}"))?;
        ok &= inplace_report.passed();
    }
    Ok(ok)
}

fn node_tensors<'a>(
    session: &'a FrankenOpsSession,
    nodes: &[NodeId],
) -> Result<Vec<&'a DenseTensor>, String> {
    nodes
        .iter()
        .map(|node| {
            session
                .value(*node)
                .map_err(|error| format!("alias participant: {error}"))
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
struct OutVariantFixture {
    cases: Vec<OutVariantFixtureCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct OutVariantFixtureCase {
    name: String,
    op: String,
    dtype: String,
    shape: Vec<usize>,
    values: Vec<f64>,
    #[serde(default)]
    partner: Option<Vec<f64>>,
    #[serde(default)]
    mismatched_shape: Option<Vec<usize>>,
    #[serde(default)]
    tolerance: Option<f64>,
}

/// `out=` destinations must receive exactly the functional result, reject
/// writes that would promote an integral destination, and stay untouched
/// whenever the call fails validation.
pub fn run_out_variant_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<OutVariantCaseReport>), String> {
    let fixture_path = config.fixture_root.join("out_variant_cases.json");
    let fixture: OutVariantFixture = load_fixture(fixture_path.as_path())?;
    run_out_variant_with_fixture(config, &fixture, fixture_path.as_path(), mode)
}

fn run_out_variant_with_fixture(
    config: &HarnessConfig,
    fixture: &OutVariantFixture,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<OutVariantCaseReport>), String> {
    let mut cases = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        cases.push(run_out_variant_case(config, case, fixture_path, mode)?);
    }
    let (cases_total, cases_passed) =
        summarize_passes(cases.iter().map(OutVariantCaseReport::passed));
    Ok((
        HarnessReport {
            suite: OUT_VARIANT_SUITE,
            oracle_present: config.oracle_root.exists(),
            fixture_count: 1,
            strict_mode: mode == ExecutionMode::Strict,
            cases_total,
            cases_passed,
        },
        cases,
    ))
}

fn run_out_variant_case(
    config: &HarnessConfig,
    case: &OutVariantFixtureCase,
    fixture_path: &Path,
    mode: ExecutionMode,
) -> Result<OutVariantCaseReport, String> {
    let info = find_op(&case.op)
        .ok_or_else(|| format!("case '{}' names unknown operator '{}'", case.name, case.op))?;
    if info.is_binary() != case.partner.is_some() {
        return Err(format!("case '{}' arity does not match its fixture inputs", case.name));
    }
    let dtype = parse_dtype(&case.dtype, &case.name)?;
    let tolerance = case.tolerance.unwrap_or(1e-12);
    let is_float = dtype.is_floating_point();
    let partner = case.partner.as_deref();

    let mut session = FrankenOpsSession::with_seed(mode, case_seed(&case.name))
        .map_err(|error| format!("case '{}' session: {error}", case.name))?;

    let mut out_matches_function = true;
    let mut shape_mismatch_fails_closed = true;
    let mut integral_out_policy_ok = true;
    let mut missing_out_rejected = true;

    if info.supports_out {
        let nodes =
            build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
                .map_err(|error| format!("case '{}': {error}", case.name))?;
        if is_float || !info.promotes_integers_to_float {
            let fn_out = session
                .call_function(info.name, &nodes)
                .map_err(|error| format!("case '{}' function call: {error}", case.name))?;
            let fn_values = session
                .values_f64(fn_out)
                .map_err(|error| format!("case '{}' function values: {error}", case.name))?;
            let dest = session
                .tensor_constant(DenseTensor::zeros(case.shape.clone(), dtype, Device::Cpu));
            let returned = session
                .call_out(info.name, &nodes, dest)
                .map_err(|error| format!("case '{}' out call: {error}", case.name))?;
            let dest_values = session
                .values_f64(dest)
                .map_err(|error| format!("case '{}' out values: {error}", case.name))?;
            out_matches_function = returned == dest && vec_within(&dest_values, &fn_values, tolerance);
        } else {
            // A promoting operator may never widen an integral destination.
            let dest = session
                .tensor_constant(DenseTensor::zeros(case.shape.clone(), dtype, Device::Cpu));
            integral_out_policy_ok &= match session.call_out(info.name, &nodes, dest) {
                Ok(_) => false,
                Err(error) => {
                    let untouched = session
                        .values_f64(dest)
                        .map_err(|error| format!("case '{}' dest values: {error}", case.name))?
                        .iter()
                        .all(|value| *value == 0.0);
                    error.is_promotion_failure() && untouched
                }
            };
        }

        if let Some(wrong_shape) = &case.mismatched_shape {
            let nodes =
                build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
                    .map_err(|error| format!("case '{}': {error}", case.name))?;
            let dest = session
                .tensor_constant(DenseTensor::zeros(wrong_shape.clone(), dtype, Device::Cpu));
            shape_mismatch_fails_closed &= match session.call_out(info.name, &nodes, dest) {
                Ok(_) => false,
                Err(_) => session
                    .values_f64(dest)
                    .map_err(|error| format!("case '{}' dest values: {error}", case.name))?
                    .iter()
                    .all(|value| *value == 0.0),
            };
        }
    } else {
        let nodes =
            build_input_nodes(&mut session, dtype, &case.shape, &case.values, partner, false)
                .map_err(|error| format!("case '{}': {error}", case.name))?;
        let dest = session
            .tensor_constant(DenseTensor::zeros(case.shape.clone(), dtype, Device::Cpu));
        missing_out_rejected &= matches!(
            session.call_out(info.name, &nodes, dest),
            Err(ApiError::Op {
                source: AutogradError::Dispatch(DispatchError::MissingOutVariant { .. }),
                ..
            })
        );
        missing_out_rejected &= !session.registry().has_out(info.name);
    }

    let outcome_pass = out_matches_function
        && shape_mismatch_fails_closed
        && integral_out_policy_ok
        && missing_out_rejected;

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("operator".to_string(), json!(case.op));
    extra_fields.insert("dtype".to_string(), json!(case.dtype));
    extra_fields.insert("supports_out".to_string(), json!(info.supports_out));
    extra_fields.insert(
        "promotes_integer_to_float".to_string(),
        json!(info.promotes_integers_to_float),
    );
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );

    let log = StructuredCaseLog::new(
        OUT_VARIANT_SUITE,
        "out_variant_cases",
        OUT_VARIANT_PACKET,
        &case.name,
        mode,
        vec![
            fixture_path.display().to_string(),
            config.oracle_root.display().to_string(),
        ],
        format!(
            "cargo test -p fo-conformance out_variant_suite_is_green_in_strict_mode -- --nocapture # mode={}",
            mode_label(mode)
        ),
        if outcome_pass { "pass" } else { "fail" },
        if outcome_pass { "out_contract_ok" } else { "out_contract_violation" },
    )
    .with_extra_fields(extra_fields);

    Ok(OutVariantCaseReport {
        case_name: case.name.clone(),
        operator: case.op.clone(),
        out_matches_function,
        shape_mismatch_fails_closed,
        integral_out_policy_ok,
        missing_out_rejected,
        log,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct ElementwiseSnapshotFile {
    cases: Vec<ElementwiseSnapshotCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct ElementwiseSnapshotCase {
    name: String,
    op: String,
    dtype: String,
    shape: Vec<usize>,
    values: Vec<f64>,
    #[serde(default)]
    partner: Option<Vec<f64>>,
    output: Vec<f64>,
    #[serde(default)]
    tolerance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct GradientSnapshotFile {
    cases: Vec<GradientSnapshotCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct GradientSnapshotCase {
    name: String,
    op: String,
    dtype: String,
    shape: Vec<usize>,
    values: Vec<f64>,
    #[serde(default)]
    partner: Option<Vec<f64>>,
    output: Vec<f64>,
    grads: Vec<Vec<f64>>,
    #[serde(default)]
    tolerance: Option<f64>,
}

/// Replays the recorded legacy-runtime snapshots and classifies every
/// comparison. Strict mode blocks on any drift; hardened mode tolerates
/// drift ids the per-packet allowlist carries.
pub fn run_differential_conformance(
    config: &HarnessConfig,
    modes: &[ExecutionMode],
) -> Result<DifferentialHarnessReport, String> {
    let selected: Vec<ExecutionMode> = if modes.is_empty() {
        vec![ExecutionMode::Strict, ExecutionMode::Hardened]
    } else {
        modes.to_vec()
    };
    let allowlist = load_allowlist(config.allowlist_path.as_path())?;
    let oracle = probe_oracle(config);
    let mut checks = Vec::new();

    for mode in selected.iter().copied() {
        let elementwise_path = config.oracle_root.join(ORACLE_SNAPSHOT_FILES[0]);
        if elementwise_path.is_file() {
            let snapshot: ElementwiseSnapshotFile = load_fixture(elementwise_path.as_path())?;
            for case in &snapshot.cases {
                let observed = evaluate_elementwise_case(case, mode)?;
                checks.push(compare_vec_abs_tol(
                    &allowlist,
                    ORACLE_ELEMENTWISE_SUITE,
                    DIFFERENTIAL_PACKET,
                    mode,
                    &case.name,
                    "vec_abs_tol",
                    "oracle.elementwise_value_drift",
                    &observed,
                    &case.output,
                    case.tolerance.unwrap_or(1e-12),
                    snapshot_evidence_refs(config, ORACLE_SNAPSHOT_FILES[0]),
                ));
            }
        } else {
            checks.push(oracle_unavailable_check(
                ORACLE_ELEMENTWISE_SUITE,
                mode,
                "legacy_elementwise",
                oracle.message.clone(),
                snapshot_evidence_refs(config, ORACLE_SNAPSHOT_FILES[0]),
            ));
        }

        let gradient_path = config.oracle_root.join(ORACLE_SNAPSHOT_FILES[1]);
        if gradient_path.is_file() {
            let snapshot: GradientSnapshotFile = load_fixture(gradient_path.as_path())?;
            for case in &snapshot.cases {
                let (output, grads) = evaluate_gradient_case(case, mode)?;
                let tolerance = case.tolerance.unwrap_or(1e-12);
                checks.push(compare_vec_abs_tol(
                    &allowlist,
                    ORACLE_GRADIENT_SUITE,
                    DIFFERENTIAL_PACKET,
                    mode,
                    &case.name,
                    "vec_abs_tol",
                    "oracle.gradient_output_drift",
                    &output,
                    &case.output,
                    tolerance,
                    snapshot_evidence_refs(config, ORACLE_SNAPSHOT_FILES[1]),
                ));
                for (index, expected_grad) in case.grads.iter().enumerate() {
                    let observed_grad: &[f64] =
                        grads.get(index).map(Vec::as_slice).unwrap_or(&[]);
                    checks.push(compare_vec_abs_tol(
                        &allowlist,
                        ORACLE_GRADIENT_SUITE,
                        DIFFERENTIAL_PACKET,
                        mode,
                        &format!("{}::grad{index}", case.name),
                        "vec_abs_tol",
                        "oracle.gradient_value_drift",
                        observed_grad,
                        expected_grad,
                        tolerance,
                        snapshot_evidence_refs(config, ORACLE_SNAPSHOT_FILES[1]),
                    ));
                }
            }
        } else {
            checks.push(oracle_unavailable_check(
                ORACLE_GRADIENT_SUITE,
                mode,
                "legacy_gradients",
                oracle.message.clone(),
                snapshot_evidence_refs(config, ORACLE_SNAPSHOT_FILES[1]),
            ));
        }
    }

    let failed_checks = checks
        .iter()
        .filter(|check| check.status == "blocking_drift" || check.status == "oracle_unavailable")
        .count();
    let allowlisted_drifts = checks
        .iter()
        .filter(|check| check.status == "allowlisted_drift")
        .count();
    let blocking_drifts = checks
        .iter()
        .filter(|check| check.status == "blocking_drift")
        .count();
    Ok(DifferentialHarnessReport {
        schema_version: DIFFERENTIAL_SCHEMA_VERSION,
        oracle,
        modes: selected.iter().copied().map(mode_label).collect(),
        total_checks: checks.len(),
        failed_checks,
        allowlisted_drifts,
        blocking_drifts,
        checks,
    })
}

fn evaluate_elementwise_case(
    case: &ElementwiseSnapshotCase,
    mode: ExecutionMode,
) -> Result<Vec<f64>, String> {
    let dtype = parse_dtype(&case.dtype, &case.name)?;
    let mut session = FrankenOpsSession::with_seed(mode, case_seed(&case.name))
        .map_err(|error| format!("snapshot case '{}' session: {error}", case.name))?;
    let nodes = build_input_nodes(
        &mut session,
        dtype,
        &case.shape,
        &case.values,
        case.partner.as_deref(),
        false,
    )
    .map_err(|error| format!("snapshot case '{}': {error}", case.name))?;
    let out = session
        .call_function(&case.op, &nodes)
        .map_err(|error| format!("snapshot case '{}' call: {error}", case.name))?;
    session
        .values_f64(out)
        .map_err(|error| format!("snapshot case '{}' values: {error}", case.name))
}

fn evaluate_gradient_case(
    case: &GradientSnapshotCase,
    mode: ExecutionMode,
) -> Result<(Vec<f64>, Vec<Vec<f64>>), String> {
    let dtype = parse_dtype(&case.dtype, &case.name)?;
    let mut session = FrankenOpsSession::with_seed(mode, case_seed(&case.name))
        .map_err(|error| format!("snapshot case '{}' session: {error}", case.name))?;
    let nodes = build_input_nodes(
        &mut session,
        dtype,
        &case.shape,
        &case.values,
        case.partner.as_deref(),
        true,
    )
    .map_err(|error| format!("snapshot case '{}': {error}", case.name))?;
    let out = session
        .call_function(&case.op, &nodes)
        .map_err(|error| format!("snapshot case '{}' call: {error}", case.name))?;
    let output = session
        .values_f64(out)
        .map_err(|error| format!("snapshot case '{}' values: {error}", case.name))?;
    let report = session
        .backward(out)
        .map_err(|error| format!("snapshot case '{}' backward: {error}", case.name))?;
    let mut grads = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let grad = session
            .grad_of(&report, *node)
            .ok_or_else(|| format!("snapshot case '{}' is missing an input gradient", case.name))?;
        grads.push(
            session
                .values_f64(grad)
                .map_err(|error| format!("snapshot case '{}' grads: {error}", case.name))?,
        );
    }
    Ok((output, grads))
}

fn probe_oracle(config: &HarnessConfig) -> OracleStatus {
    let missing: Vec<&str> = ORACLE_SNAPSHOT_FILES
        .iter()
        .copied()
        .filter(|file| !config.oracle_root.join(file).is_file())
        .collect();
    if missing.is_empty() {
        OracleStatus {
            oracle_root: config.oracle_root.display().to_string(),
            available: true,
            message: "recorded oracle snapshots present".to_string(),
        }
    } else {
        OracleStatus {
            oracle_root: config.oracle_root.display().to_string(),
            available: false,
            message: format!("missing oracle snapshots: {}", missing.join(", ")),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn compare_vec_abs_tol(
    allowlist: &AllowlistIndex,
    suite: &'static str,
    packet_id: &'static str,
    mode: ExecutionMode,
    case_name: &str,
    comparator: &'static str,
    drift_id: &str,
    observed: &[f64],
    expected: &[f64],
    tolerance: f64,
    evidence_refs: Vec<String>,
) -> DifferentialCheck {
    let mismatch = !vec_within(observed, expected, tolerance);
    let (status, allowlisted, drift) =
        classify_drift_status(allowlist, packet_id, mode, mismatch, drift_id);
    DifferentialCheck {
        suite,
        packet_id,
        scenario_id: scenario_id(suite, mode, case_name),
        case_name: case_name.to_string(),
        mode: mode_label(mode),
        comparator,
        status,
        allowlisted,
        drift_id: drift,
        reason_code: if mismatch { drift_id.to_string() } else { "parity_ok".to_string() },
        observed: bounded_diagnostic(&format_values(observed), DIAGNOSTIC_BYTES),
        expected: bounded_diagnostic(&format_values(expected), DIAGNOSTIC_BYTES),
        evidence_refs,
    }
}

fn classify_drift_status(
    allowlist: &AllowlistIndex,
    packet_id: &str,
    mode: ExecutionMode,
    mismatch: bool,
    drift_id: &str,
) -> (&'static str, bool, Option<String>) {
    if !mismatch {
        return ("pass", false, None);
    }
    if mode == ExecutionMode::Hardened && allowlist.contains(packet_id, drift_id) {
        return ("allowlisted_drift", true, Some(drift_id.to_string()));
    }
    ("blocking_drift", false, Some(drift_id.to_string()))
}

fn oracle_unavailable_check(
    suite: &'static str,
    mode: ExecutionMode,
    snapshot: &str,
    message: String,
    evidence_refs: Vec<String>,
) -> DifferentialCheck {
    DifferentialCheck {
        suite,
        packet_id: DIFFERENTIAL_PACKET,
        scenario_id: scenario_id(suite, mode, snapshot),
        case_name: snapshot.to_string(),
        mode: mode_label(mode),
        comparator: "oracle_snapshot",
        status: "oracle_unavailable",
        allowlisted: false,
        drift_id: None,
        reason_code: "oracle_snapshot_unavailable".to_string(),
        observed: message,
        expected: "recorded oracle snapshot on disk".to_string(),
        evidence_refs,
    }
}

fn snapshot_evidence_refs(config: &HarnessConfig, snapshot: &str) -> Vec<String> {
    vec![
        config.oracle_root.join(snapshot).display().to_string(),
        config.allowlist_path.display().to_string(),
    ]
}

#[derive(Debug, Clone, Deserialize)]
struct AllowlistFile {
    #[serde(default)]
    packets: BTreeMap<String, AllowlistPacket>,
}

#[derive(Debug, Clone, Deserialize)]
struct AllowlistPacket {
    #[serde(default)]
    allowed_deviations: Vec<AllowlistDeviation>,
}

#[derive(Debug, Clone, Deserialize)]
struct AllowlistDeviation {
    id: String,
}

/// A missing allowlist is an empty allowlist, so strict runs lose nothing.
pub fn load_allowlist(path: &Path) -> Result<AllowlistIndex, String> {
    if !path.is_file() {
        return Ok(AllowlistIndex::default());
    }
    let document: AllowlistFile = load_fixture(path)?;
    let mut by_packet = BTreeMap::new();
    for (packet_id, packet) in document.packets {
        let ids = packet
            .allowed_deviations
            .into_iter()
            .map(|deviation| deviation.id)
            .collect::<BTreeSet<_>>();
        by_packet.insert(packet_id, ids);
    }
    Ok(AllowlistIndex { by_packet })
}

/// Writes the differential report as pretty JSON, creating parent
/// directories as needed.
pub fn emit_differential_report(
    config: &HarnessConfig,
    output_path: &Path,
    modes: &[ExecutionMode],
) -> Result<DifferentialHarnessReport, String> {
    emit_differential_report_filtered(config, output_path, modes, None)
}

pub fn emit_differential_report_filtered(
    config: &HarnessConfig,
    output_path: &Path,
    modes: &[ExecutionMode],
    packet_filter: Option<&str>,
) -> Result<DifferentialHarnessReport, String> {
    let mut report = run_differential_conformance(config, modes)?;
    if let Some(packet_id) = packet_filter {
        report = project_differential_report_to_packet(report, packet_id);
    }
    let serialized = serde_json::to_string_pretty(&report)
        .map_err(|error| format!("failed to serialize differential report: {error}"))?;
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create {}: {error}", parent.display()))?;
    }
    fs::write(output_path, serialized)
        .map_err(|error| format!("failed to write {}: {error}", output_path.display()))?;
    Ok(report)
}

/// Narrows a report to one packet and recounts its totals from the surviving
/// checks.
#[must_use]
pub fn project_differential_report_to_packet(
    report: DifferentialHarnessReport,
    packet_id: &str,
) -> DifferentialHarnessReport {
    let DifferentialHarnessReport {
        schema_version,
        oracle,
        modes,
        checks,
        ..
    } = report;
    let checks: Vec<DifferentialCheck> = checks
        .into_iter()
        .filter(|check| check.packet_id == packet_id)
        .collect();
    let allowlisted_drifts = checks
        .iter()
        .filter(|check| check.status == "allowlisted_drift")
        .count();
    let blocking_drifts = checks
        .iter()
        .filter(|check| check.status == "blocking_drift")
        .count();
    let failed_checks = checks
        .iter()
        .filter(|check| check.status == "blocking_drift" || check.status == "oracle_unavailable")
        .count();
    DifferentialHarnessReport {
        schema_version,
        oracle,
        modes,
        total_checks: checks.len(),
        failed_checks,
        allowlisted_drifts,
        blocking_drifts,
        checks,
    }
}

/// Runs every suite in every selected mode and writes one JSON log line per
/// case. Differential checks are projected into the same envelope so a single
/// JSONL file covers the whole packet matrix.
pub fn emit_e2e_forensics_matrix(
    config: &HarnessConfig,
    output_path: &Path,
    modes: &[ExecutionMode],
) -> Result<E2EForensicsSummary, String> {
    emit_e2e_forensics_matrix_filtered(config, output_path, modes, None)
}

pub fn emit_e2e_forensics_matrix_filtered(
    config: &HarnessConfig,
    output_path: &Path,
    modes: &[ExecutionMode],
    packet_filter: Option<&str>,
) -> Result<E2EForensicsSummary, String> {
    let selected: Vec<ExecutionMode> = if modes.is_empty() {
        vec![ExecutionMode::Strict, ExecutionMode::Hardened]
    } else {
        modes.to_vec()
    };
    let in_scope =
        |packet_id: &str| packet_filter.is_none_or(|filter| filter == packet_id);
    let mut logs: Vec<StructuredCaseLog> = Vec::new();
    for mode in selected.iter().copied() {
        if in_scope(DTYPE_SUPPORT_PACKET) {
            let (_, cases) = run_dtype_support_conformance(config, mode)?;
            logs.extend(cases.into_iter().map(|case| case.log));
        }
        if in_scope(GRADIENT_PACKET) {
            let (_, cases) = run_gradient_conformance(config, mode)?;
            logs.extend(cases.into_iter().map(|case| case.log));
        }
        if in_scope(VARIANT_PACKET) {
            let (_, cases) = run_variant_conformance(config, mode)?;
            logs.extend(cases.into_iter().map(|case| case.log));
        }
        if in_scope(JIT_PACKET) {
            let (_, cases) = run_jit_conformance(config, mode)?;
            logs.extend(cases.into_iter().map(|case| case.log));
        }
        if in_scope(OUT_VARIANT_PACKET) {
            let (_, cases) = run_out_variant_conformance(config, mode)?;
            logs.extend(cases.into_iter().map(|case| case.log));
        }
    }
    if in_scope(DIFFERENTIAL_PACKET) {
        let report = run_differential_conformance(config, &selected)?;
        logs.extend(report.checks.iter().map(differential_check_log));
    }

    let mut lines = String::new();
    let mut failed_entries = 0;
    for log in &logs {
        if log.outcome != "pass" {
            failed_entries += 1;
        }
        let line = serde_json::to_string(log)
            .map_err(|error| format!("failed to serialize forensic log: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create {}: {error}", parent.display()))?;
    }
    fs::write(output_path, lines)
        .map_err(|error| format!("failed to write {}: {error}", output_path.display()))?;
    Ok(E2EForensicsSummary {
        output_path: output_path.to_path_buf(),
        log_entries: logs.len(),
        failed_entries,
        modes: selected,
    })
}

/// Projects a differential check into the forensic log envelope. Allowlisted
/// drift counts as a pass: it is documented debt, not a regression.
fn differential_check_log(check: &DifferentialCheck) -> StructuredCaseLog {
    let mode = if check.mode == "hardened" {
        ExecutionMode::Hardened
    } else {
        ExecutionMode::Strict
    };
    let outcome = if check.status == "pass" || check.status == "allowlisted_drift" {
        "pass"
    } else {
        "fail"
    };
    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("packet_projection".to_string(), json!("differential_check"));
    extra_fields.insert("comparator".to_string(), json!(check.comparator));
    extra_fields.insert("status".to_string(), json!(check.status));
    extra_fields.insert("allowlisted".to_string(), json!(check.allowlisted));
    extra_fields.insert("observed".to_string(), json!(check.observed));
    extra_fields.insert("expected".to_string(), json!(check.expected));
    if let Some(drift_id) = &check.drift_id {
        extra_fields.insert("drift_id".to_string(), json!(drift_id));
    }
    StructuredCaseLog::new(
        check.suite,
        "oracle_snapshots",
        DIFFERENTIAL_PACKET,
        &check.case_name,
        mode,
        check.evidence_refs.clone(),
        format!(
            "cargo run -p fo-conformance --bin run_differential_report -- --mode {} --packet {DIFFERENTIAL_PACKET}",
            check.mode
        ),
        outcome,
        &check.reason_code,
    )
    .with_extra_fields(extra_fields)
}

/// Times repeated single-packet e2e emissions against a scratch file. Any
/// failing entry aborts the bench; timing a broken packet is meaningless.
pub fn run_packet_e2e_microbench(
    config: &HarnessConfig,
    iterations: usize,
    packet_id: &str,
) -> Result<BenchReport, String> {
    let iterations = iterations.max(1);
    let scratch = std::env::temp_dir().join(format!(
        "fo_e2e_bench_{}_{}.jsonl",
        std::process::id(),
        canonical_case_name(packet_id)
    ));
    let mut samples = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let started = Instant::now();
        let summary = emit_e2e_forensics_matrix_filtered(
            config,
            scratch.as_path(),
            &[ExecutionMode::Strict],
            Some(packet_id),
        )?;
        if summary.failed_entries > 0 {
            let _ = fs::remove_file(scratch.as_path());
            return Err(format!(
                "microbench aborted: {} failing entries for packet {packet_id}",
                summary.failed_entries
            ));
        }
        samples.push(started.elapsed().as_nanos());
    }
    let _ = fs::remove_file(scratch.as_path());
    samples.sort_unstable();
    let mean_ns = samples.iter().sum::<u128>() / samples.len() as u128;
    Ok(BenchReport {
        iterations,
        p50_ns: percentile(&samples, 50),
        p95_ns: percentile(&samples, 95),
        p99_ns: percentile(&samples, 99),
        mean_ns,
    })
}

/// Nearest-rank percentile over an ascending sample list.
fn percentile(sorted: &[u128], p: usize) -> u128 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() - 1) * p.min(100) / 100;
    sorted[rank]
}

/// `{suite}/{mode}:{case}` with the case name folded to a filesystem-safe
/// alphabet, so scenario ids can double as artifact file names.
#[must_use]
pub fn scenario_id(suite_id: &str, mode: ExecutionMode, case_name: &str) -> String {
    format!("{suite_id}/{}:{}", mode_label(mode), canonical_case_name(case_name))
}

fn canonical_case_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn within(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}

fn vec_within(actual: &[f64], expected: &[f64], tolerance: f64) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected.iter())
            .all(|(a, e)| within(*a, *e, tolerance))
}

fn format_values(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|value| format!("{value:.15}")).collect();
    format!("[{}]", parts.join(", "))
}

fn bounded_diagnostic(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut cut = max_len;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &input[..cut])
}

fn load_fixture<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let metadata = fs::metadata(path)
        .map_err(|error| format!("failed to stat fixture {}: {error}", path.display()))?;
    if metadata.len() > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds {MAX_FIXTURE_BYTES} bytes",
            path.display()
        ));
    }
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed to read fixture {}: {error}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|error| format!("failed to parse fixture {}: {error}", path.display()))
}

fn summarize_passes<I: IntoIterator<Item = bool>>(passes: I) -> (usize, usize) {
    let mut total = 0;
    let mut passed = 0;
    for pass in passes {
        total += 1;
        if pass {
            passed += 1;
        }
    }
    (total, passed)
}

fn runtime_evidence_field(ledger: &EvidenceLedger) -> Value {
    let mut kind_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for entry in ledger.entries() {
        *kind_counts.entry(entry.kind.label()).or_insert(0) += 1;
    }
    let entries: Vec<Value> = ledger
        .entries()
        .iter()
        .map(|entry| {
            json!({
                "ts_unix_ms": entry.ts_unix_ms,
                "kind": entry.kind.label(),
                "summary": entry.summary,
            })
        })
        .collect();
    json!({
        "total_entries": ledger.len(),
        "kind_counts": kind_counts,
        "entries": entries,
    })
}

fn case_seed(case_name: &str) -> u64 {
    logging::det_hash64(&[case_name]).max(1)
}

fn parse_dtype(token: &str, case_name: &str) -> Result<DType, String> {
    DType::parse_token(token)
        .ok_or_else(|| format!("case '{case_name}' uses unknown dtype token `{token}`"))
}

fn dtype_set_from_tokens(tokens: &[String], case_name: &str) -> Result<DTypeSet, String> {
    let mut set = DTypeSet::EMPTY;
    for token in tokens {
        set = set.with(parse_dtype(token, case_name)?);
    }
    Ok(set)
}

fn case_tensor(dtype: DType, shape: &[usize], values: &[f64]) -> Result<DenseTensor, String> {
    DenseTensor::from_values(
        TensorData::from_f64_values(dtype, values),
        shape.to_vec(),
        Device::Cpu,
    )
    .map_err(|error| format!("tensor build failed: {error}"))
}

fn ones_tensor(shape: &[usize], dtype: DType) -> Result<DenseTensor, String> {
    let numel: usize = shape.iter().product();
    case_tensor(dtype, shape, &vec![1.0_f64; numel])
}

fn build_input_nodes(
    session: &mut FrankenOpsSession,
    dtype: DType,
    shape: &[usize],
    values: &[f64],
    partner: Option<&[f64]>,
    as_variables: bool,
) -> Result<Vec<NodeId>, String> {
    let mut nodes = Vec::with_capacity(2);
    let primary = case_tensor(dtype, shape, values)?;
    if as_variables {
        nodes.push(
            session
                .tensor_variable(primary)
                .map_err(|error| format!("variable build failed: {error}"))?,
        );
    } else {
        nodes.push(session.tensor_constant(primary));
    }
    if let Some(partner_values) = partner {
        let tensor = case_tensor(dtype, shape, partner_values)?;
        if as_variables {
            nodes.push(
                session
                    .tensor_variable(tensor)
                    .map_err(|error| format!("variable build failed: {error}"))?,
            );
        } else {
            nodes.push(session.tensor_constant(tensor));
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_artifact(stem: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{stem}_{}.out", std::process::id()))
    }

    #[test]
    fn dtype_support_suite_is_green_in_strict_mode() {
        let config = HarnessConfig::default_paths();
        let (report, cases) =
            run_dtype_support_conformance(&config, ExecutionMode::Strict).expect("suite runs");
        assert_eq!(report.suite, DTYPE_SUPPORT_SUITE);
        assert!(report.strict_mode);
        assert_eq!(report.cases_total, cases.len());
        assert_eq!(report.cases_total, report.cases_passed);
        for case in &cases {
            assert!(case.passed(), "case {} failed: {case:?}", case.case_name);
            assert_eq!(case.log.outcome, "pass");
            assert_eq!(case.log.packet_id, DTYPE_SUPPORT_PACKET);
        }
    }

    #[test]
    fn gradient_suite_is_green_in_strict_mode() {
        let config = HarnessConfig::default_paths();
        let (report, cases) =
            run_gradient_conformance(&config, ExecutionMode::Strict).expect("suite runs");
        assert_eq!(report.cases_total, report.cases_passed);
        for case in &cases {
            assert!(case.passed(), "case {} failed: {case:?}", case.case_name);
            assert!(case.non_float_rejected, "case {}", case.case_name);
            assert!(!case.waiver_applied, "strict runs never relax: {}", case.case_name);
        }
    }

    #[test]
    fn gradient_waivers_only_relax_hardened_runs() {
        let config = HarnessConfig::default_paths();
        let (_, hardened) =
            run_gradient_conformance(&config, ExecutionMode::Hardened).expect("suite runs");
        let waived: Vec<&GradientCaseReport> =
            hardened.iter().filter(|case| case.waiver_applied).collect();
        assert!(!waived.is_empty(), "fixture carries at least one waiver");
        for case in waived {
            assert!(case.passed(), "waived case {} still passes", case.case_name);
            assert_eq!(case.log.mode, "hardened");
        }
    }

    #[test]
    fn variant_suite_is_green_in_strict_mode() {
        let config = HarnessConfig::default_paths();
        let (report, cases) =
            run_variant_conformance(&config, ExecutionMode::Strict).expect("suite runs");
        assert_eq!(report.cases_total, report.cases_passed);
        for case in &cases {
            assert!(case.passed(), "case {} failed: {case:?}", case.case_name);
        }
        // The registry gaps must be exercised, not just the happy paths.
        assert!(cases.iter().any(|case| case.operator == "sigmoid"));
        assert!(cases.iter().any(|case| case.operator == "log"));
    }

    #[test]
    fn jit_suite_is_green_in_strict_mode() {
        let config = HarnessConfig::default_paths();
        let (report, cases) =
            run_jit_conformance(&config, ExecutionMode::Strict).expect("suite runs");
        assert_eq!(report.cases_total, report.cases_passed);
        for case in &cases {
            assert!(case.passed(), "case {} failed: {case:?}", case.case_name);
            assert!(case.graphs_isomorphic, "case {}", case.case_name);
        }
        assert!(
            cases.iter().any(|case| case.operators.len() > 1),
            "fixture exercises multi-op chains"
        );
    }

    #[test]
    fn out_variant_suite_is_green_in_strict_mode() {
        let config = HarnessConfig::default_paths();
        let (report, cases) =
            run_out_variant_conformance(&config, ExecutionMode::Strict).expect("suite runs");
        assert_eq!(report.cases_total, report.cases_passed);
        for case in &cases {
            assert!(case.passed(), "case {} failed: {case:?}", case.case_name);
        }
        assert!(cases.iter().any(|case| case.operator == "sigmoid"));
    }

    #[test]
    fn forensic_log_envelope_is_replayable() {
        let config = HarnessConfig::default_paths();
        let (_, first) =
            run_dtype_support_conformance(&config, ExecutionMode::Strict).expect("suite runs");
        let (_, second) =
            run_dtype_support_conformance(&config, ExecutionMode::Strict).expect("suite runs");
        let a = &first[0].log;
        let b = &second[0].log;
        assert_eq!(a.schema_version, FORENSICS_SCHEMA_VERSION);
        assert!(a.seed > 0);
        assert!(a.env_fingerprint.starts_with("det64:"));
        assert_eq!(a.mode, "strict");
        assert_eq!(
            a.scenario_id,
            scenario_id(DTYPE_SUPPORT_SUITE, ExecutionMode::Strict, &first[0].case_name)
        );
        // Replay coordinates are stable across runs even though timestamps move.
        assert_eq!(a.scenario_id, b.scenario_id);
        assert_eq!(a.seed, b.seed);
        assert!(a.replay_command.contains("--nocapture"));
        assert_eq!(a.artifact_refs.len(), 2);
    }

    #[test]
    fn differential_report_is_parity_clean_in_both_modes() {
        let config = HarnessConfig::default_paths();
        let output = temp_artifact("fo_differential_report");
        let report = emit_differential_report(
            &config,
            output.as_path(),
            &[ExecutionMode::Strict, ExecutionMode::Hardened],
        )
        .expect("report emits");
        assert_eq!(report.schema_version, DIFFERENTIAL_SCHEMA_VERSION);
        assert!(report.oracle.available, "{}", report.oracle.message);
        assert_eq!(report.modes, vec!["strict", "hardened"]);
        assert!(report.total_checks > 0);
        assert_eq!(report.blocking_drifts, 0, "checks: {:#?}", report.checks);
        assert_eq!(report.failed_checks, 0);
        let strict_count = report.checks.iter().filter(|c| c.mode == "strict").count();
        let hardened_count = report.checks.iter().filter(|c| c.mode == "hardened").count();
        assert_eq!(strict_count, hardened_count);
        let raw = fs::read_to_string(output.as_path()).expect("report written");
        let parsed: Value = serde_json::from_str(&raw).expect("report parses");
        assert_eq!(parsed["schema_version"], DIFFERENTIAL_SCHEMA_VERSION);
        let _ = fs::remove_file(output.as_path());
    }

    #[test]
    fn allowlist_only_downgrades_hardened_drift() {
        let config = HarnessConfig::default_paths();
        let allowlist = load_allowlist(config.allowlist_path.as_path()).expect("allowlist loads");
        assert!(allowlist.contains(DIFFERENTIAL_PACKET, "oracle.exp_tail_rounding"));

        let clean = classify_drift_status(
            &allowlist,
            DIFFERENTIAL_PACKET,
            ExecutionMode::Strict,
            false,
            "oracle.exp_tail_rounding",
        );
        assert_eq!(clean, ("pass", false, None));
        let strict = classify_drift_status(
            &allowlist,
            DIFFERENTIAL_PACKET,
            ExecutionMode::Strict,
            true,
            "oracle.exp_tail_rounding",
        );
        assert_eq!(strict.0, "blocking_drift");
        let hardened = classify_drift_status(
            &allowlist,
            DIFFERENTIAL_PACKET,
            ExecutionMode::Hardened,
            true,
            "oracle.exp_tail_rounding",
        );
        assert_eq!(hardened.0, "allowlisted_drift");
        assert!(hardened.1);
        let unknown = classify_drift_status(
            &allowlist,
            DIFFERENTIAL_PACKET,
            ExecutionMode::Hardened,
            true,
            "oracle.unfiled_drift",
        );
        assert_eq!(unknown.0, "blocking_drift");
    }

    #[test]
    fn packet_projection_recounts_drift_totals() {
        let make_check = |packet_id: &'static str, status: &'static str| DifferentialCheck {
            suite: ORACLE_ELEMENTWISE_SUITE,
            packet_id,
            scenario_id: scenario_id(ORACLE_ELEMENTWISE_SUITE, ExecutionMode::Hardened, "probe"),
            case_name: "probe".to_string(),
            mode: "hardened",
            comparator: "vec_abs_tol",
            status,
            allowlisted: status == "allowlisted_drift",
            drift_id: None,
            reason_code: "probe".to_string(),
            observed: String::new(),
            expected: String::new(),
            evidence_refs: Vec::new(),
        };
        let report = DifferentialHarnessReport {
            schema_version: DIFFERENTIAL_SCHEMA_VERSION,
            oracle: OracleStatus {
                oracle_root: String::new(),
                available: true,
                message: String::new(),
            },
            modes: vec!["hardened"],
            total_checks: 4,
            failed_checks: 9,
            allowlisted_drifts: 9,
            blocking_drifts: 9,
            checks: vec![
                make_check(DIFFERENTIAL_PACKET, "pass"),
                make_check(DIFFERENTIAL_PACKET, "allowlisted_drift"),
                make_check(DIFFERENTIAL_PACKET, "blocking_drift"),
                make_check("FO-OPS-999", "blocking_drift"),
            ],
        };
        let projected = project_differential_report_to_packet(report, DIFFERENTIAL_PACKET);
        assert_eq!(projected.total_checks, 3);
        assert_eq!(projected.allowlisted_drifts, 1);
        assert_eq!(projected.blocking_drifts, 1);
        assert_eq!(projected.failed_checks, 1);
        assert!(projected.checks.iter().all(|c| c.packet_id == DIFFERENTIAL_PACKET));
    }

    #[test]
    fn missing_oracle_yields_unavailable_checks() {
        let scratch_root = std::env::temp_dir().join(format!(
            "fo_missing_oracle_{}",
            std::process::id()
        ));
        let config = HarnessConfig {
            oracle_root: scratch_root,
            ..HarnessConfig::default_paths()
        };
        let report = run_differential_conformance(&config, &[ExecutionMode::Strict])
            .expect("harness degrades instead of failing");
        assert!(!report.oracle.available);
        assert_eq!(report.total_checks, 2);
        assert_eq!(report.failed_checks, 2);
        assert_eq!(report.blocking_drifts, 0);
        for check in &report.checks {
            assert_eq!(check.status, "oracle_unavailable");
            assert_eq!(check.reason_code, "oracle_snapshot_unavailable");
            assert!(check.drift_id.is_none());
        }
    }

    #[test]
    fn e2e_matrix_writes_one_json_line_per_case() {
        let config = HarnessConfig::default_paths();
        let output = temp_artifact("fo_e2e_matrix");
        let summary = emit_e2e_forensics_matrix(
            &config,
            output.as_path(),
            &[ExecutionMode::Strict, ExecutionMode::Hardened],
        )
        .expect("matrix emits");
        assert_eq!(summary.failed_entries, 0);
        assert!(summary.log_entries > 0);
        let raw = fs::read_to_string(output.as_path()).expect("matrix written");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), summary.log_entries);
        let mut saw_projection = false;
        for line in lines {
            let entry: Value = serde_json::from_str(line).expect("entry parses");
            assert_eq!(entry["schema_version"], FORENSICS_SCHEMA_VERSION);
            assert_eq!(entry["outcome"], "pass");
            assert!(entry["seed"].as_u64().is_some_and(|seed| seed > 0));
            if entry["extra_fields"]["packet_projection"] == "differential_check" {
                saw_projection = true;
                assert_eq!(entry["packet_id"], DIFFERENTIAL_PACKET);
            }
        }
        assert!(saw_projection, "differential checks reach the matrix");
        let _ = fs::remove_file(output.as_path());
    }

    #[test]
    fn e2e_packet_filter_keeps_single_packet() {
        let config = HarnessConfig::default_paths();
        let output = temp_artifact("fo_e2e_packet_filter");
        let summary = emit_e2e_forensics_matrix_filtered(
            &config,
            output.as_path(),
            &[ExecutionMode::Strict],
            Some(VARIANT_PACKET),
        )
        .expect("matrix emits");
        assert!(summary.log_entries > 0);
        let raw = fs::read_to_string(output.as_path()).expect("matrix written");
        for line in raw.lines() {
            let entry: Value = serde_json::from_str(line).expect("entry parses");
            assert_eq!(entry["packet_id"], VARIANT_PACKET);
            assert_eq!(entry["mode"], "strict");
        }
        let _ = fs::remove_file(output.as_path());
    }

    #[test]
    fn microbench_reports_monotone_percentiles() {
        let config = HarnessConfig::default_paths();
        let report = run_packet_e2e_microbench(&config, 3, OUT_VARIANT_PACKET)
            .expect("bench runs");
        assert_eq!(report.iterations, 3);
        assert!(report.p50_ns <= report.p95_ns);
        assert!(report.p95_ns <= report.p99_ns);
        assert!(report.mean_ns > 0);
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let samples = [10_u128, 20, 30, 40, 50];
        assert_eq!(percentile(&samples, 0), 10);
        assert_eq!(percentile(&samples, 50), 30);
        assert_eq!(percentile(&samples, 100), 50);
        assert_eq!(percentile(&samples, 250), 50);
        assert_eq!(percentile(&[], 50), 0);
    }

    #[test]
    fn scenario_ids_fold_to_a_safe_alphabet() {
        let id = scenario_id("gradient", ExecutionMode::Hardened, "Exp Grad::tail check");
        assert_eq!(id, "gradient/hardened:exp_grad__tail_check");
    }

    #[test]
    fn bounded_diagnostic_respects_char_boundaries() {
        let input = "tensor mismatch: приклад significance overflow";
        let bounded = bounded_diagnostic(input, 20);
        assert!(bounded.ends_with("..."));
        assert!(bounded.len() <= 24);
        assert_eq!(bounded_diagnostic("short", 20), "short");
    }

    #[test]
    fn run_smoke_counts_fixtures_and_passes() {
        let config = HarnessConfig::default_paths();
        let report = run_smoke(&config);
        assert_eq!(report.suite, "frankenops_smoke");
        assert!(report.oracle_present);
        assert!(report.fixture_count >= 6);
        assert!(report.cases_total > 0);
        assert_eq!(report.cases_total, report.cases_passed);
        assert!(report.strict_mode);
    }
}
