#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use fo_core::{DenseTensor, TensorError};
use fo_dispatch::{OpSchema, SchemaRegistry};

/// Index into a graph's value space: ids below the input count name graph
/// inputs, the rest name node outputs in recording order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub op_name: String,
    pub value_inputs: Vec<ValueId>,
}

/// A straight-line SSA graph. Both the tracer and the script compiler
/// produce this form, so downstream consumers cannot tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    inputs: Vec<String>,
    nodes: Vec<GraphNode>,
    output: ValueId,
}

impl Graph {
    #[must_use]
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    #[must_use]
    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    #[must_use]
    pub fn output(&self) -> ValueId {
        self.output
    }

    fn value_name(&self, value: ValueId) -> String {
        match self.inputs.get(value.0) {
            Some(name) => format!("%{name}"),
            None => format!("%t{}", value.0),
        }
    }

    /// Positional rendering: every value is named by its id, so two graphs
    /// are isomorphic exactly when their canonical dumps are equal.
    #[must_use]
    pub fn canonical_dump(&self) -> String {
        let mut text = String::from("graph(");
        for index in 0..self.inputs.len() {
            if index > 0 {
                text.push_str(", ");
            }
            text.push_str(&format!("%{index}"));
        }
        text.push_str("):\n");
        for (index, node) in self.nodes.iter().enumerate() {
            text.push_str(&format!("  %{} = {}(", self.inputs.len() + index, node.op_name));
            for (arg_index, value) in node.value_inputs.iter().enumerate() {
                if arg_index > 0 {
                    text.push_str(", ");
                }
                text.push_str(&format!("%{}", value.0));
            }
            text.push_str(")\n");
        }
        text.push_str(&format!("  return %{}\n", self.output.0));
        text
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph(")?;
        for (index, name) in self.inputs.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "%{name}")?;
        }
        writeln!(f, "):")?;
        for (index, node) in self.nodes.iter().enumerate() {
            write!(
                f,
                "  {} = {}(",
                self.value_name(ValueId(self.inputs.len() + index)),
                node.op_name
            )?;
            for (arg_index, value) in node.value_inputs.iter().enumerate() {
                if arg_index > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", self.value_name(*value))?;
            }
            writeln!(f, ")")?;
        }
        writeln!(f, "  return {}", self.value_name(self.output))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JitError {
    Parse { line: usize, message: String },
    UnknownValue { name: String },
    UnknownOp { name: String },
    Arity { expected: usize, actual: usize },
    EmptyTrace,
    Apply(String),
    Tensor(TensorError),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { line, message } => write!(f, "parse error at line {line}: {message}"),
            Self::UnknownValue { name } => write!(f, "unknown graph value {name}"),
            Self::UnknownOp { name } => write!(f, "unknown operator {name}"),
            Self::Arity { expected, actual } => {
                write!(f, "graph expects {expected} inputs, got {actual}")
            }
            Self::EmptyTrace => write!(f, "trace recorded no operations"),
            Self::Apply(message) => write!(f, "graph execution failed: {message}"),
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
        }
    }
}

impl std::error::Error for JitError {}

impl From<TensorError> for JitError {
    fn from(inner: TensorError) -> Self {
        Self::Tensor(inner)
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> JitError {
    JitError::Parse {
        line,
        message: message.into(),
    }
}

fn parse_value_name(token: &str, line: usize) -> Result<String, JitError> {
    let name = token
        .strip_prefix('%')
        .ok_or_else(|| parse_error(line, format!("expected a %-prefixed value, got `{token}`")))?;
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(parse_error(line, format!("invalid value name `%{name}`")));
    }
    Ok(name.to_string())
}

/// Compiles the scripted form:
///
/// ```text
/// graph(%x, %y):
///   %z = fo::add(%x, %y)
///   return %z
/// ```
///
/// Each value must be defined exactly once and before use.
pub fn compile_graph_text(src: &str) -> Result<Graph, JitError> {
    let mut inputs: Vec<String> = Vec::new();
    let mut nodes: Vec<GraphNode> = Vec::new();
    let mut defined: BTreeMap<String, ValueId> = BTreeMap::new();
    let mut output: Option<ValueId> = None;
    let mut saw_header = false;
    let mut line_count = 0usize;

    for (index, raw) in src.lines().enumerate() {
        let line_no = index + 1;
        line_count = line_no;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if !saw_header {
            let body = line
                .strip_prefix("graph(")
                .and_then(|rest| rest.strip_suffix("):"))
                .ok_or_else(|| parse_error(line_no, "expected a `graph(...):` header"))?;
            for token in body.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let name = parse_value_name(token, line_no)?;
                if defined.contains_key(&name) {
                    return Err(parse_error(line_no, format!("value %{name} defined twice")));
                }
                let id = ValueId(inputs.len());
                defined.insert(name.clone(), id);
                inputs.push(name);
            }
            saw_header = true;
            continue;
        }
        if output.is_some() {
            return Err(parse_error(line_no, "text continues past `return`"));
        }
        if let Some(rest) = line.strip_prefix("return ") {
            let name = parse_value_name(rest.trim(), line_no)?;
            let id = defined
                .get(&name)
                .copied()
                .ok_or_else(|| JitError::UnknownValue {
                    name: format!("%{name}"),
                })?;
            output = Some(id);
            continue;
        }
        let (lhs, rhs) = line
            .split_once('=')
            .ok_or_else(|| parse_error(line_no, "expected `%value = ns::op(...)`"))?;
        let target = parse_value_name(lhs.trim(), line_no)?;
        if defined.contains_key(&target) {
            return Err(parse_error(line_no, format!("value %{target} defined twice")));
        }
        let rhs = rhs.trim();
        let open = rhs
            .find('(')
            .ok_or_else(|| parse_error(line_no, "missing `(` after operator name"))?;
        let op_name = rhs[..open].trim().to_string();
        if !op_name.contains("::") {
            return Err(parse_error(
                line_no,
                format!("operator names are namespaced, got `{op_name}`"),
            ));
        }
        let args_text = rhs[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| parse_error(line_no, "missing `)` after argument list"))?;
        let mut value_inputs = Vec::new();
        for token in args_text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let name = parse_value_name(token, line_no)?;
            let id = defined
                .get(&name)
                .copied()
                .ok_or_else(|| JitError::UnknownValue {
                    name: format!("%{name}"),
                })?;
            value_inputs.push(id);
        }
        let id = ValueId(inputs.len() + nodes.len());
        nodes.push(GraphNode {
            op_name,
            value_inputs,
        });
        defined.insert(target, id);
    }

    let output = output.ok_or_else(|| parse_error(line_count, "missing `return` line"))?;
    Ok(Graph {
        inputs,
        nodes,
        output,
    })
}

/// Observes one eager run and rebuilds it as a `Graph`. Callers key values
/// by whatever stable id their runtime uses for tensors.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    input_names: Vec<String>,
    value_of: BTreeMap<u64, ValueId>,
    nodes: Vec<GraphNode>,
}

impl TraceRecorder {
    #[must_use]
    pub fn new(inputs: &[u64]) -> Self {
        let mut recorder = Self::default();
        for (index, key) in inputs.iter().enumerate() {
            recorder.input_names.push(format!("arg{index}"));
            // A key passed twice keeps its first slot.
            recorder.value_of.entry(*key).or_insert(ValueId(index));
        }
        recorder
    }

    pub fn record_op(
        &mut self,
        op_name: &str,
        inputs: &[u64],
        out: u64,
    ) -> Result<(), JitError> {
        let mut value_inputs = Vec::with_capacity(inputs.len());
        for key in inputs {
            let id = self
                .value_of
                .get(key)
                .copied()
                .ok_or_else(|| JitError::UnknownValue {
                    name: format!("key:{key}"),
                })?;
            value_inputs.push(id);
        }
        let id = ValueId(self.input_names.len() + self.nodes.len());
        self.nodes.push(GraphNode {
            op_name: op_name.to_string(),
            value_inputs,
        });
        self.value_of.insert(out, id);
        Ok(())
    }

    pub fn finish(self, output: u64) -> Result<Graph, JitError> {
        if self.nodes.is_empty() {
            return Err(JitError::EmptyTrace);
        }
        let output = self
            .value_of
            .get(&output)
            .copied()
            .ok_or_else(|| JitError::UnknownValue {
                name: format!("key:{output}"),
            })?;
        Ok(Graph {
            inputs: self.input_names,
            nodes: self.nodes,
            output,
        })
    }
}

/// Host side of graph execution. The session implements this so executed
/// graphs flow through the same tape and dispatcher as eager calls.
pub trait OpApplier {
    type Value: Clone;

    fn apply(&mut self, op_name: &str, inputs: &[Self::Value]) -> Result<Self::Value, String>;
}

pub struct GraphExecutor;

impl GraphExecutor {
    /// Replays nodes in recorded order. Value ids always point backwards in
    /// a well-formed graph; dangling ids fail closed.
    pub fn run<A: OpApplier>(
        graph: &Graph,
        applier: &mut A,
        inputs: &[A::Value],
    ) -> Result<A::Value, JitError> {
        if inputs.len() != graph.inputs.len() {
            return Err(JitError::Arity {
                expected: graph.inputs.len(),
                actual: inputs.len(),
            });
        }
        let mut env: Vec<A::Value> = inputs.to_vec();
        for node in &graph.nodes {
            let mut args = Vec::with_capacity(node.value_inputs.len());
            for value in &node.value_inputs {
                args.push(env.get(value.0).cloned().ok_or_else(|| JitError::UnknownValue {
                    name: format!("%{}", value.0),
                })?);
            }
            let out = applier
                .apply(&node.op_name, &args)
                .map_err(JitError::Apply)?;
            env.push(out);
        }
        env.get(graph.output.0).cloned().ok_or_else(|| JitError::UnknownValue {
            name: format!("%{}", graph.output.0),
        })
    }
}

/// Order-sensitive digest of a tensor's dtype, shape, and logical values.
pub fn value_fingerprint(tensor: &DenseTensor) -> Result<u64, TensorError> {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut mix = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    };
    mix(&[tensor.dtype() as u8]);
    for dim in tensor.shape() {
        mix(&(*dim as u64).to_le_bytes());
    }
    for value in tensor.values_f64()? {
        mix(&value.to_bits().to_le_bytes());
    }
    Ok(hash)
}

/// Captures argument identity before an operation runs so the observation
/// can tell mutation from aliasing afterwards.
#[derive(Debug)]
pub struct AliasProbe {
    before: Vec<(u64, u64)>,
}

impl AliasProbe {
    pub fn before(args: &[&DenseTensor]) -> Result<Self, TensorError> {
        let before = args
            .iter()
            .map(|tensor| Ok((tensor.storage_id(), value_fingerprint(tensor)?)))
            .collect::<Result<_, TensorError>>()?;
        Ok(Self { before })
    }

    pub fn observe(
        &self,
        args: &[&DenseTensor],
        out: &DenseTensor,
    ) -> Result<AliasObservation, TensorError> {
        let mut arg_storage_ids = Vec::with_capacity(args.len());
        let mut arg_changed = Vec::with_capacity(args.len());
        for (index, tensor) in args.iter().enumerate() {
            arg_storage_ids.push(tensor.storage_id());
            let after = value_fingerprint(tensor)?;
            let changed = self
                .before
                .get(index)
                .is_some_and(|(_, fingerprint)| *fingerprint != after);
            arg_changed.push(changed);
        }
        Ok(AliasObservation {
            arg_storage_ids,
            arg_changed,
            out_storage_id: out.storage_id(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasObservation {
    pub arg_storage_ids: Vec<u64>,
    pub arg_changed: Vec<bool>,
    pub out_storage_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasCheckReport {
    pub schema: String,
    pub checked_args: usize,
    pub violations: Vec<String>,
}

impl AliasCheckReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

fn positional_args(schema: &OpSchema) -> Vec<&fo_dispatch::SchemaArg> {
    schema.args.iter().filter(|arg| !arg.keyword_only).collect()
}

/// Checks a schema's alias annotations against what one run actually did:
/// unannotated arguments must come back byte-identical, and the return
/// value may share storage only with the argument its annotation names.
pub fn check_alias_annotation(
    registry: &SchemaRegistry,
    name: &str,
    observation: &AliasObservation,
) -> Result<AliasCheckReport, JitError> {
    let entry = if name.ends_with('_') {
        registry.resolve_inplace(name)
    } else {
        registry.resolve_function(name)
    }
    .map_err(|_| JitError::UnknownOp {
        name: name.to_string(),
    })?;
    let schema = &entry.schema;
    let args = positional_args(schema);
    if args.len() != observation.arg_storage_ids.len() {
        return Err(JitError::Arity {
            expected: args.len(),
            actual: observation.arg_storage_ids.len(),
        });
    }

    let mut violations = Vec::new();
    for (index, arg) in args.iter().enumerate() {
        if !arg.writes && observation.arg_changed[index] {
            violations.push(format!(
                "argument `{}` was mutated without a write annotation",
                arg.name
            ));
        }
    }
    match schema.aliased_arg() {
        Some(aliased) => {
            let index = args.iter().position(|arg| arg.name == aliased.name);
            match index {
                Some(index) if observation.arg_storage_ids[index] == observation.out_storage_id => {}
                Some(_) => violations.push(format!(
                    "return is annotated to alias `{}` but came back on different storage",
                    aliased.name
                )),
                None => violations.push(format!(
                    "return aliases keyword-only `{}`; positional observation cannot confirm it",
                    aliased.name
                )),
            }
        }
        None => {
            for (index, arg) in args.iter().enumerate() {
                if observation.arg_storage_ids[index] == observation.out_storage_id {
                    violations.push(format!(
                        "return shares storage with `{}` without an alias annotation",
                        arg.name
                    ));
                }
            }
        }
    }

    Ok(AliasCheckReport {
        schema: schema.qualified_name.clone(),
        checked_args: args.len(),
        violations,
    })
}

/// How a graph would split for differentiation: maximal runs of
/// fusion-eligible differentiable nodes fuse, lone differentiable nodes
/// stand alone, and everything else stays opaque.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DifferentiabilityReport {
    pub fusion_groups: Vec<Vec<usize>>,
    pub standalone_nodes: Vec<usize>,
    pub opaque_nodes: Vec<usize>,
}

impl DifferentiabilityReport {
    #[must_use]
    pub fn differentiable_node_count(&self) -> usize {
        self.fusion_groups.iter().map(Vec::len).sum::<usize>() + self.standalone_nodes.len()
    }
}

fn flush_run(
    run: &mut Vec<usize>,
    fusion_groups: &mut Vec<Vec<usize>>,
    standalone_nodes: &mut Vec<usize>,
) {
    match run.len() {
        0 => {}
        1 => standalone_nodes.push(run[0]),
        _ => fusion_groups.push(std::mem::take(run)),
    }
    run.clear();
}

pub fn differentiability_report(
    graph: &Graph,
    registry: &SchemaRegistry,
    float_inputs: bool,
) -> Result<DifferentiabilityReport, JitError> {
    let mut report = DifferentiabilityReport::default();
    let mut run: Vec<usize> = Vec::new();

    for (index, node) in graph.nodes.iter().enumerate() {
        let base = node
            .op_name
            .split_once("::")
            .map_or(node.op_name.as_str(), |(_, rest)| rest)
            .trim_end_matches('_');
        let metadata = registry
            .metadata(base)
            .ok_or_else(|| JitError::UnknownOp {
                name: node.op_name.clone(),
            })?;
        let differentiable = metadata.differentiable && float_inputs;
        if differentiable && metadata.fusion_eligible {
            run.push(index);
        } else {
            flush_run(
                &mut run,
                &mut report.fusion_groups,
                &mut report.standalone_nodes,
            );
            if differentiable {
                report.standalone_nodes.push(index);
            } else {
                report.opaque_nodes.push(index);
            }
        }
    }
    flush_run(
        &mut run,
        &mut report.fusion_groups,
        &mut report.standalone_nodes,
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fo_core::{DenseTensor, Device, TensorData};
    use fo_dispatch::SchemaRegistry;
    use proptest::prelude::*;

    use super::{
        AliasProbe, GraphExecutor, JitError, OpApplier, TraceRecorder, check_alias_annotation,
        compile_graph_text, differentiability_report,
    };

    fn det_seed(parts: &[u64]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn build_packet_014_log(
        test_id: &str,
        scenario_id: &str,
        mode: &str,
        seed: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("ts_utc".to_string(), "1970-01-01T00:00:00Z".to_string());
        log.insert("suite_id".to_string(), "fo_jit_unit".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("packet_id".to_string(), "FO-OPS-014".to_string());
        log.insert("fixture_id".to_string(), "fo_jit_packet_014".to_string());
        log.insert("scenario_id".to_string(), scenario_id.to_string());
        log.insert("mode".to_string(), mode.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert("input_digest".to_string(), format!("det64:{seed:016x}"));
        log.insert("output_digest".to_string(), format!("det64:{seed:016x}"));
        log.insert(
            "env_fingerprint".to_string(),
            "det64:fo-jit-test".to_string(),
        );
        log.insert(
            "artifact_refs".to_string(),
            "artifacts/conformance/FO-OPS-014/graph_dumps.md".to_string(),
        );
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p fo-jit {test_id} -- --nocapture"),
        );
        log.insert("duration_ms".to_string(), "0".to_string());
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_packet_014_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "ts_utc",
            "suite_id",
            "test_id",
            "packet_id",
            "fixture_id",
            "scenario_id",
            "mode",
            "seed",
            "input_digest",
            "output_digest",
            "env_fingerprint",
            "artifact_refs",
            "replay_command",
            "duration_ms",
            "outcome",
            "reason_code",
        ] {
            assert!(
                log.contains_key(key),
                "missing required packet log field '{key}'"
            );
        }
    }

    struct ScalarApplier;

    impl OpApplier for ScalarApplier {
        type Value = f64;

        fn apply(&mut self, op_name: &str, inputs: &[f64]) -> Result<f64, String> {
            match op_name {
                "fo::add" => Ok(inputs[0] + inputs[1]),
                "fo::mul" => Ok(inputs[0] * inputs[1]),
                "fo::neg" => Ok(-inputs[0]),
                other => Err(format!("scalar applier has no `{other}`")),
            }
        }
    }

    fn tensor_f64(values: &[f64]) -> DenseTensor {
        DenseTensor::from_values(
            TensorData::F64(values.to_vec()),
            vec![values.len()],
            Device::Cpu,
        )
        .expect("tensor build should succeed")
    }

    const SCRIPT: &str = "graph(%x, %y):\n  %sum = fo::add(%x, %y)\n  %out = fo::mul(%sum, %x)\n  return %out\n";

    #[test]
    fn script_compiles_and_dumps_back() {
        let graph = compile_graph_text(SCRIPT).expect("compile");
        assert_eq!(graph.input_count(), 2);
        assert_eq!(graph.nodes().len(), 2);
        assert_eq!(graph.nodes()[0].op_name, "fo::add");

        let recompiled = compile_graph_text(&graph.to_string()).expect("recompile the dump");
        assert_eq!(graph.canonical_dump(), recompiled.canonical_dump());

        let seed = det_seed(&[0x0141, graph.nodes().len() as u64]);
        let log = build_packet_014_log(
            "script_compiles_and_dumps_back",
            "graph_ir/strict:script_round_trip",
            "strict",
            seed,
            "script_round_trip_ok",
        );
        assert_packet_014_log_contract(&log);
    }

    #[test]
    fn script_rejects_redefined_values() {
        let err = compile_graph_text(
            "graph(%x):\n  %y = fo::neg(%x)\n  %y = fo::neg(%y)\n  return %y\n",
        )
        .expect_err("SSA violation must fail");
        match err {
            JitError::Parse { line, message } => {
                assert_eq!(line, 3);
                assert!(message.contains("defined twice"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn script_rejects_unknown_value_reference() {
        let err = compile_graph_text("graph(%x):\n  %y = fo::add(%x, %ghost)\n  return %y\n")
            .expect_err("unknown value must fail");
        assert!(matches!(err, JitError::UnknownValue { .. }));
    }

    #[test]
    fn script_rejects_missing_return_and_bad_header() {
        let err = compile_graph_text("graph(%x):\n  %y = fo::neg(%x)\n")
            .expect_err("missing return must fail");
        assert!(matches!(err, JitError::Parse { .. }));

        let err = compile_graph_text("graf(%x):\n  return %x\n")
            .expect_err("bad header must fail");
        match err {
            JitError::Parse { line, .. } => assert_eq!(line, 1),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn trace_and_script_of_same_expression_are_isomorphic() {
        let mut recorder = TraceRecorder::new(&[101, 202]);
        recorder
            .record_op("fo::add", &[101, 202], 303)
            .expect("record add");
        recorder
            .record_op("fo::mul", &[303, 101], 404)
            .expect("record mul");
        let traced = recorder.finish(404).expect("finish trace");

        let scripted = compile_graph_text(SCRIPT).expect("compile script");
        assert_eq!(traced.canonical_dump(), scripted.canonical_dump());

        let seed = det_seed(&[0x7ace, traced.nodes().len() as u64]);
        let log = build_packet_014_log(
            "trace_and_script_of_same_expression_are_isomorphic",
            "graph_ir/strict:trace_script_isomorphism",
            "strict",
            seed,
            "trace_script_isomorphic",
        );
        assert_packet_014_log_contract(&log);
    }

    #[test]
    fn empty_trace_fails_closed() {
        let recorder = TraceRecorder::new(&[7]);
        let err = recorder.finish(7).expect_err("no ops means no graph");
        assert!(matches!(err, JitError::EmptyTrace));
    }

    #[test]
    fn trace_rejects_unknown_operand_key() {
        let mut recorder = TraceRecorder::new(&[1]);
        let err = recorder
            .record_op("fo::add", &[1, 99], 2)
            .expect_err("key 99 was never introduced");
        assert!(matches!(err, JitError::UnknownValue { .. }));
    }

    #[test]
    fn executor_replays_nodes_in_order() {
        let graph = compile_graph_text(SCRIPT).expect("compile");
        let mut applier = ScalarApplier;
        let value =
            GraphExecutor::run(&graph, &mut applier, &[2.0, 3.0]).expect("execute");
        // (2 + 3) * 2
        assert!((value - 10.0).abs() < 1e-12);
    }

    #[test]
    fn executor_checks_input_arity() {
        let graph = compile_graph_text(SCRIPT).expect("compile");
        let mut applier = ScalarApplier;
        let err = GraphExecutor::run(&graph, &mut applier, &[2.0])
            .expect_err("one input for a two-input graph");
        assert!(matches!(
            err,
            JitError::Arity {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn executor_surfaces_applier_failures() {
        let graph = compile_graph_text("graph(%x):\n  %y = fo::tanh(%x)\n  return %y\n")
            .expect("compile");
        let mut applier = ScalarApplier;
        let err = GraphExecutor::run(&graph, &mut applier, &[0.5])
            .expect_err("scalar applier has no tanh");
        match err {
            JitError::Apply(message) => assert!(message.contains("tanh")),
            other => panic!("expected apply error, got {other:?}"),
        }
    }

    #[test]
    fn differentiability_groups_fusible_runs() {
        let graph = compile_graph_text(
            "graph(%x, %y):\n  %a = fo::add(%x, %y)\n  %b = fo::exp(%a)\n  %c = fo::tanh(%b)\n  %d = fo::sigmoid(%c)\n  %e = fo::mul(%d, %x)\n  return %e\n",
        )
        .expect("compile");
        let registry = SchemaRegistry::builtin().expect("registry");

        let report = differentiability_report(&graph, &registry, true).expect("report");
        assert_eq!(report.fusion_groups, vec![vec![1, 2, 3]]);
        assert_eq!(report.standalone_nodes, vec![0, 4]);
        assert!(report.opaque_nodes.is_empty());
        assert_eq!(report.differentiable_node_count(), 5);

        let seed = det_seed(&[0xd1ff, report.fusion_groups.len() as u64]);
        let log = build_packet_014_log(
            "differentiability_groups_fusible_runs",
            "autodiff_partition/strict:fusible_run_grouping",
            "strict",
            seed,
            "fusion_grouping_ok",
        );
        assert_packet_014_log_contract(&log);
    }

    #[test]
    fn differentiability_is_opaque_for_integral_inputs() {
        let graph = compile_graph_text(
            "graph(%x):\n  %a = fo::neg(%x)\n  %b = fo::abs(%a)\n  return %b\n",
        )
        .expect("compile");
        let registry = SchemaRegistry::builtin().expect("registry");

        let report = differentiability_report(&graph, &registry, false).expect("report");
        assert!(report.fusion_groups.is_empty());
        assert!(report.standalone_nodes.is_empty());
        assert_eq!(report.opaque_nodes, vec![0, 1]);
    }

    #[test]
    fn differentiability_rejects_unknown_ops() {
        let graph = compile_graph_text(
            "graph(%x):\n  %a = fo::banish(%x)\n  return %a\n",
        )
        .expect("compile");
        let registry = SchemaRegistry::builtin().expect("registry");
        let err = differentiability_report(&graph, &registry, true)
            .expect_err("banish is not registered");
        assert!(matches!(err, JitError::UnknownOp { .. }));
    }

    #[test]
    fn alias_check_accepts_functional_op_with_fresh_output() {
        let registry = SchemaRegistry::builtin().expect("registry");
        let lhs = tensor_f64(&[1.0, 2.0]);
        let rhs = tensor_f64(&[3.0, 4.0]);

        let probe = AliasProbe::before(&[&lhs, &rhs]).expect("probe");
        let out = tensor_f64(&[4.0, 6.0]);
        let observation = probe.observe(&[&lhs, &rhs], &out).expect("observe");

        let report =
            check_alias_annotation(&registry, "add", &observation).expect("check runs");
        assert!(report.passed(), "violations: {:?}", report.violations);
        assert_eq!(report.checked_args, 2);

        let seed = det_seed(&[0xa11a, observation.out_storage_id]);
        let log = build_packet_014_log(
            "alias_check_accepts_functional_op_with_fresh_output",
            "alias_annotation/strict:functional_fresh_output",
            "strict",
            seed,
            "alias_contract_ok",
        );
        assert_packet_014_log_contract(&log);
    }

    #[test]
    fn alias_check_flags_storage_escape_from_functional_op() {
        let registry = SchemaRegistry::builtin().expect("registry");
        let lhs = tensor_f64(&[1.0, 2.0]);
        let rhs = tensor_f64(&[3.0, 4.0]);

        let probe = AliasProbe::before(&[&lhs, &rhs]).expect("probe");
        // A functional op handing back its own input storage is an alias
        // annotation violation.
        let leaked = lhs.alias_view(lhs.meta().clone()).expect("alias view");
        let observation = probe.observe(&[&lhs, &rhs], &leaked).expect("observe");

        let report =
            check_alias_annotation(&registry, "add", &observation).expect("check runs");
        assert!(!report.passed());
        assert!(report.violations[0].contains("without an alias annotation"));
    }

    #[test]
    fn alias_check_accepts_inplace_write_through_self() {
        let registry = SchemaRegistry::builtin().expect("registry");
        let dest = tensor_f64(&[1.0, 2.0]);
        let rhs = tensor_f64(&[3.0, 4.0]);

        let probe = AliasProbe::before(&[&dest, &rhs]).expect("probe");
        dest.write_logical(0, 4.0).expect("mutate dest");
        dest.write_logical(1, 6.0).expect("mutate dest");
        let observation = probe.observe(&[&dest, &rhs], &dest).expect("observe");

        let report =
            check_alias_annotation(&registry, "add_", &observation).expect("check runs");
        assert!(report.passed(), "violations: {:?}", report.violations);
    }

    #[test]
    fn alias_check_flags_mutated_unannotated_argument() {
        let registry = SchemaRegistry::builtin().expect("registry");
        let dest = tensor_f64(&[1.0, 2.0]);
        let rhs = tensor_f64(&[3.0, 4.0]);

        let probe = AliasProbe::before(&[&dest, &rhs]).expect("probe");
        // The in-place contract covers `self` only; touching `other` is a
        // violation.
        rhs.write_logical(0, -1.0).expect("mutate rhs");
        dest.write_logical(0, 4.0).expect("mutate dest");
        let observation = probe.observe(&[&dest, &rhs], &dest).expect("observe");

        let report =
            check_alias_annotation(&registry, "add_", &observation).expect("check runs");
        assert!(!report.passed());
        assert!(report.violations[0].contains("`other`"));
    }

    #[test]
    fn alias_check_rejects_unknown_names() {
        let registry = SchemaRegistry::builtin().expect("registry");
        let lhs = tensor_f64(&[1.0]);
        let probe = AliasProbe::before(&[&lhs]).expect("probe");
        let out = tensor_f64(&[1.0]);
        let observation = probe.observe(&[&lhs], &out).expect("observe");
        let err = check_alias_annotation(&registry, "banish", &observation)
            .expect_err("unknown op must fail");
        assert!(matches!(err, JitError::UnknownOp { .. }));
    }

    proptest! {
        #[test]
        fn prop_canonical_dump_round_trips(
            op_count in 1usize..8usize,
            use_mul in proptest::collection::vec(any::<bool>(), 8),
        ) {
            let mut text = String::from("graph(%x, %y):\n");
            let mut last = "x".to_string();
            for index in 0..op_count {
                let op = if use_mul[index] { "fo::mul" } else { "fo::add" };
                let next = format!("v{index}");
                text.push_str(&format!("  %{next} = {op}(%{last}, %y)\n"));
                last = next;
            }
            text.push_str(&format!("  return %{last}\n"));

            let graph = compile_graph_text(&text).expect("compile generated script");
            let reparsed = compile_graph_text(&graph.to_string()).expect("reparse dump");
            prop_assert_eq!(graph.canonical_dump(), reparsed.canonical_dump());
            prop_assert_eq!(graph.nodes().len(), op_count);
        }

        #[test]
        fn prop_executor_matches_direct_evaluation(
            x in -100i32..100i32,
            y in -100i32..100i32,
        ) {
            let graph = compile_graph_text(SCRIPT).expect("compile");
            let mut applier = ScalarApplier;
            let x = f64::from(x);
            let y = f64::from(y);
            let value = GraphExecutor::run(&graph, &mut applier, &[x, y]).expect("execute");
            prop_assert_eq!(value, (x + y) * x);
        }

        #[test]
        fn prop_fingerprint_is_value_sensitive(
            values in proptest::collection::vec(-1000i32..1000i32, 1..16),
            flip in 0usize..16usize,
        ) {
            let base: Vec<f64> = values.iter().map(|v| f64::from(*v)).collect();
            let tensor = tensor_f64(&base);
            let first = super::value_fingerprint(&tensor).expect("fingerprint");

            let index = flip % base.len();
            tensor
                .write_logical(index, base[index] + 1.0)
                .expect("mutate");
            let second = super::value_fingerprint(&tensor).expect("fingerprint");
            prop_assert_ne!(first, second);
        }
    }
}
