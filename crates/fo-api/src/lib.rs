#![forbid(unsafe_code)]

use std::fmt;

use fo_autograd::{OperationEvent, gradcheck, gradgradcheck};
use fo_core::{TensorData, TensorError};
use fo_dispatch::SchemaError;
use fo_jit::{GraphExecutor, OpApplier, TraceRecorder, compile_graph_text, differentiability_report};

pub use fo_autograd::{
    AutogradError, BackwardOptions, BackwardReport, GradcheckError, GradcheckOptions,
    GradcheckReport, NodeId, ReentrantPolicy, Tape,
};
pub use fo_core::{DType, DenseTensor, Device, ExecutionMode, TensorMeta};
pub use fo_dispatch::{DispatchError, SchemaRegistry};
pub use fo_jit::{DifferentiabilityReport, Graph, JitError};
pub use fo_runtime::{EvidenceEntry, EvidenceKind, EvidenceLedger, RuntimeContext};

#[derive(Debug)]
pub enum ApiError {
    Registry(SchemaError),
    Op {
        context: String,
        source: AutogradError,
    },
    Check {
        context: String,
        source: GradcheckError,
    },
    Graph {
        context: String,
        source: JitError,
    },
    Tensor(TensorError),
}

impl ApiError {
    fn op(context: impl Into<String>, source: AutogradError) -> Self {
        Self::Op {
            context: context.into(),
            source,
        }
    }

    fn check(context: impl Into<String>, source: GradcheckError) -> Self {
        Self::Check {
            context: context.into(),
            source,
        }
    }

    fn graph(context: impl Into<String>, source: JitError) -> Self {
        Self::Graph {
            context: context.into(),
            source,
        }
    }

    fn dispatch(&self) -> Option<&DispatchError> {
        match self {
            Self::Op {
                source: AutogradError::Dispatch(inner),
                ..
            }
            | Self::Check {
                source: GradcheckError::Autograd(AutogradError::Dispatch(inner)),
                ..
            } => Some(inner),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_unsupported_dtype(&self) -> bool {
        self.dispatch().is_some_and(DispatchError::is_unsupported_dtype)
    }

    #[must_use]
    pub fn is_promotion_failure(&self) -> bool {
        self.dispatch().is_some_and(DispatchError::is_promotion_failure)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(source) => write!(f, "registry construction failed: {source}"),
            Self::Op { context, source } => write!(f, "{context}: {source}"),
            Self::Check { context, source } => write!(f, "gradient check `{context}`: {source}"),
            Self::Graph { context, source } => write!(f, "graph `{context}`: {source}"),
            Self::Tensor(source) => write!(f, "tensor construction failed: {source}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<SchemaError> for ApiError {
    fn from(inner: SchemaError) -> Self {
        Self::Registry(inner)
    }
}

impl From<TensorError> for ApiError {
    fn from(inner: TensorError) -> Self {
        Self::Tensor(inner)
    }
}

/// One tape, one schema registry, one evidence ledger. Everything the
/// conformance harness drives goes through here, and every successful
/// operation leaves a ledger entry behind.
#[derive(Debug)]
pub struct FrankenOpsSession {
    tape: Tape,
    registry: SchemaRegistry,
    runtime: RuntimeContext,
    seed: u64,
}

impl FrankenOpsSession {
    pub fn new(mode: ExecutionMode) -> Result<Self, ApiError> {
        Self::with_seed(mode, 0)
    }

    pub fn with_seed(mode: ExecutionMode, seed: u64) -> Result<Self, ApiError> {
        let registry = SchemaRegistry::builtin()?;
        Ok(Self {
            tape: Tape::new(),
            registry,
            runtime: RuntimeContext::new(mode),
            seed,
        })
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn tape_mut(&mut self) -> &mut Tape {
        &mut self.tape
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    #[must_use]
    pub fn evidence(&self) -> &EvidenceLedger {
        self.runtime.ledger()
    }

    pub fn tensor_variable(&mut self, tensor: DenseTensor) -> Result<NodeId, ApiError> {
        self.tape
            .variable(tensor)
            .map_err(|e| ApiError::op("variable", e))
    }

    pub fn tensor_constant(&mut self, tensor: DenseTensor) -> NodeId {
        self.tape.constant(tensor)
    }

    pub fn tensor_from_meta(
        &mut self,
        meta: TensorMeta,
        values: &[f64],
        requires_grad: bool,
    ) -> Result<NodeId, ApiError> {
        let data = TensorData::from_f64_values(meta.dtype(), values);
        let tensor = DenseTensor::from_meta_and_storage(meta, data)?;
        if requires_grad {
            self.tensor_variable(tensor)
        } else {
            Ok(self.tensor_constant(tensor))
        }
    }

    pub fn value(&self, node: NodeId) -> Result<&DenseTensor, ApiError> {
        self.tape.value(node).map_err(|e| ApiError::op("value", e))
    }

    pub fn values_f64(&self, node: NodeId) -> Result<Vec<f64>, ApiError> {
        self.tape
            .values_f64(node)
            .map_err(|e| ApiError::op("values_f64", e))
    }

    pub fn meta_of(&self, node: NodeId) -> Result<&TensorMeta, ApiError> {
        self.tape
            .node_meta(node)
            .map_err(|e| ApiError::op("meta_of", e))
    }

    /// Functional variant, `name` without namespace (`add`, not `fo::add`).
    pub fn call_function(&mut self, name: &str, inputs: &[NodeId]) -> Result<NodeId, ApiError> {
        let entry = self
            .registry
            .resolve_function(name)
            .map_err(|e| ApiError::op(name, AutogradError::Dispatch(e)))?;
        let kind = entry.kind;
        let promotes = entry.metadata.promotes_integer_to_float;
        let mode = self.mode();
        let (out, event) = self
            .tape
            .apply(kind, inputs, promotes, mode)
            .map_err(|e| ApiError::op(name, e))?;
        self.record_operation(EvidenceKind::OpDispatched, "function", &event);
        Ok(out)
    }

    /// Method variant: `receiver.name(rest...)`. Resolution goes through the
    /// method table, which is narrower than the function table.
    pub fn call_method(
        &mut self,
        receiver: NodeId,
        name: &str,
        rest: &[NodeId],
    ) -> Result<NodeId, ApiError> {
        let entry = self
            .registry
            .resolve_method(name)
            .map_err(|e| ApiError::op(name, AutogradError::Dispatch(e)))?;
        let kind = entry.kind;
        let promotes = entry.metadata.promotes_integer_to_float;
        let mode = self.mode();
        let inputs: Vec<NodeId> = std::iter::once(receiver)
            .chain(rest.iter().copied())
            .collect();
        let (out, event) = self
            .tape
            .apply(kind, &inputs, promotes, mode)
            .map_err(|e| ApiError::op(name, e))?;
        self.record_operation(EvidenceKind::OpDispatched, "method", &event);
        Ok(out)
    }

    /// In-place variant; `name` carries the trailing underscore (`add_`).
    /// The receiver is rewritten and returned as a new tape node.
    pub fn call_inplace(
        &mut self,
        receiver: NodeId,
        name: &str,
        rest: &[NodeId],
    ) -> Result<NodeId, ApiError> {
        let entry = self
            .registry
            .resolve_inplace(name)
            .map_err(|e| ApiError::op(name, AutogradError::Dispatch(e)))?;
        let kind = entry.kind;
        let promotes = entry.metadata.promotes_integer_to_float;
        let mode = self.mode();
        let inputs: Vec<NodeId> = std::iter::once(receiver)
            .chain(rest.iter().copied())
            .collect();
        let (out, event) = self
            .tape
            .apply_inplace(kind, &inputs, promotes, mode)
            .map_err(|e| ApiError::op(name, e))?;
        self.record_operation(EvidenceKind::InplaceApplied, "inplace", &event);
        Ok(out)
    }

    /// out= variant: writes into `out` and returns it. Sits outside
    /// autograd; requires-grad participants fail closed.
    pub fn call_out(
        &mut self,
        name: &str,
        inputs: &[NodeId],
        out: NodeId,
    ) -> Result<NodeId, ApiError> {
        let entry = self
            .registry
            .resolve_out(name)
            .map_err(|e| ApiError::op(name, AutogradError::Dispatch(e)))?;
        let kind = entry.kind;
        let promotes = entry.metadata.promotes_integer_to_float;
        let mode = self.mode();
        let event = self
            .tape
            .apply_out(kind, inputs, out, promotes, mode)
            .map_err(|e| ApiError::op(name, e))?;
        self.record_operation(EvidenceKind::OutWritten, "out", &event);
        Ok(out)
    }

    pub fn backward(&mut self, root: NodeId) -> Result<BackwardReport, ApiError> {
        let options = BackwardOptions::for_mode(self.mode());
        self.backward_with_options(root, options)
    }

    pub fn backward_with_options(
        &mut self,
        root: NodeId,
        options: BackwardOptions,
    ) -> Result<BackwardReport, ApiError> {
        let mode = self.mode();
        let report = self
            .tape
            .backward_with_options(root, mode, options)
            .map_err(|e| ApiError::op("backward", e))?;
        self.record_backward("backward", root, &report);
        Ok(report)
    }

    /// Gradient node for one of the backward targets, `None` when the pass
    /// never reached it.
    #[must_use]
    pub fn grad_of(&self, report: &BackwardReport, node: NodeId) -> Option<NodeId> {
        report.gradient(node)
    }

    pub fn vjp(
        &mut self,
        outputs: &[NodeId],
        grad_outputs: &[NodeId],
        wrt: &[NodeId],
        create_graph: bool,
    ) -> Result<BackwardReport, ApiError> {
        let mode = self.mode();
        let options = BackwardOptions::for_mode(mode);
        let report = self
            .tape
            .vjp(outputs, grad_outputs, wrt, create_graph, mode, options)
            .map_err(|e| ApiError::op("vjp", e))?;
        self.record_backward("vjp", outputs.first().copied().unwrap_or(NodeId(0)), &report);
        Ok(report)
    }

    pub fn run_gradcheck<F>(
        &mut self,
        context: &str,
        f: F,
        inputs: &[NodeId],
        options: &GradcheckOptions,
    ) -> Result<GradcheckReport, ApiError>
    where
        F: FnMut(&mut Tape, &[NodeId]) -> Result<Vec<NodeId>, AutogradError>,
    {
        let report =
            gradcheck(&mut self.tape, f, inputs, options).map_err(|e| ApiError::check(context, e))?;
        self.record_gradcheck(context, "gradcheck", &report);
        Ok(report)
    }

    pub fn run_gradgradcheck<F>(
        &mut self,
        context: &str,
        f: F,
        inputs: &[NodeId],
        grad_outputs: &[NodeId],
        options: &GradcheckOptions,
    ) -> Result<GradcheckReport, ApiError>
    where
        F: FnMut(&mut Tape, &[NodeId]) -> Result<Vec<NodeId>, AutogradError>,
    {
        let report = gradgradcheck(&mut self.tape, f, inputs, grad_outputs, options)
            .map_err(|e| ApiError::check(context, e))?;
        self.record_gradcheck(context, "gradgradcheck", &report);
        Ok(report)
    }

    /// Runs the op eagerly while recording a one-node graph, so the traced
    /// path can be replayed and compared against the eager result.
    pub fn trace_call(
        &mut self,
        name: &str,
        inputs: &[NodeId],
    ) -> Result<(Graph, NodeId), ApiError> {
        let entry = self
            .registry
            .resolve_function(name)
            .map_err(|e| ApiError::op(name, AutogradError::Dispatch(e)))?;
        let kind = entry.kind;
        let promotes = entry.metadata.promotes_integer_to_float;
        let qualified = entry.schema.qualified_name.clone();
        let mode = self.mode();

        let keys: Vec<u64> = inputs.iter().map(|node| node.0 as u64).collect();
        let mut recorder = TraceRecorder::new(&keys);
        let (out, event) = self
            .tape
            .apply(kind, inputs, promotes, mode)
            .map_err(|e| ApiError::op(name, e))?;
        self.record_operation(EvidenceKind::OpDispatched, "trace", &event);
        recorder
            .record_op(&qualified, &keys, out.0 as u64)
            .map_err(|e| ApiError::graph(name, e))?;
        let graph = recorder
            .finish(out.0 as u64)
            .map_err(|e| ApiError::graph(name, e))?;
        self.runtime.ledger_mut().record(
            EvidenceKind::GraphTraced,
            format!("op={qualified} nodes={} out={}", graph.nodes().len(), out.0),
        );
        Ok((graph, out))
    }

    pub fn compile_script(&mut self, source: &str) -> Result<Graph, ApiError> {
        let graph = compile_graph_text(source).map_err(|e| ApiError::graph("script", e))?;
        self.runtime.ledger_mut().record(
            EvidenceKind::GraphCompiled,
            format!(
                "inputs={} nodes={}",
                graph.input_count(),
                graph.nodes().len()
            ),
        );
        Ok(graph)
    }

    pub fn run_graph(&mut self, graph: &Graph, inputs: &[NodeId]) -> Result<NodeId, ApiError> {
        let out = GraphExecutor::run(graph, self, inputs)
            .map_err(|e| ApiError::graph("execution", e))?;
        self.runtime.ledger_mut().record(
            EvidenceKind::GraphExecuted,
            format!("nodes={} out={}", graph.nodes().len(), out.0),
        );
        Ok(out)
    }

    pub fn differentiability_of(
        &self,
        graph: &Graph,
        float_inputs: bool,
    ) -> Result<DifferentiabilityReport, ApiError> {
        differentiability_report(graph, &self.registry, float_inputs)
            .map_err(|e| ApiError::graph("differentiability", e))
    }

    /// Script text for the single-op graph of a functional variant, shaped
    /// exactly like the dump `trace_call` produces.
    pub fn script_source_for(&self, name: &str) -> Result<String, ApiError> {
        let entry = self
            .registry
            .resolve_function(name)
            .map_err(|e| ApiError::op(name, AutogradError::Dispatch(e)))?;
        let qualified = &entry.schema.qualified_name;
        let source = if entry.kind.arity() == 2 {
            format!("graph(%x, %y):\n  %out = {qualified}(%x, %y)\n  return %out\n")
        } else {
            format!("graph(%x):\n  %out = {qualified}(%x)\n  return %out\n")
        };
        Ok(source)
    }

    fn record_operation(&mut self, kind: EvidenceKind, variant: &str, event: &OperationEvent) {
        let inputs: Vec<String> = event.inputs.iter().map(|node| node.0.to_string()).collect();
        self.runtime.ledger_mut().record(
            kind,
            format!(
                "op={} variant={variant} inputs=[{}] out={} mode={:?} dtype={:?}->{:?} device={:?}->{:?} promoted={} fallback={}",
                event.decision.op,
                inputs.join(","),
                event.out.0,
                event.decision.mode,
                event.decision.requested_dtype,
                event.decision.kernel_dtype,
                event.decision.requested_device,
                event.decision.executed_device,
                event.decision.promotion_applied,
                event.decision.device_fallback_used,
            ),
        );
    }

    fn record_backward(&mut self, label: &str, root: NodeId, report: &BackwardReport) {
        self.runtime.ledger_mut().record(
            EvidenceKind::BackwardCompleted,
            format!(
                "{label} root={} steps={} queue_pushes={} queue_pops={} max_queue_len={} reentrant_depth={} guard={} fallback={}",
                root.0,
                report.steps.len(),
                report.telemetry.queue_pushes,
                report.telemetry.queue_pops,
                report.telemetry.max_queue_len,
                report.telemetry.reentrant_depth,
                report.telemetry.reentrant_guard_triggered,
                report.telemetry.hardened_fallback_used,
            ),
        );
    }

    fn record_gradcheck(&mut self, context: &str, label: &str, report: &GradcheckReport) {
        self.runtime.ledger_mut().record(
            EvidenceKind::GradChecked,
            format!(
                "{label} {context}: inputs={} outputs={} comparisons={} max_abs_diff={:.3e} non_contig={} dtypes_checked={}",
                report.inputs_checked,
                report.outputs_checked,
                report.comparisons,
                report.max_abs_difference,
                report.non_contig_grad_outputs_used,
                report.grad_dtypes_checked,
            ),
        );
    }
}

/// Graph execution resolves every node through the function table and
/// dispatches on the session tape, so replays share autograd semantics
/// with eager calls.
impl OpApplier for FrankenOpsSession {
    type Value = NodeId;

    fn apply(&mut self, op_name: &str, inputs: &[NodeId]) -> Result<NodeId, String> {
        let base = op_name.rsplit("::").next().unwrap_or(op_name);
        let entry = self
            .registry
            .resolve_function(base)
            .map_err(|e| e.to_string())?;
        let kind = entry.kind;
        let promotes = entry.metadata.promotes_integer_to_float;
        let mode = self.mode();
        let (out, event) = self
            .tape
            .apply(kind, inputs, promotes, mode)
            .map_err(|e| e.to_string())?;
        self.record_operation(EvidenceKind::OpDispatched, "graph", &event);
        Ok(out)
    }
}
