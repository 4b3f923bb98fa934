#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use fo_core::{DType, DenseTensor, ExecutionMode, TensorData, TensorError};
use fo_dispatch::{DispatchDecision, DispatchError, OpKind, dispatch, dispatch_into};
use fo_kernel_cpu::{BinaryKernelOp, UnaryKernelOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafKind {
    Variable,
    Constant,
}

/// Operations the tape can record. `CloneValue` and `Expand` never go through
/// the dispatcher: the first copies storage, the second is the adjoint of
/// `Sum` and materializes a scalar across a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapeOp {
    Dispatch(OpKind),
    CloneValue,
    Expand,
}

/// A value the backward formula of a recorded operation will read, together
/// with the storage version observed at record time. A version mismatch at
/// backward time means an in-place write clobbered the operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SavedValue {
    node: NodeId,
    expected_version: u64,
}

#[derive(Debug, Clone)]
enum NodeOrigin {
    Leaf(LeafKind),
    Computed {
        op: TapeOp,
        inputs: Vec<NodeId>,
        saved: Vec<SavedValue>,
        grad_depth: usize,
    },
}

#[derive(Debug, Clone)]
struct Node {
    value: DenseTensor,
    requires_grad: bool,
    origin: NodeOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReentrantPolicy {
    StrictFail,
    HardenedBoundedFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackwardOptions {
    pub max_reentrant_depth: usize,
    pub current_reentrant_depth: usize,
    pub policy: ReentrantPolicy,
}

impl BackwardOptions {
    /// Strict budget: one forward differentiation plus one nested pass, which
    /// is exactly what a second-derivative check needs.
    #[must_use]
    pub const fn strict_default() -> Self {
        Self {
            max_reentrant_depth: 1,
            current_reentrant_depth: 0,
            policy: ReentrantPolicy::StrictFail,
        }
    }

    #[must_use]
    pub const fn hardened_default() -> Self {
        Self {
            max_reentrant_depth: 2,
            current_reentrant_depth: 0,
            policy: ReentrantPolicy::HardenedBoundedFallback,
        }
    }

    #[must_use]
    pub const fn for_mode(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Strict => Self::strict_default(),
            ExecutionMode::Hardened => Self::hardened_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerTelemetry {
    pub execution_order: Vec<NodeId>,
    pub queue_pushes: usize,
    pub queue_pops: usize,
    pub max_queue_len: usize,
    pub dependency_snapshot: Vec<usize>,
    pub reentrant_depth: usize,
    pub reentrant_guard_triggered: bool,
    pub hardened_fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyTask {
    node: NodeId,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node.0.cmp(&other.node.0)
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ReadyQueue {
    heap: BinaryHeap<ReadyTask>,
    pushes: usize,
    pops: usize,
    max_len: usize,
}

impl ReadyQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            pushes: 0,
            pops: 0,
            max_len: 0,
        }
    }

    fn push(&mut self, node: NodeId) {
        self.heap.push(ReadyTask { node });
        self.pushes += 1;
        self.max_len = self.max_len.max(self.heap.len());
    }

    fn pop(&mut self) -> Option<NodeId> {
        let next = self.heap.pop().map(|task| task.node);
        if next.is_some() {
            self.pops += 1;
        }
        next
    }
}

#[derive(Debug, Clone)]
pub struct OperationEvent {
    pub op: OpKind,
    pub inputs: Vec<NodeId>,
    pub out: NodeId,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackwardStep {
    pub node: NodeId,
    pub incoming_grad: NodeId,
    pub rule: &'static str,
}

#[derive(Debug, Clone)]
pub struct BackwardReport {
    wrt: Vec<NodeId>,
    gradients: Vec<Option<NodeId>>,
    pub steps: Vec<BackwardStep>,
    pub telemetry: SchedulerTelemetry,
}

impl BackwardReport {
    /// Gradient node for one of the requested targets, `None` when the target
    /// was not reached by the pass.
    #[must_use]
    pub fn gradient(&self, node: NodeId) -> Option<NodeId> {
        self.wrt
            .iter()
            .position(|candidate| *candidate == node)
            .and_then(|index| self.gradients[index])
    }

    #[must_use]
    pub fn gradient_at(&self, index: usize) -> Option<NodeId> {
        self.gradients.get(index).copied().flatten()
    }

    #[must_use]
    pub fn gradients(&self) -> &[Option<NodeId>] {
        &self.gradients
    }

    #[must_use]
    pub fn targets(&self) -> &[NodeId] {
        &self.wrt
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutogradError {
    UnknownNode(NodeId),
    Dispatch(DispatchError),
    Tensor(TensorError),
    ReentrantDepthExceeded { current: usize, max: usize },
    DependencyUnderflow { node: NodeId },
    RequiresGradNeedsFloat { dtype: DType },
    RootRequiresNoGrad { node: NodeId },
    WrtRequiresNoGrad { node: NodeId },
    GradCountMismatch { outputs: usize, grads: usize },
    GradShapeMismatch { node: NodeId, expected: Vec<usize>, actual: Vec<usize> },
    GradDTypeMismatch { node: NodeId, expected: DType, actual: DType },
    SavedValueStale { node: NodeId, expected_version: u64, actual_version: u64 },
    NotALeaf { node: NodeId },
    InplaceOnLeafVariable { node: NodeId },
    OutRequiresGrad { node: NodeId },
    DisconnectedGradient { node: NodeId },
}

impl fmt::Display for AutogradError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "unknown node id {}", node.0),
            Self::Dispatch(error) => write!(f, "dispatch failure: {error}"),
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
            Self::ReentrantDepthExceeded { current, max } => write!(
                f,
                "reentrant backward depth exceeded: current={current} max={max}"
            ),
            Self::DependencyUnderflow { node } => {
                write!(f, "dependency scheduler underflow at node {}", node.0)
            }
            Self::RequiresGradNeedsFloat { dtype } => write!(
                f,
                "only floating point tensors can require gradients, got {dtype:?}"
            ),
            Self::RootRequiresNoGrad { node } => write!(
                f,
                "backward root {} does not require grad and has no recorded history",
                node.0
            ),
            Self::WrtRequiresNoGrad { node } => write!(
                f,
                "one of the differentiated targets ({}) does not require grad",
                node.0
            ),
            Self::GradCountMismatch { outputs, grads } => write!(
                f,
                "got {grads} incoming gradients for {outputs} outputs"
            ),
            Self::GradShapeMismatch { node, expected, actual } => write!(
                f,
                "incoming gradient for node {} has shape {actual:?}, expected {expected:?}",
                node.0
            ),
            Self::GradDTypeMismatch { node, expected, actual } => write!(
                f,
                "incoming gradient for node {} has dtype {actual:?}, expected {expected:?}",
                node.0
            ),
            Self::SavedValueStale { node, expected_version, actual_version } => write!(
                f,
                "saved value for node {} was modified by an in-place operation: \
                 version {actual_version}, expected {expected_version}",
                node.0
            ),
            Self::NotALeaf { node } => write!(
                f,
                "node {} is not a leaf; only leaf values can be read or written directly",
                node.0
            ),
            Self::InplaceOnLeafVariable { node } => write!(
                f,
                "leaf variable {} requires grad and is used in an in-place operation",
                node.0
            ),
            Self::OutRequiresGrad { node } => write!(
                f,
                "out= destinations do not support automatic differentiation, \
                 but node {} requires grad",
                node.0
            ),
            Self::DisconnectedGradient { node } => write!(
                f,
                "gradient for node {} is disconnected from the differentiated graph",
                node.0
            ),
        }
    }
}

impl std::error::Error for AutogradError {}

impl From<DispatchError> for AutogradError {
    fn from(inner: DispatchError) -> Self {
        Self::Dispatch(inner)
    }
}

impl From<TensorError> for AutogradError {
    fn from(inner: TensorError) -> Self {
        Self::Tensor(inner)
    }
}

impl AutogradError {
    #[must_use]
    pub fn is_saved_value_stale(&self) -> bool {
        matches!(self, Self::SavedValueStale { .. })
    }

    #[must_use]
    pub fn is_reentrant_depth_exceeded(&self) -> bool {
        matches!(self, Self::ReentrantDepthExceeded { .. })
    }
}

/// Which operand values an operation's backward formula reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SavedPlan {
    Nothing,
    Input,
    BothInputs,
    RhsAndOutput,
    Output,
}

fn saved_plan(kind: OpKind) -> SavedPlan {
    match kind {
        OpKind::Binary(BinaryKernelOp::Add | BinaryKernelOp::Sub) => SavedPlan::Nothing,
        OpKind::Binary(BinaryKernelOp::Mul) => SavedPlan::BothInputs,
        OpKind::Binary(BinaryKernelOp::Div) => SavedPlan::RhsAndOutput,
        OpKind::Unary(
            UnaryKernelOp::Abs
            | UnaryKernelOp::Relu
            | UnaryKernelOp::Log
            | UnaryKernelOp::Sin
            | UnaryKernelOp::Cos,
        ) => SavedPlan::Input,
        OpKind::Unary(
            UnaryKernelOp::Sqrt
            | UnaryKernelOp::Exp
            | UnaryKernelOp::Tanh
            | UnaryKernelOp::Sigmoid
            | UnaryKernelOp::Reciprocal,
        ) => SavedPlan::Output,
        OpKind::Unary(
            UnaryKernelOp::Neg | UnaryKernelOp::SignMask | UnaryKernelOp::StepMask,
        )
        | OpKind::Sum
        | OpKind::Cast(_) => SavedPlan::Nothing,
    }
}

#[derive(Debug, Default)]
pub struct Tape {
    nodes: Vec<Node>,
    recording_grad_depth: usize,
    recording_detached: bool,
}

impl Tape {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registers a differentiable leaf. Gradient targets must be floating
    /// point, matching the runtime contract users hit first.
    pub fn variable(&mut self, value: DenseTensor) -> Result<NodeId, AutogradError> {
        if !value.dtype().is_floating_point() {
            return Err(AutogradError::RequiresGradNeedsFloat {
                dtype: value.dtype(),
            });
        }
        Ok(self.push_node(value, true, NodeOrigin::Leaf(LeafKind::Variable)))
    }

    pub fn constant(&mut self, value: DenseTensor) -> NodeId {
        self.push_node(value, false, NodeOrigin::Leaf(LeafKind::Constant))
    }

    pub fn value(&self, node: NodeId) -> Result<&DenseTensor, AutogradError> {
        Ok(&self.node(node)?.value)
    }

    pub fn values_f64(&self, node: NodeId) -> Result<Vec<f64>, AutogradError> {
        Ok(self.node(node)?.value.values_f64()?)
    }

    pub fn requires_grad(&self, node: NodeId) -> Result<bool, AutogradError> {
        Ok(self.node(node)?.requires_grad)
    }

    pub fn is_leaf(&self, node: NodeId) -> Result<bool, AutogradError> {
        Ok(matches!(self.node(node)?.origin, NodeOrigin::Leaf(_)))
    }

    pub fn node_meta(&self, node: NodeId) -> Result<&fo_core::TensorMeta, AutogradError> {
        Ok(self.node(node)?.value.meta())
    }

    pub fn read_leaf_value(&self, node: NodeId, flat: usize) -> Result<f64, AutogradError> {
        let target = self.node(node)?;
        if !matches!(target.origin, NodeOrigin::Leaf(_)) {
            return Err(AutogradError::NotALeaf { node });
        }
        Ok(target.value.read_logical(flat)?)
    }

    /// Writes one logical element of a leaf tensor. Gradient checking uses
    /// this to perturb inputs; computed nodes stay immutable from outside.
    pub fn write_leaf_value(
        &self,
        node: NodeId,
        flat: usize,
        value: f64,
    ) -> Result<(), AutogradError> {
        let target = self.node(node)?;
        if !matches!(target.origin, NodeOrigin::Leaf(_)) {
            return Err(AutogradError::NotALeaf { node });
        }
        target.value.write_logical(flat, value)?;
        Ok(())
    }

    pub fn apply(
        &mut self,
        kind: OpKind,
        inputs: &[NodeId],
        promotes_integer_to_float: bool,
        mode: ExecutionMode,
    ) -> Result<(NodeId, OperationEvent), AutogradError> {
        self.record_dispatch(kind, inputs, promotes_integer_to_float, mode)
    }

    /// Applies `kind` in place on `inputs[0]` and rebases that tensor's
    /// history onto a fresh node. Records that still reference the old value
    /// fail with `SavedValueStale` if they are ever walked afterwards.
    pub fn apply_inplace(
        &mut self,
        kind: OpKind,
        inputs: &[NodeId],
        promotes_integer_to_float: bool,
        mode: ExecutionMode,
    ) -> Result<(NodeId, OperationEvent), AutogradError> {
        let dest = *inputs.first().ok_or_else(|| {
            AutogradError::Dispatch(DispatchError::ArityMismatch {
                op: kind.token().to_string(),
                expected: kind.arity(),
                actual: 0,
            })
        })?;
        let dest_node = self.node(dest)?;
        if matches!(dest_node.origin, NodeOrigin::Leaf(LeafKind::Variable)) {
            return Err(AutogradError::InplaceOnLeafVariable { node: dest });
        }
        let requires_grad = self.any_requires_grad(inputs)?;

        // Operand values the backward formula needs are captured before the
        // destination storage is overwritten.
        let pre_copy = if requires_grad {
            match saved_plan(kind) {
                SavedPlan::Input | SavedPlan::BothInputs => {
                    let copy = self.node(dest)?.value.deep_clone();
                    Some(self.constant(copy))
                }
                SavedPlan::Nothing | SavedPlan::RhsAndOutput | SavedPlan::Output => None,
            }
        } else {
            None
        };

        let tensors: Vec<DenseTensor> = inputs
            .iter()
            .map(|id| self.node(*id).map(|n| n.value.clone()))
            .collect::<Result<_, _>>()?;
        let tensor_refs: Vec<&DenseTensor> = tensors.iter().collect();
        let decision = dispatch_into(
            kind,
            &tensor_refs,
            &tensors[0],
            promotes_integer_to_float,
            mode,
        )?;

        let out_value = tensors[0].clone();
        let out_version = out_value.version();
        let out = NodeId(self.nodes.len());
        let saved = if requires_grad {
            match saved_plan(kind) {
                SavedPlan::Nothing => Vec::new(),
                SavedPlan::Input => vec![SavedValue {
                    node: pre_copy.unwrap_or(dest),
                    expected_version: 0,
                }],
                SavedPlan::BothInputs => vec![
                    SavedValue {
                        node: pre_copy.unwrap_or(dest),
                        expected_version: 0,
                    },
                    SavedValue {
                        node: inputs[1],
                        expected_version: self.node(inputs[1])?.value.version(),
                    },
                ],
                SavedPlan::RhsAndOutput => vec![
                    SavedValue {
                        node: inputs[1],
                        expected_version: self.node(inputs[1])?.value.version(),
                    },
                    SavedValue {
                        node: out,
                        expected_version: out_version,
                    },
                ],
                SavedPlan::Output => vec![SavedValue {
                    node: out,
                    expected_version: out_version,
                }],
            }
        } else {
            Vec::new()
        };

        self.nodes.push(Node {
            value: out_value,
            requires_grad: requires_grad && !self.recording_detached,
            origin: NodeOrigin::Computed {
                op: TapeOp::Dispatch(kind),
                inputs: inputs.to_vec(),
                saved,
                grad_depth: self.recording_grad_depth,
            },
        });

        Ok((
            out,
            OperationEvent {
                op: kind,
                inputs: inputs.to_vec(),
                out,
                decision,
            },
        ))
    }

    /// Routes an operation into an existing destination tensor. The out=
    /// path sits outside autograd entirely, so every participant must be
    /// grad-free and nothing is recorded.
    pub fn apply_out(
        &mut self,
        kind: OpKind,
        inputs: &[NodeId],
        dest: NodeId,
        promotes_integer_to_float: bool,
        mode: ExecutionMode,
    ) -> Result<OperationEvent, AutogradError> {
        for participant in inputs.iter().chain(std::iter::once(&dest)) {
            if self.node(*participant)?.requires_grad {
                return Err(AutogradError::OutRequiresGrad { node: *participant });
            }
        }
        let tensors: Vec<DenseTensor> = inputs
            .iter()
            .map(|id| self.node(*id).map(|n| n.value.clone()))
            .collect::<Result<_, _>>()?;
        let tensor_refs: Vec<&DenseTensor> = tensors.iter().collect();
        let dest_tensor = self.node(dest)?.value.clone();
        let decision = dispatch_into(
            kind,
            &tensor_refs,
            &dest_tensor,
            promotes_integer_to_float,
            mode,
        )?;
        Ok(OperationEvent {
            op: kind,
            inputs: inputs.to_vec(),
            out: dest,
            decision,
        })
    }

    /// Copies a value onto a fresh storage while keeping the gradient edge.
    /// The safe in-place pattern is built on this: clone, then mutate the
    /// clone.
    pub fn clone_value(&mut self, src: NodeId) -> Result<NodeId, AutogradError> {
        let (value, requires_grad) = {
            let node = self.node(src)?;
            (node.value.deep_clone(), node.requires_grad)
        };
        Ok(self.push_node(
            value,
            requires_grad && !self.recording_detached,
            NodeOrigin::Computed {
                op: TapeOp::CloneValue,
                inputs: vec![src],
                saved: Vec::new(),
                grad_depth: self.recording_grad_depth,
            },
        ))
    }

    pub fn backward(
        &mut self,
        root: NodeId,
        mode: ExecutionMode,
    ) -> Result<BackwardReport, AutogradError> {
        self.backward_with_options(root, mode, BackwardOptions::for_mode(mode))
    }

    pub fn backward_with_options(
        &mut self,
        root: NodeId,
        mode: ExecutionMode,
        options: BackwardOptions,
    ) -> Result<BackwardReport, AutogradError> {
        let seed = self.ones_like(root)?;
        let wrt: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| matches!(node.origin, NodeOrigin::Leaf(LeafKind::Variable)))
            .map(|(index, _)| NodeId(index))
            .collect();
        self.vjp(&[root], &[seed], &wrt, false, mode, options)
    }

    /// Vector-Jacobian product: seeds each output with its incoming gradient
    /// and propagates back to the requested targets. With `create_graph` the
    /// produced gradients stay differentiable, which is how second
    /// derivatives are taken.
    pub fn vjp(
        &mut self,
        outputs: &[NodeId],
        grad_outputs: &[NodeId],
        wrt: &[NodeId],
        create_graph: bool,
        mode: ExecutionMode,
        options: BackwardOptions,
    ) -> Result<BackwardReport, AutogradError> {
        if outputs.len() != grad_outputs.len() {
            return Err(AutogradError::GradCountMismatch {
                outputs: outputs.len(),
                grads: grad_outputs.len(),
            });
        }
        for (output, grad) in outputs.iter().zip(grad_outputs.iter()) {
            let output_node = self.node(*output)?;
            if !output_node.requires_grad {
                return Err(AutogradError::RootRequiresNoGrad { node: *output });
            }
            let grad_node = self.node(*grad)?;
            if grad_node.value.shape() != output_node.value.shape() {
                return Err(AutogradError::GradShapeMismatch {
                    node: *output,
                    expected: output_node.value.shape().to_vec(),
                    actual: grad_node.value.shape().to_vec(),
                });
            }
            if grad_node.value.dtype() != output_node.value.dtype() {
                return Err(AutogradError::GradDTypeMismatch {
                    node: *output,
                    expected: output_node.value.dtype(),
                    actual: grad_node.value.dtype(),
                });
            }
        }
        for target in wrt {
            if !self.node(*target)?.requires_grad {
                return Err(AutogradError::WrtRequiresNoGrad { node: *target });
            }
        }

        let root_depth = outputs
            .iter()
            .map(|output| self.node_grad_depth(*output))
            .max()
            .unwrap_or(0);
        let current = options.current_reentrant_depth.max(root_depth);

        let mut reentrant_guard_triggered = false;
        let mut hardened_fallback_used = false;
        if current > options.max_reentrant_depth {
            match options.policy {
                ReentrantPolicy::StrictFail => {
                    return Err(AutogradError::ReentrantDepthExceeded {
                        current,
                        max: options.max_reentrant_depth,
                    });
                }
                ReentrantPolicy::HardenedBoundedFallback => {
                    reentrant_guard_triggered = true;
                    hardened_fallback_used = true;
                }
            }
        }
        let reentrant_depth = current.min(options.max_reentrant_depth);

        let prev_depth = self.recording_grad_depth;
        let prev_detached = self.recording_detached;
        self.recording_grad_depth = current + 1;
        self.recording_detached = prev_detached || !create_graph;
        let result = self.vjp_scheduled(outputs, grad_outputs, wrt, mode);
        self.recording_grad_depth = prev_depth;
        self.recording_detached = prev_detached;

        let (gradients, steps, mut telemetry) = result?;
        telemetry.reentrant_depth = reentrant_depth;
        telemetry.reentrant_guard_triggered = reentrant_guard_triggered;
        telemetry.hardened_fallback_used = hardened_fallback_used;

        Ok(BackwardReport {
            wrt: wrt.to_vec(),
            gradients,
            steps,
            telemetry,
        })
    }

    #[allow(clippy::type_complexity)]
    fn vjp_scheduled(
        &mut self,
        outputs: &[NodeId],
        grad_outputs: &[NodeId],
        wrt: &[NodeId],
        mode: ExecutionMode,
    ) -> Result<(Vec<Option<NodeId>>, Vec<BackwardStep>, SchedulerTelemetry), AutogradError> {
        let pass_len = self.nodes.len();
        let reachable = self.compute_reachable(outputs, pass_len)?;
        let mut pending = self.compute_dependencies(&reachable, pass_len);

        let mut grads: Vec<Option<NodeId>> = vec![None; pass_len];
        let mut queue = ReadyQueue::with_capacity(pass_len.max(1));
        let mut steps = Vec::new();
        let mut execution_order = Vec::new();

        for (output, grad) in outputs.iter().zip(grad_outputs.iter()) {
            self.accumulate(&mut grads, *output, *grad, mode)?;
        }
        let mut seeded: Vec<NodeId> = outputs.to_vec();
        seeded.sort_by_key(|node| node.0);
        seeded.dedup();
        for root in seeded {
            if pending[root.0] == 0 {
                queue.push(root);
            }
        }

        while let Some(node_id) = queue.pop() {
            let Some(incoming) = grads[node_id.0] else {
                return Err(AutogradError::DependencyUnderflow { node: node_id });
            };
            execution_order.push(node_id);

            let origin = self.nodes[node_id.0].origin.clone();
            match origin {
                NodeOrigin::Leaf(_) => {
                    if self.nodes[node_id.0].requires_grad {
                        steps.push(BackwardStep {
                            node: node_id,
                            incoming_grad: incoming,
                            rule: "leaf",
                        });
                    }
                }
                NodeOrigin::Computed {
                    op, inputs, saved, ..
                } => {
                    self.check_saved(&saved)?;
                    let needs: Vec<bool> = inputs
                        .iter()
                        .map(|input| self.nodes[input.0].requires_grad)
                        .collect();
                    let (contributions, rule) =
                        self.op_backward(op, &inputs, &saved, incoming, &needs, mode)?;
                    for (input, contribution) in inputs.iter().zip(contributions) {
                        if let Some(grad) = contribution {
                            self.accumulate(&mut grads, *input, grad, mode)?;
                            Self::complete_dependency(&mut pending, *input, &mut queue)?;
                        }
                    }
                    steps.push(BackwardStep {
                        node: node_id,
                        incoming_grad: incoming,
                        rule,
                    });
                }
            }
        }

        let gradients = wrt
            .iter()
            .map(|target| grads.get(target.0).copied().flatten())
            .collect();

        let telemetry = SchedulerTelemetry {
            execution_order,
            queue_pushes: queue.pushes,
            queue_pops: queue.pops,
            max_queue_len: queue.max_len,
            dependency_snapshot: pending,
            reentrant_depth: 0,
            reentrant_guard_triggered: false,
            hardened_fallback_used: false,
        };

        Ok((gradients, steps, telemetry))
    }

    fn accumulate(
        &mut self,
        grads: &mut [Option<NodeId>],
        target: NodeId,
        contribution: NodeId,
        mode: ExecutionMode,
    ) -> Result<(), AutogradError> {
        grads[target.0] = Some(match grads[target.0] {
            None => contribution,
            Some(existing) => self.bin(BinaryKernelOp::Add, existing, contribution, mode)?,
        });
        Ok(())
    }

    fn compute_reachable(
        &self,
        roots: &[NodeId],
        pass_len: usize,
    ) -> Result<Vec<bool>, AutogradError> {
        let mut reachable = vec![false; pass_len];
        let mut stack: Vec<NodeId> = roots.to_vec();

        while let Some(node_id) = stack.pop() {
            if node_id.0 >= pass_len {
                return Err(AutogradError::UnknownNode(node_id));
            }
            if reachable[node_id.0] {
                continue;
            }
            reachable[node_id.0] = true;

            if let NodeOrigin::Computed { ref inputs, .. } = self.nodes[node_id.0].origin {
                for input in inputs {
                    if self.nodes[input.0].requires_grad {
                        stack.push(*input);
                    }
                }
            }
        }

        Ok(reachable)
    }

    fn compute_dependencies(&self, reachable: &[bool], pass_len: usize) -> Vec<usize> {
        let mut pending = vec![0usize; pass_len];
        for (index, node) in self.nodes.iter().take(pass_len).enumerate() {
            if !reachable[index] {
                continue;
            }
            if let NodeOrigin::Computed { ref inputs, .. } = node.origin {
                for input in inputs {
                    if self.nodes[input.0].requires_grad {
                        pending[input.0] = pending[input.0].saturating_add(1);
                    }
                }
            }
        }
        pending
    }

    fn complete_dependency(
        pending: &mut [usize],
        node: NodeId,
        queue: &mut ReadyQueue,
    ) -> Result<(), AutogradError> {
        if pending[node.0] == 0 {
            return Err(AutogradError::DependencyUnderflow { node });
        }
        pending[node.0] -= 1;
        if pending[node.0] == 0 {
            queue.push(node);
        }
        Ok(())
    }

    fn check_saved(&self, saved: &[SavedValue]) -> Result<(), AutogradError> {
        for entry in saved {
            let actual = self.node(entry.node)?.value.version();
            if actual != entry.expected_version {
                return Err(AutogradError::SavedValueStale {
                    node: entry.node,
                    expected_version: entry.expected_version,
                    actual_version: actual,
                });
            }
        }
        Ok(())
    }

    fn op_backward(
        &mut self,
        op: TapeOp,
        inputs: &[NodeId],
        saved: &[SavedValue],
        grad_out: NodeId,
        needs: &[bool],
        mode: ExecutionMode,
    ) -> Result<(Vec<Option<NodeId>>, &'static str), AutogradError> {
        let result = match op {
            TapeOp::CloneValue => (vec![needs[0].then_some(grad_out)], "clone grad passes through"),
            TapeOp::Expand => {
                let grad = if needs[0] {
                    Some(self.record_dispatch(OpKind::Sum, &[grad_out], false, mode)?.0)
                } else {
                    None
                };
                (vec![grad], "d(expand s)/ds=sum")
            }
            TapeOp::Dispatch(OpKind::Sum) => {
                let grad = if needs[0] {
                    Some(self.record_expand(grad_out, inputs[0])?)
                } else {
                    None
                };
                (vec![grad], "d(sum a)/da_i=1")
            }
            TapeOp::Dispatch(OpKind::Cast(_)) => {
                let grad = if needs[0] {
                    let input_dtype = self.node(inputs[0])?.value.dtype();
                    Some(
                        self.record_dispatch(OpKind::Cast(input_dtype), &[grad_out], false, mode)?
                            .0,
                    )
                } else {
                    None
                };
                (vec![grad], "cast grad passes through")
            }
            TapeOp::Dispatch(OpKind::Binary(binary)) => match binary {
                BinaryKernelOp::Add => (
                    vec![needs[0].then_some(grad_out), needs[1].then_some(grad_out)],
                    "d(a+b)/da=1; d(a+b)/db=1",
                ),
                BinaryKernelOp::Sub => {
                    let rhs_grad = if needs[1] {
                        Some(self.un(UnaryKernelOp::Neg, grad_out, mode)?)
                    } else {
                        None
                    };
                    (
                        vec![needs[0].then_some(grad_out), rhs_grad],
                        "d(a-b)/da=1; d(a-b)/db=-1",
                    )
                }
                BinaryKernelOp::Mul => {
                    let lhs_grad = if needs[0] {
                        Some(self.bin(BinaryKernelOp::Mul, grad_out, saved[1].node, mode)?)
                    } else {
                        None
                    };
                    let rhs_grad = if needs[1] {
                        Some(self.bin(BinaryKernelOp::Mul, grad_out, saved[0].node, mode)?)
                    } else {
                        None
                    };
                    (vec![lhs_grad, rhs_grad], "d(a*b)/da=b; d(a*b)/db=a")
                }
                BinaryKernelOp::Div => {
                    let rhs_saved = saved[0].node;
                    let out_saved = saved[1].node;
                    let lhs_grad = if needs[0] {
                        Some(self.bin(BinaryKernelOp::Div, grad_out, rhs_saved, mode)?)
                    } else {
                        None
                    };
                    let rhs_grad = if needs[1] {
                        let scaled = self.bin(BinaryKernelOp::Mul, grad_out, out_saved, mode)?;
                        let ratio = self.bin(BinaryKernelOp::Div, scaled, rhs_saved, mode)?;
                        Some(self.un(UnaryKernelOp::Neg, ratio, mode)?)
                    } else {
                        None
                    };
                    (vec![lhs_grad, rhs_grad], "d(a/b)/da=1/b; d(a/b)/db=-(a/b^2)")
                }
            },
            TapeOp::Dispatch(OpKind::Unary(unary)) => {
                let grad = if needs[0] {
                    Some(self.unary_input_grad(unary, saved, grad_out, inputs[0], mode)?)
                } else {
                    None
                };
                (vec![grad], unary_rule(unary))
            }
        };
        Ok(result)
    }

    fn unary_input_grad(
        &mut self,
        unary: UnaryKernelOp,
        saved: &[SavedValue],
        grad_out: NodeId,
        input: NodeId,
        mode: ExecutionMode,
    ) -> Result<NodeId, AutogradError> {
        match unary {
            UnaryKernelOp::Neg => self.un(UnaryKernelOp::Neg, grad_out, mode),
            UnaryKernelOp::Abs => {
                let mask = self.un(UnaryKernelOp::SignMask, saved[0].node, mode)?;
                self.bin(BinaryKernelOp::Mul, grad_out, mask, mode)
            }
            UnaryKernelOp::Relu => {
                let mask = self.un(UnaryKernelOp::StepMask, saved[0].node, mode)?;
                self.bin(BinaryKernelOp::Mul, grad_out, mask, mode)
            }
            UnaryKernelOp::Sqrt => {
                let doubled = self.bin(BinaryKernelOp::Add, saved[0].node, saved[0].node, mode)?;
                self.bin(BinaryKernelOp::Div, grad_out, doubled, mode)
            }
            UnaryKernelOp::Exp => self.bin(BinaryKernelOp::Mul, grad_out, saved[0].node, mode),
            UnaryKernelOp::Log => self.bin(BinaryKernelOp::Div, grad_out, saved[0].node, mode),
            UnaryKernelOp::Sin => {
                let cos = self.un(UnaryKernelOp::Cos, saved[0].node, mode)?;
                self.bin(BinaryKernelOp::Mul, grad_out, cos, mode)
            }
            UnaryKernelOp::Cos => {
                let sin = self.un(UnaryKernelOp::Sin, saved[0].node, mode)?;
                let scaled = self.bin(BinaryKernelOp::Mul, grad_out, sin, mode)?;
                self.un(UnaryKernelOp::Neg, scaled, mode)
            }
            UnaryKernelOp::Tanh => {
                let squared = self.bin(BinaryKernelOp::Mul, saved[0].node, saved[0].node, mode)?;
                let scaled = self.bin(BinaryKernelOp::Mul, grad_out, squared, mode)?;
                self.bin(BinaryKernelOp::Sub, grad_out, scaled, mode)
            }
            UnaryKernelOp::Sigmoid => {
                let front = self.bin(BinaryKernelOp::Mul, grad_out, saved[0].node, mode)?;
                let tail = self.bin(BinaryKernelOp::Mul, front, saved[0].node, mode)?;
                self.bin(BinaryKernelOp::Sub, front, tail, mode)
            }
            UnaryKernelOp::Reciprocal => {
                let squared = self.bin(BinaryKernelOp::Mul, saved[0].node, saved[0].node, mode)?;
                let scaled = self.bin(BinaryKernelOp::Mul, grad_out, squared, mode)?;
                self.un(UnaryKernelOp::Neg, scaled, mode)
            }
            UnaryKernelOp::SignMask | UnaryKernelOp::StepMask => Ok(self.zeros_like(input)?),
        }
    }

    fn bin(
        &mut self,
        op: BinaryKernelOp,
        lhs: NodeId,
        rhs: NodeId,
        mode: ExecutionMode,
    ) -> Result<NodeId, AutogradError> {
        Ok(self
            .record_dispatch(OpKind::Binary(op), &[lhs, rhs], false, mode)?
            .0)
    }

    fn un(
        &mut self,
        op: UnaryKernelOp,
        input: NodeId,
        mode: ExecutionMode,
    ) -> Result<NodeId, AutogradError> {
        Ok(self
            .record_dispatch(OpKind::Unary(op), &[input], false, mode)?
            .0)
    }

    fn record_dispatch(
        &mut self,
        kind: OpKind,
        inputs: &[NodeId],
        promotes_integer_to_float: bool,
        mode: ExecutionMode,
    ) -> Result<(NodeId, OperationEvent), AutogradError> {
        let requires_grad = self.any_requires_grad(inputs)?;
        let tensors: Vec<DenseTensor> = inputs
            .iter()
            .map(|id| self.node(*id).map(|n| n.value.clone()))
            .collect::<Result<_, _>>()?;
        let tensor_refs: Vec<&DenseTensor> = tensors.iter().collect();
        let outcome = dispatch(kind, &tensor_refs, promotes_integer_to_float, mode)?;

        let out = NodeId(self.nodes.len());
        let saved = if requires_grad {
            match saved_plan(kind) {
                SavedPlan::Nothing => Vec::new(),
                SavedPlan::Input => vec![self.saved_ref(inputs[0])?],
                SavedPlan::BothInputs => {
                    vec![self.saved_ref(inputs[0])?, self.saved_ref(inputs[1])?]
                }
                SavedPlan::RhsAndOutput => vec![
                    self.saved_ref(inputs[1])?,
                    SavedValue {
                        node: out,
                        expected_version: outcome.value.version(),
                    },
                ],
                SavedPlan::Output => vec![SavedValue {
                    node: out,
                    expected_version: outcome.value.version(),
                }],
            }
        } else {
            Vec::new()
        };

        self.nodes.push(Node {
            value: outcome.value,
            requires_grad: requires_grad && !self.recording_detached,
            origin: NodeOrigin::Computed {
                op: TapeOp::Dispatch(kind),
                inputs: inputs.to_vec(),
                saved,
                grad_depth: self.recording_grad_depth,
            },
        });

        Ok((
            out,
            OperationEvent {
                op: kind,
                inputs: inputs.to_vec(),
                out,
                decision: outcome.decision,
            },
        ))
    }

    /// Broadcasts a rank-0 value across the shape of `like`. Linear in the
    /// scalar, so its backward is a plain sum.
    fn record_expand(&mut self, scalar: NodeId, like: NodeId) -> Result<NodeId, AutogradError> {
        let scalar_value = self.node(scalar)?.value.read_logical(0)?;
        let like_value = &self.node(like)?.value;
        let shape = like_value.shape().to_vec();
        let dtype = self.node(scalar)?.value.dtype();
        let device = like_value.device();
        let numel = like_value.numel();
        let data = TensorData::from_f64_values(dtype, &vec![scalar_value; numel]);
        let value = DenseTensor::from_values(data, shape, device)?;
        let requires_grad = self.node(scalar)?.requires_grad;
        Ok(self.push_node(
            value,
            requires_grad && !self.recording_detached,
            NodeOrigin::Computed {
                op: TapeOp::Expand,
                inputs: vec![scalar],
                saved: Vec::new(),
                grad_depth: self.recording_grad_depth,
            },
        ))
    }

    fn zeros_like(&mut self, like: NodeId) -> Result<NodeId, AutogradError> {
        let value = {
            let tensor = &self.node(like)?.value;
            DenseTensor::zeros(tensor.shape().to_vec(), tensor.dtype(), tensor.device())
        };
        Ok(self.constant(value))
    }

    fn ones_like(&mut self, like: NodeId) -> Result<NodeId, AutogradError> {
        let value = {
            let tensor = &self.node(like)?.value;
            let data =
                TensorData::from_f64_values(tensor.dtype(), &vec![1.0; tensor.numel()]);
            DenseTensor::from_values(data, tensor.shape().to_vec(), tensor.device())?
        };
        Ok(self.constant(value))
    }

    fn saved_ref(&self, node: NodeId) -> Result<SavedValue, AutogradError> {
        Ok(SavedValue {
            node,
            expected_version: self.node(node)?.value.version(),
        })
    }

    fn any_requires_grad(&self, inputs: &[NodeId]) -> Result<bool, AutogradError> {
        let mut requires = false;
        for input in inputs {
            requires |= self.node(*input)?.requires_grad;
        }
        Ok(requires)
    }

    fn node_grad_depth(&self, node: NodeId) -> usize {
        match self.nodes.get(node.0).map(|n| &n.origin) {
            Some(NodeOrigin::Computed { grad_depth, .. }) => *grad_depth,
            _ => 0,
        }
    }

    fn push_node(&mut self, value: DenseTensor, requires_grad: bool, origin: NodeOrigin) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            value,
            requires_grad,
            origin,
        });
        id
    }

    fn node(&self, id: NodeId) -> Result<&Node, AutogradError> {
        self.nodes.get(id.0).ok_or(AutogradError::UnknownNode(id))
    }
}

fn unary_rule(unary: UnaryKernelOp) -> &'static str {
    match unary {
        UnaryKernelOp::Neg => "d(-a)/da=-1",
        UnaryKernelOp::Abs => "d|a|/da=sign(a)",
        UnaryKernelOp::Relu => "d(relu a)/da=step(a)",
        UnaryKernelOp::Sqrt => "d(sqrt a)/da=1/(2*sqrt a)",
        UnaryKernelOp::Exp => "d(exp a)/da=exp a",
        UnaryKernelOp::Log => "d(log a)/da=1/a",
        UnaryKernelOp::Sin => "d(sin a)/da=cos a",
        UnaryKernelOp::Cos => "d(cos a)/da=-sin a",
        UnaryKernelOp::Tanh => "d(tanh a)/da=1-tanh^2 a",
        UnaryKernelOp::Sigmoid => "d(sig a)/da=sig a*(1-sig a)",
        UnaryKernelOp::Reciprocal => "d(1/a)/da=-1/a^2",
        UnaryKernelOp::SignMask | UnaryKernelOp::StepMask => "mask grad=0",
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradcheckOptions {
    pub eps: f64,
    pub atol: f64,
    pub rtol: f64,
    pub check_grad_dtypes: bool,
    pub gen_non_contig_grad_outputs: bool,
    pub mode: ExecutionMode,
}

impl Default for GradcheckOptions {
    fn default() -> Self {
        Self {
            eps: 1e-6,
            atol: 1e-5,
            rtol: 1e-3,
            check_grad_dtypes: false,
            gen_non_contig_grad_outputs: false,
            mode: ExecutionMode::Strict,
        }
    }
}

impl GradcheckOptions {
    #[must_use]
    pub fn for_mode(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradcheckReport {
    pub inputs_checked: usize,
    pub outputs_checked: usize,
    pub comparisons: usize,
    pub max_abs_difference: f64,
    pub non_contig_grad_outputs_used: bool,
    pub grad_dtypes_checked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GradcheckError {
    Autograd(AutogradError),
    InputNotLeafVariable { index: usize },
    InputNotDoublePrecision { index: usize, dtype: DType },
    OutputNotDifferentiable { output: usize, dtype: DType },
    EmptyOutputs,
    JacobianMismatch {
        input: usize,
        output: usize,
        row: usize,
        col: usize,
        analytical: f64,
        numerical: f64,
        atol: f64,
        rtol: f64,
    },
    GradDTypeMismatch { input: usize, expected: DType, actual: DType },
}

impl fmt::Display for GradcheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Autograd(error) => write!(f, "autograd failure during gradcheck: {error}"),
            Self::InputNotLeafVariable { index } => {
                write!(f, "gradcheck input {index} is not a leaf variable")
            }
            Self::InputNotDoublePrecision { index, dtype } => write!(
                f,
                "gradcheck input {index} has dtype {dtype:?}; numerical gradients need f64"
            ),
            Self::OutputNotDifferentiable { output, dtype } => write!(
                f,
                "gradcheck output {output} has non-differentiable dtype {dtype:?}"
            ),
            Self::EmptyOutputs => write!(f, "gradcheck function returned no outputs"),
            Self::JacobianMismatch {
                input,
                output,
                row,
                col,
                analytical,
                numerical,
                atol,
                rtol,
            } => write!(
                f,
                "Jacobian mismatch for output {output} with respect to input {input} at \
                 ({row}, {col}): analytical {analytical} vs numerical {numerical} \
                 (atol={atol}, rtol={rtol})"
            ),
            Self::GradDTypeMismatch {
                input,
                expected,
                actual,
            } => write!(
                f,
                "analytical gradient for input {input} has dtype {actual:?}, expected {expected:?}"
            ),
        }
    }
}

impl std::error::Error for GradcheckError {}

impl From<AutogradError> for GradcheckError {
    fn from(inner: AutogradError) -> Self {
        Self::Autograd(inner)
    }
}

impl From<TensorError> for GradcheckError {
    fn from(inner: TensorError) -> Self {
        Self::Autograd(AutogradError::Tensor(inner))
    }
}

impl GradcheckError {
    #[must_use]
    pub fn is_jacobian_mismatch(&self) -> bool {
        matches!(self, Self::JacobianMismatch { .. })
    }
}

/// Incoming gradient with a single 1.0 at logical position `hot`. With
/// `non_contig` the tensor is laid out with doubled strides over a
/// double-length storage, so kernels must honor the layout to read it.
fn one_hot_grad(
    tape: &mut Tape,
    shape: &[usize],
    dtype: DType,
    device: fo_core::Device,
    hot: usize,
    non_contig: bool,
) -> Result<NodeId, GradcheckError> {
    let meta = fo_core::TensorMeta::from_shape(shape.to_vec(), dtype, device);
    let numel = meta.numel();
    let tensor = if non_contig && numel > 1 {
        let strides: Vec<usize> = fo_core::contiguous_strides(shape)
            .iter()
            .map(|stride| stride * 2)
            .collect();
        let spread = fo_core::TensorMeta::from_shape_and_strides(
            shape.to_vec(),
            strides,
            0,
            dtype,
            device,
        )
        .map_err(|error| GradcheckError::Autograd(AutogradError::Tensor(error.into())))?;
        let storage = TensorData::zeros(dtype, numel * 2);
        DenseTensor::from_meta_and_storage(spread, storage)?
    } else {
        DenseTensor::zeros(shape.to_vec(), dtype, device)
    };
    tensor.write_logical(hot, 1.0)?;
    Ok(tape.constant(tensor))
}

fn flatten_outputs(tape: &Tape, outputs: &[NodeId]) -> Result<Vec<Vec<f64>>, GradcheckError> {
    outputs
        .iter()
        .map(|output| tape.values_f64(*output).map_err(GradcheckError::from))
        .collect()
}

/// Compares analytical Jacobians produced by the tape against central-difference
/// numerical Jacobians, elementwise under `|a - n| <= atol + rtol * |n|`.
///
/// The analytical pass runs before any perturbation so saved-value version
/// checks stay green while the function is re-evaluated.
pub fn gradcheck<F>(
    tape: &mut Tape,
    mut f: F,
    inputs: &[NodeId],
    options: &GradcheckOptions,
) -> Result<GradcheckReport, GradcheckError>
where
    F: FnMut(&mut Tape, &[NodeId]) -> Result<Vec<NodeId>, AutogradError>,
{
    for (index, input) in inputs.iter().enumerate() {
        if !tape.is_leaf(*input).map_err(GradcheckError::from)?
            || !tape.requires_grad(*input).map_err(GradcheckError::from)?
        {
            return Err(GradcheckError::InputNotLeafVariable { index });
        }
        let dtype = tape.value(*input).map_err(GradcheckError::from)?.dtype();
        if dtype != DType::F64 {
            return Err(GradcheckError::InputNotDoublePrecision { index, dtype });
        }
    }

    let outputs = f(tape, inputs)?;
    if outputs.is_empty() {
        return Err(GradcheckError::EmptyOutputs);
    }
    for (index, output) in outputs.iter().enumerate() {
        let dtype = tape.value(*output).map_err(GradcheckError::from)?.dtype();
        if !dtype.is_floating_point() {
            return Err(GradcheckError::OutputNotDifferentiable {
                output: index,
                dtype,
            });
        }
    }

    let input_sizes: Vec<usize> = inputs
        .iter()
        .map(|input| tape.value(*input).map(DenseTensor::numel))
        .collect::<Result<_, _>>()
        .map_err(GradcheckError::from)?;
    let output_sizes: Vec<usize> = outputs
        .iter()
        .map(|output| tape.value(*output).map(DenseTensor::numel))
        .collect::<Result<_, _>>()
        .map_err(GradcheckError::from)?;

    // analytical[o][j][i] is the gradient of output element (o, j) with
    // respect to every element of input i; None marks a disconnected pair.
    let mut analytical: Vec<Vec<Vec<Option<Vec<f64>>>>> = Vec::with_capacity(outputs.len());
    for (o, output) in outputs.iter().enumerate() {
        let (shape, dtype, device) = {
            let value = tape.value(*output).map_err(GradcheckError::from)?;
            (value.shape().to_vec(), value.dtype(), value.device())
        };
        let mut per_element = Vec::with_capacity(output_sizes[o]);
        for j in 0..output_sizes[o] {
            let seed = one_hot_grad(
                tape,
                &shape,
                dtype,
                device,
                j,
                options.gen_non_contig_grad_outputs,
            )?;
            let report = tape.vjp(
                &[*output],
                &[seed],
                inputs,
                false,
                options.mode,
                BackwardOptions::for_mode(options.mode),
            )?;
            let mut per_input = Vec::with_capacity(inputs.len());
            for (i, input) in inputs.iter().enumerate() {
                match report.gradient_at(i) {
                    Some(grad) => {
                        if options.check_grad_dtypes {
                            let expected = tape.value(*input).map_err(GradcheckError::from)?.dtype();
                            let actual = tape.value(grad).map_err(GradcheckError::from)?.dtype();
                            if actual != expected {
                                return Err(GradcheckError::GradDTypeMismatch {
                                    input: i,
                                    expected,
                                    actual,
                                });
                            }
                        }
                        per_input.push(Some(tape.values_f64(grad).map_err(GradcheckError::from)?));
                    }
                    None => per_input.push(None),
                }
            }
            per_element.push(per_input);
        }
        analytical.push(per_element);
    }

    // numerical[i][k][o] holds the flattened outputs' central difference for
    // element k of input i.
    let mut numerical: Vec<Vec<Vec<Vec<f64>>>> = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        let mut per_element = Vec::with_capacity(input_sizes[i]);
        for k in 0..input_sizes[i] {
            let original = tape.read_leaf_value(*input, k)?;

            tape.write_leaf_value(*input, k, original + options.eps)?;
            let outputs_plus = f(tape, inputs)?;
            let plus = flatten_outputs(tape, &outputs_plus)?;

            tape.write_leaf_value(*input, k, original - options.eps)?;
            let outputs_minus = f(tape, inputs)?;
            let minus = flatten_outputs(tape, &outputs_minus)?;

            tape.write_leaf_value(*input, k, original)?;

            let mut per_output = Vec::with_capacity(outputs.len());
            for (p, m) in plus.iter().zip(minus.iter()) {
                per_output.push(
                    p.iter()
                        .zip(m.iter())
                        .map(|(hi, lo)| (hi - lo) / (2.0 * options.eps))
                        .collect::<Vec<f64>>(),
                );
            }
            per_element.push(per_output);
        }
        numerical.push(per_element);
    }

    let mut comparisons = 0usize;
    let mut max_abs_difference = 0.0f64;
    for (o, per_element) in analytical.iter().enumerate() {
        for (j, per_input) in per_element.iter().enumerate() {
            for (i, row) in per_input.iter().enumerate() {
                for k in 0..input_sizes[i] {
                    let a = row.as_ref().map_or(0.0, |values| values[k]);
                    let n = numerical[i][k][o][j];
                    let diff = (a - n).abs();
                    max_abs_difference = max_abs_difference.max(diff);
                    comparisons += 1;
                    if diff > options.atol + options.rtol * n.abs() {
                        return Err(GradcheckError::JacobianMismatch {
                            input: i,
                            output: o,
                            row: k,
                            col: j,
                            analytical: a,
                            numerical: n,
                            atol: options.atol,
                            rtol: options.rtol,
                        });
                    }
                }
            }
        }
    }

    Ok(GradcheckReport {
        inputs_checked: inputs.len(),
        outputs_checked: outputs.len(),
        comparisons,
        max_abs_difference,
        non_contig_grad_outputs_used: options.gen_non_contig_grad_outputs,
        grad_dtypes_checked: options.check_grad_dtypes,
    })
}

/// Gradcheck over the first backward pass: differentiates the gradients of
/// `f` with respect to both the original inputs and the incoming gradients.
/// `grad_outputs` must be double-precision leaf variables, one per output of
/// `f`.
pub fn gradgradcheck<F>(
    tape: &mut Tape,
    mut f: F,
    inputs: &[NodeId],
    grad_outputs: &[NodeId],
    options: &GradcheckOptions,
) -> Result<GradcheckReport, GradcheckError>
where
    F: FnMut(&mut Tape, &[NodeId]) -> Result<Vec<NodeId>, AutogradError>,
{
    let input_count = inputs.len();
    let mut combined: Vec<NodeId> = Vec::with_capacity(input_count + grad_outputs.len());
    combined.extend_from_slice(inputs);
    combined.extend_from_slice(grad_outputs);

    let mode = options.mode;
    let grad_fn = |tape: &mut Tape, xs: &[NodeId]| -> Result<Vec<NodeId>, AutogradError> {
        let (primal, seeds) = xs.split_at(input_count);
        let outputs = f(tape, primal)?;
        if outputs.len() != seeds.len() {
            return Err(AutogradError::GradCountMismatch {
                outputs: outputs.len(),
                grads: seeds.len(),
            });
        }
        let report = tape.vjp(
            &outputs,
            seeds,
            primal,
            true,
            mode,
            BackwardOptions::for_mode(mode),
        )?;
        let mut grads = Vec::with_capacity(primal.len());
        for (index, target) in primal.iter().enumerate() {
            match report.gradient_at(index) {
                Some(grad) => grads.push(grad),
                None => return Err(AutogradError::DisconnectedGradient { node: *target }),
            }
        }
        Ok(grads)
    };

    gradcheck(tape, grad_fn, &combined, options)
}
