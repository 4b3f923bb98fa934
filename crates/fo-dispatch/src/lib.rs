#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use fo_core::{DType, DenseTensor, Device, ExecutionMode};
use fo_device::{DeviceError, ensure_available, ensure_same_device};
use fo_kernel_cpu::{
    BinaryKernelOp, KernelError, UnaryKernelOp, binary_elementwise, binary_elementwise_into,
    binary_kernel_dtypes, cast, reduce_sum, unary_elementwise, unary_elementwise_into,
    unary_kernel_dtypes,
};

/// The dispatchable operator set. `Sum`, `Cast`, and the mask kernels are
/// internal plumbing (loss reduction, promotion, backward formulas) and carry
/// no public schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Binary(BinaryKernelOp),
    Unary(UnaryKernelOp),
    Sum,
    Cast(DType),
}

impl OpKind {
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Binary(op) => op.token(),
            Self::Unary(op) => op.token(),
            Self::Sum => "sum",
            Self::Cast(_) => "cast",
        }
    }

    #[must_use]
    pub fn arity(self) -> usize {
        match self {
            Self::Binary(_) => 2,
            Self::Unary(_) | Self::Sum | Self::Cast(_) => 1,
        }
    }

    #[must_use]
    pub fn supports_dtype(self, dtype: DType) -> bool {
        match self {
            Self::Binary(op) => binary_kernel_dtypes(op).contains(dtype),
            Self::Unary(op) => unary_kernel_dtypes(op).contains(dtype),
            Self::Sum => dtype.is_floating_point(),
            Self::Cast(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    Parse { text: String, message: String },
    DuplicateEntry { table: &'static str, key: String },
    MissingNamespace { text: String },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { text, message } => {
                write!(f, "schema parse failed for '{text}': {message}")
            }
            Self::DuplicateEntry { table, key } => {
                write!(f, "duplicate {table} entry '{key}'")
            }
            Self::MissingNamespace { text } => {
                write!(f, "schema '{text}' lacks the fo:: namespace")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaArg {
    pub name: String,
    pub alias_set: Option<char>,
    pub writes: bool,
    pub keyword_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaReturn {
    pub alias_set: Option<char>,
    pub writes: bool,
}

/// Parsed operator schema, e.g.
/// `fo::add_(Tensor(a!) self, Tensor other) -> Tensor(a!)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpSchema {
    pub qualified_name: String,
    pub base: String,
    pub overload: Option<String>,
    pub args: Vec<SchemaArg>,
    pub ret: SchemaReturn,
}

impl OpSchema {
    #[must_use]
    pub fn is_inplace(&self) -> bool {
        self.base.ends_with('_')
    }

    #[must_use]
    pub fn out_arg(&self) -> Option<&SchemaArg> {
        self.args
            .iter()
            .find(|arg| arg.keyword_only && arg.name == "out")
    }

    /// Name of the argument the return value aliases, if the return carries
    /// an alias set.
    #[must_use]
    pub fn aliased_arg(&self) -> Option<&SchemaArg> {
        let set = self.ret.alias_set?;
        self.args.iter().find(|arg| arg.alias_set == Some(set))
    }
}

fn parse_annotated_tensor(token: &str, text: &str) -> Result<(Option<char>, bool), SchemaError> {
    if token == "Tensor" {
        return Ok((None, false));
    }
    let inner = token
        .strip_prefix("Tensor(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| SchemaError::Parse {
            text: text.to_string(),
            message: format!("expected Tensor or Tensor(<set>!), got '{token}'"),
        })?;
    let writes = inner.ends_with('!');
    let set_token = inner.strip_suffix('!').unwrap_or(inner);
    let mut chars = set_token.chars();
    let set = chars.next().ok_or_else(|| SchemaError::Parse {
        text: text.to_string(),
        message: "empty alias set".to_string(),
    })?;
    if chars.next().is_some() || !set.is_ascii_lowercase() {
        return Err(SchemaError::Parse {
            text: text.to_string(),
            message: format!("alias set must be one lowercase letter, got '{set_token}'"),
        });
    }
    Ok((Some(set), writes))
}

pub fn parse_schema(text: &str) -> Result<OpSchema, SchemaError> {
    let (lhs, rhs) = text.split_once("->").ok_or_else(|| SchemaError::Parse {
        text: text.to_string(),
        message: "missing '->' return marker".to_string(),
    })?;
    let lhs = lhs.trim();
    let rhs = rhs.trim();

    let (qualified, args_raw) = lhs
        .split_once('(')
        .and_then(|(name, rest)| rest.strip_suffix(')').map(|args| (name.trim(), args)))
        .ok_or_else(|| SchemaError::Parse {
            text: text.to_string(),
            message: "malformed argument list".to_string(),
        })?;

    let unqualified = qualified
        .strip_prefix("fo::")
        .ok_or_else(|| SchemaError::MissingNamespace {
            text: text.to_string(),
        })?;
    let (base, overload) = match unqualified.split_once('.') {
        Some((base, overload)) => (base.to_string(), Some(overload.to_string())),
        None => (unqualified.to_string(), None),
    };
    if base.is_empty() {
        return Err(SchemaError::Parse {
            text: text.to_string(),
            message: "empty operator name".to_string(),
        });
    }

    let mut args = Vec::new();
    let mut keyword_only = false;
    for piece in args_raw.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if piece == "*" {
            keyword_only = true;
            continue;
        }
        let (type_token, name) =
            piece
                .rsplit_once(' ')
                .ok_or_else(|| SchemaError::Parse {
                    text: text.to_string(),
                    message: format!("argument '{piece}' lacks a name"),
                })?;
        let (alias_set, writes) = parse_annotated_tensor(type_token.trim(), text)?;
        args.push(SchemaArg {
            name: name.trim().to_string(),
            alias_set,
            writes,
            keyword_only,
        });
    }

    let (ret_alias, ret_writes) = parse_annotated_tensor(rhs, text)?;

    Ok(OpSchema {
        qualified_name: qualified.to_string(),
        base,
        overload,
        args,
        ret: SchemaReturn {
            alias_set: ret_alias,
            writes: ret_writes,
        },
    })
}

/// Per-operator metadata carried alongside schemas. `fusion_eligible` feeds
/// the graph executor's fusion partition; `promotes_integer_to_float` is the
/// functional-path widening rule the in-place and out paths must refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpMetadata {
    pub differentiable: bool,
    pub fusion_eligible: bool,
    pub promotes_integer_to_float: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    pub schema: OpSchema,
    pub kind: OpKind,
    pub metadata: OpMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    functions: BTreeMap<String, SchemaEntry>,
    methods: BTreeMap<String, SchemaEntry>,
    inplace: BTreeMap<String, SchemaEntry>,
    out_variants: BTreeMap<String, SchemaEntry>,
}

struct BuiltinOp {
    base: &'static str,
    kind: OpKind,
    metadata: OpMetadata,
    has_method: bool,
    has_inplace: bool,
    has_out: bool,
}

const POINTWISE_META: OpMetadata = OpMetadata {
    differentiable: true,
    fusion_eligible: false,
    promotes_integer_to_float: false,
};

const PROMOTING_META: OpMetadata = OpMetadata {
    differentiable: true,
    fusion_eligible: true,
    promotes_integer_to_float: true,
};

fn builtin_ops() -> Vec<BuiltinOp> {
    let full = |base: &'static str, kind: OpKind, metadata: OpMetadata| BuiltinOp {
        base,
        kind,
        metadata,
        has_method: true,
        has_inplace: true,
        has_out: true,
    };

    vec![
        full("add", OpKind::Binary(BinaryKernelOp::Add), POINTWISE_META),
        full("sub", OpKind::Binary(BinaryKernelOp::Sub), POINTWISE_META),
        full("mul", OpKind::Binary(BinaryKernelOp::Mul), POINTWISE_META),
        // div carries true-divide semantics: integral inputs widen on the
        // functional path.
        full(
            "div",
            OpKind::Binary(BinaryKernelOp::Div),
            OpMetadata {
                differentiable: true,
                fusion_eligible: false,
                promotes_integer_to_float: true,
            },
        ),
        full("neg", OpKind::Unary(UnaryKernelOp::Neg), POINTWISE_META),
        full("abs", OpKind::Unary(UnaryKernelOp::Abs), POINTWISE_META),
        full("relu", OpKind::Unary(UnaryKernelOp::Relu), POINTWISE_META),
        full("sqrt", OpKind::Unary(UnaryKernelOp::Sqrt), PROMOTING_META),
        full("exp", OpKind::Unary(UnaryKernelOp::Exp), PROMOTING_META),
        // Registry coverage is deliberately partial, mirroring the state of
        // the op database: log has no in-place variant, sigmoid exposes
        // neither a method nor an out variant.
        BuiltinOp {
            base: "log",
            kind: OpKind::Unary(UnaryKernelOp::Log),
            metadata: PROMOTING_META,
            has_method: true,
            has_inplace: false,
            has_out: true,
        },
        full("sin", OpKind::Unary(UnaryKernelOp::Sin), PROMOTING_META),
        full("cos", OpKind::Unary(UnaryKernelOp::Cos), PROMOTING_META),
        full("tanh", OpKind::Unary(UnaryKernelOp::Tanh), PROMOTING_META),
        BuiltinOp {
            base: "sigmoid",
            kind: OpKind::Unary(UnaryKernelOp::Sigmoid),
            metadata: PROMOTING_META,
            has_method: false,
            has_inplace: true,
            has_out: false,
        },
        full(
            "reciprocal",
            OpKind::Unary(UnaryKernelOp::Reciprocal),
            PROMOTING_META,
        ),
    ]
}

fn function_schema_text(base: &str, arity: usize) -> String {
    if arity == 2 {
        format!("fo::{base}(Tensor self, Tensor other) -> Tensor")
    } else {
        format!("fo::{base}(Tensor self) -> Tensor")
    }
}

fn inplace_schema_text(base: &str, arity: usize) -> String {
    if arity == 2 {
        format!("fo::{base}_(Tensor(a!) self, Tensor other) -> Tensor(a!)")
    } else {
        format!("fo::{base}_(Tensor(a!) self) -> Tensor(a!)")
    }
}

fn out_schema_text(base: &str, arity: usize) -> String {
    if arity == 2 {
        format!("fo::{base}.out(Tensor self, Tensor other, *, Tensor(a!) out) -> Tensor(a!)")
    } else {
        format!("fo::{base}.out(Tensor self, *, Tensor(a!) out) -> Tensor(a!)")
    }
}

impl SchemaRegistry {
    pub fn builtin() -> Result<Self, SchemaError> {
        let mut registry = Self::default();
        for op in builtin_ops() {
            let arity = op.kind.arity();
            registry.insert_function(
                parse_schema(&function_schema_text(op.base, arity))?,
                op.kind,
                op.metadata,
            )?;
            if op.has_method {
                registry.insert_method(
                    parse_schema(&function_schema_text(op.base, arity))?,
                    op.kind,
                    op.metadata,
                )?;
            }
            if op.has_inplace {
                registry.insert_inplace(
                    parse_schema(&inplace_schema_text(op.base, arity))?,
                    op.kind,
                    op.metadata,
                )?;
            }
            if op.has_out {
                registry.insert_out(
                    parse_schema(&out_schema_text(op.base, arity))?,
                    op.kind,
                    op.metadata,
                )?;
            }
        }
        Ok(registry)
    }

    fn insert_function(
        &mut self,
        schema: OpSchema,
        kind: OpKind,
        metadata: OpMetadata,
    ) -> Result<(), SchemaError> {
        let key = schema.base.clone();
        if self
            .functions
            .insert(
                key.clone(),
                SchemaEntry {
                    schema,
                    kind,
                    metadata,
                },
            )
            .is_some()
        {
            return Err(SchemaError::DuplicateEntry {
                table: "function",
                key,
            });
        }
        Ok(())
    }

    fn insert_method(
        &mut self,
        schema: OpSchema,
        kind: OpKind,
        metadata: OpMetadata,
    ) -> Result<(), SchemaError> {
        let key = schema.base.clone();
        if self
            .methods
            .insert(
                key.clone(),
                SchemaEntry {
                    schema,
                    kind,
                    metadata,
                },
            )
            .is_some()
        {
            return Err(SchemaError::DuplicateEntry {
                table: "method",
                key,
            });
        }
        Ok(())
    }

    fn insert_inplace(
        &mut self,
        schema: OpSchema,
        kind: OpKind,
        metadata: OpMetadata,
    ) -> Result<(), SchemaError> {
        // Keyed by the base name so the four variant tables share keys.
        let key = schema.base.trim_end_matches('_').to_string();
        if self
            .inplace
            .insert(
                key.clone(),
                SchemaEntry {
                    schema,
                    kind,
                    metadata,
                },
            )
            .is_some()
        {
            return Err(SchemaError::DuplicateEntry {
                table: "inplace",
                key,
            });
        }
        Ok(())
    }

    fn insert_out(
        &mut self,
        schema: OpSchema,
        kind: OpKind,
        metadata: OpMetadata,
    ) -> Result<(), SchemaError> {
        let key = schema.base.clone();
        if self
            .out_variants
            .insert(
                key.clone(),
                SchemaEntry {
                    schema,
                    kind,
                    metadata,
                },
            )
            .is_some()
        {
            return Err(SchemaError::DuplicateEntry {
                table: "out",
                key,
            });
        }
        Ok(())
    }

    pub fn resolve_function(&self, name: &str) -> Result<&SchemaEntry, DispatchError> {
        self.functions
            .get(name)
            .ok_or_else(|| DispatchError::UnknownFunction {
                name: name.to_string(),
            })
    }

    pub fn resolve_method(&self, name: &str) -> Result<&SchemaEntry, DispatchError> {
        self.methods
            .get(name)
            .ok_or_else(|| DispatchError::UnknownMethod {
                name: name.to_string(),
            })
    }

    /// In-place names carry the trailing underscore, e.g. `add_`.
    pub fn resolve_inplace(&self, name: &str) -> Result<&SchemaEntry, DispatchError> {
        let base = name
            .strip_suffix('_')
            .ok_or_else(|| DispatchError::UnknownInplace {
                name: name.to_string(),
            })?;
        self.inplace
            .get(base)
            .ok_or_else(|| DispatchError::UnknownInplace {
                name: name.to_string(),
            })
    }

    pub fn resolve_out(&self, name: &str) -> Result<&SchemaEntry, DispatchError> {
        self.out_variants
            .get(name)
            .ok_or_else(|| DispatchError::MissingOutVariant {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    #[must_use]
    pub fn has_inplace(&self, name: &str) -> bool {
        self.inplace.contains_key(name)
    }

    #[must_use]
    pub fn has_out(&self, name: &str) -> bool {
        self.out_variants.contains_key(name)
    }

    #[must_use]
    pub fn metadata(&self, base: &str) -> Option<OpMetadata> {
        self.functions.get(base).map(|entry| entry.metadata)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn function_entries(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.functions.values()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    UnsupportedDType {
        op: String,
        dtype: DType,
    },
    PromotionRequiresFloat {
        op: String,
        dtype: DType,
    },
    ArityMismatch {
        op: String,
        expected: usize,
        actual: usize,
    },
    MixedDTypes {
        lhs: DType,
        rhs: DType,
    },
    UnknownFunction {
        name: String,
    },
    UnknownMethod {
        name: String,
    },
    UnknownInplace {
        name: String,
    },
    MissingOutVariant {
        name: String,
    },
    Device(DeviceError),
    Kernel(KernelError),
    Schema(SchemaError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedDType { op, dtype } => {
                write!(f, "operator '{op}' does not support dtype {dtype:?}")
            }
            Self::PromotionRequiresFloat { op, dtype } => write!(
                f,
                "operator '{op}' promotes to float and cannot write the result into dtype {dtype:?}"
            ),
            Self::ArityMismatch {
                op,
                expected,
                actual,
            } => write!(
                f,
                "operator '{op}' expects {expected} tensor inputs, got {actual}"
            ),
            Self::MixedDTypes { lhs, rhs } => {
                write!(f, "mixed operand dtypes: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::UnknownFunction { name } => write!(f, "unknown function operator '{name}'"),
            Self::UnknownMethod { name } => write!(f, "unknown method operator '{name}'"),
            Self::UnknownInplace { name } => write!(f, "unknown in-place operator '{name}'"),
            Self::MissingOutVariant { name } => {
                write!(f, "operator '{name}' has no out variant")
            }
            Self::Device(inner) => write!(f, "device error: {inner}"),
            Self::Kernel(inner) => write!(f, "kernel error: {inner}"),
            Self::Schema(inner) => write!(f, "schema error: {inner}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<DeviceError> for DispatchError {
    fn from(inner: DeviceError) -> Self {
        Self::Device(inner)
    }
}

impl From<KernelError> for DispatchError {
    fn from(inner: KernelError) -> Self {
        Self::Kernel(inner)
    }
}

impl From<SchemaError> for DispatchError {
    fn from(inner: SchemaError) -> Self {
        Self::Schema(inner)
    }
}

impl DispatchError {
    #[must_use]
    pub fn is_unsupported_dtype(&self) -> bool {
        matches!(self, Self::UnsupportedDType { .. })
    }

    #[must_use]
    pub fn is_promotion_failure(&self) -> bool {
        matches!(self, Self::PromotionRequiresFloat { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
    pub op: &'static str,
    pub mode: ExecutionMode,
    pub requested_dtype: DType,
    pub kernel_dtype: DType,
    pub requested_device: Device,
    pub executed_device: Device,
    pub promotion_applied: bool,
    pub device_fallback_used: bool,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub value: DenseTensor,
    pub decision: DispatchDecision,
}

fn check_arity(kind: OpKind, inputs: &[&DenseTensor]) -> Result<(), DispatchError> {
    if inputs.len() != kind.arity() {
        return Err(DispatchError::ArityMismatch {
            op: kind.token().to_string(),
            expected: kind.arity(),
            actual: inputs.len(),
        });
    }
    Ok(())
}

fn check_operand_dtypes(kind: OpKind, inputs: &[&DenseTensor]) -> Result<DType, DispatchError> {
    let dtype = inputs[0].dtype();
    if let OpKind::Binary(_) = kind {
        let rhs = inputs[1].dtype();
        if rhs != dtype {
            return Err(DispatchError::MixedDTypes { lhs: dtype, rhs });
        }
        ensure_same_device(inputs[0], inputs[1])?;
    }
    Ok(dtype)
}

/// Resolves the device the kernel will run on. Strict mode fails closed on
/// devices without a backend; hardened mode falls back to CPU and flags the
/// decision.
fn resolve_device(
    requested: Device,
    mode: ExecutionMode,
) -> Result<(Device, bool), DispatchError> {
    match ensure_available(requested) {
        Ok(()) => Ok((requested, false)),
        Err(error) => match mode {
            ExecutionMode::Strict => Err(error.into()),
            ExecutionMode::Hardened => Ok((Device::Cpu, true)),
        },
    }
}

fn run_kernel(kind: OpKind, inputs: &[&DenseTensor]) -> Result<DenseTensor, DispatchError> {
    let value = match kind {
        OpKind::Binary(op) => binary_elementwise(op, inputs[0], inputs[1])?,
        OpKind::Unary(op) => unary_elementwise(op, inputs[0])?,
        OpKind::Sum => reduce_sum(inputs[0])?,
        OpKind::Cast(to) => cast(inputs[0], to)?,
    };
    Ok(value)
}

/// Functional dispatch: validates operands, applies integer-to-float
/// promotion when the operator's metadata allows it, and routes to the CPU
/// kernel table.
pub fn dispatch(
    kind: OpKind,
    inputs: &[&DenseTensor],
    promotes_integer_to_float: bool,
    mode: ExecutionMode,
) -> Result<DispatchOutcome, DispatchError> {
    check_arity(kind, inputs)?;
    let requested_dtype = check_operand_dtypes(kind, inputs)?;
    let requested_device = inputs[0].device();
    let (executed_device, device_fallback_used) = resolve_device(requested_device, mode)?;

    let wants_promotion =
        promotes_integer_to_float && requested_dtype.is_integer() && !matches!(kind, OpKind::Cast(_));

    if !wants_promotion && !kind.supports_dtype(requested_dtype) {
        return Err(DispatchError::UnsupportedDType {
            op: kind.token().to_string(),
            dtype: requested_dtype,
        });
    }

    let (value, kernel_dtype) = if wants_promotion {
        let kernel_dtype = requested_dtype.promote_to_float();
        let widened: Vec<DenseTensor> = inputs
            .iter()
            .map(|input| cast(input, kernel_dtype))
            .collect::<Result<_, _>>()?;
        let widened_refs: Vec<&DenseTensor> = widened.iter().collect();
        (run_kernel(kind, &widened_refs)?, kernel_dtype)
    } else {
        (run_kernel(kind, inputs)?, requested_dtype)
    };

    Ok(DispatchOutcome {
        value,
        decision: DispatchDecision {
            op: kind.token(),
            mode,
            requested_dtype,
            kernel_dtype,
            requested_device,
            executed_device,
            promotion_applied: wants_promotion,
            device_fallback_used,
        },
    })
}

/// Destination-writing dispatch used by the in-place and out= paths. The
/// promotion rule inverts here: an operator that would widen its result
/// cannot store into an integral destination and fails closed.
pub fn dispatch_into(
    kind: OpKind,
    inputs: &[&DenseTensor],
    dest: &DenseTensor,
    promotes_integer_to_float: bool,
    mode: ExecutionMode,
) -> Result<DispatchDecision, DispatchError> {
    check_arity(kind, inputs)?;
    let requested_dtype = check_operand_dtypes(kind, inputs)?;
    let requested_device = inputs[0].device();
    let (executed_device, device_fallback_used) = resolve_device(requested_device, mode)?;

    if promotes_integer_to_float && !requested_dtype.is_floating_point() {
        return Err(DispatchError::PromotionRequiresFloat {
            op: kind.token().to_string(),
            dtype: requested_dtype,
        });
    }
    if !kind.supports_dtype(requested_dtype) {
        return Err(DispatchError::UnsupportedDType {
            op: kind.token().to_string(),
            dtype: requested_dtype,
        });
    }

    match kind {
        OpKind::Binary(op) => binary_elementwise_into(op, inputs[0], inputs[1], dest)?,
        OpKind::Unary(op) => unary_elementwise_into(op, inputs[0], dest)?,
        OpKind::Sum | OpKind::Cast(_) => {
            return Err(DispatchError::MissingOutVariant {
                name: kind.token().to_string(),
            });
        }
    }

    Ok(DispatchDecision {
        op: kind.token(),
        mode,
        requested_dtype,
        kernel_dtype: requested_dtype,
        requested_device,
        executed_device,
        promotion_applied: false,
        device_fallback_used,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fo_core::{DType, DenseTensor, Device, ExecutionMode, TensorData};
    use fo_kernel_cpu::{BinaryKernelOp, UnaryKernelOp};
    use proptest::prelude::*;

    use super::{
        DispatchError, OpKind, SchemaRegistry, dispatch, dispatch_into, function_schema_text,
        inplace_schema_text, out_schema_text, parse_schema,
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

    fn build_packet_012_log(
        test_id: &str,
        scenario_id: &str,
        mode: &str,
        seed: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("ts_utc".to_string(), "1970-01-01T00:00:00Z".to_string());
        log.insert("suite_id".to_string(), "fo_dispatch_unit".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("packet_id".to_string(), "FO-OPS-012".to_string());
        log.insert(
            "fixture_id".to_string(),
            "fo_dispatch_packet_012".to_string(),
        );
        log.insert("scenario_id".to_string(), scenario_id.to_string());
        log.insert("mode".to_string(), mode.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert("input_digest".to_string(), format!("det64:{seed:016x}"));
        log.insert("output_digest".to_string(), format!("det64:{seed:016x}"));
        log.insert(
            "env_fingerprint".to_string(),
            "det64:fo-dispatch-test".to_string(),
        );
        log.insert(
            "artifact_refs".to_string(),
            "artifacts/conformance/FO-OPS-012/contract_table.md".to_string(),
        );
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p fo-dispatch {test_id} -- --nocapture"),
        );
        log.insert("duration_ms".to_string(), "0".to_string());
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_packet_012_log_contract(log: &BTreeMap<String, String>) {
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

    fn tensor_f64(values: &[f64]) -> DenseTensor {
        DenseTensor::from_values(
            TensorData::F64(values.to_vec()),
            vec![values.len()],
            Device::Cpu,
        )
        .expect("tensor build should succeed")
    }

    fn tensor_i32(values: &[i32]) -> DenseTensor {
        DenseTensor::from_values(
            TensorData::I32(values.to_vec()),
            vec![values.len()],
            Device::Cpu,
        )
        .expect("tensor build should succeed")
    }

    #[test]
    fn schema_parser_reads_alias_annotations() {
        let schema = parse_schema("fo::add_(Tensor(a!) self, Tensor other) -> Tensor(a!)")
            .expect("parse");
        assert_eq!(schema.base, "add_");
        assert!(schema.is_inplace());
        assert_eq!(schema.args.len(), 2);
        assert_eq!(schema.args[0].alias_set, Some('a'));
        assert!(schema.args[0].writes);
        assert_eq!(schema.args[1].alias_set, None);
        assert_eq!(schema.ret.alias_set, Some('a'));
        assert_eq!(
            schema.aliased_arg().map(|arg| arg.name.as_str()),
            Some("self")
        );

        let seed = det_seed(&[0x5c47, 1]);
        let log = build_packet_012_log(
            "schema_parser_reads_alias_annotations",
            "op_schema/strict:alias_annotation_parse",
            "strict",
            seed,
            "schema_alias_parse_ok",
        );
        assert_packet_012_log_contract(&log);
    }

    #[test]
    fn schema_parser_reads_out_overload() {
        let schema = parse_schema(
            "fo::add.out(Tensor self, Tensor other, *, Tensor(a!) out) -> Tensor(a!)",
        )
        .expect("parse");
        assert_eq!(schema.base, "add");
        assert_eq!(schema.overload.as_deref(), Some("out"));
        let out = schema.out_arg().expect("out arg");
        assert!(out.keyword_only);
        assert!(out.writes);
    }

    #[test]
    fn schema_parser_rejects_malformed_text() {
        assert!(parse_schema("fo::add(Tensor self -> Tensor").is_err());
        assert!(parse_schema("add(Tensor self) -> Tensor").is_err());
        assert!(parse_schema("fo::add(Tensor(ab!) self) -> Tensor").is_err());
        assert!(parse_schema("fo::add(Tensor self) -> Scalar").is_err());
    }

    #[test]
    fn builtin_registry_reflects_partial_coverage() {
        let registry = SchemaRegistry::builtin().expect("registry");

        assert!(registry.resolve_function("sigmoid").is_ok());
        assert!(matches!(
            registry.resolve_method("sigmoid").expect_err("no method"),
            DispatchError::UnknownMethod { .. }
        ));
        assert!(matches!(
            registry.resolve_inplace("log_").expect_err("no inplace"),
            DispatchError::UnknownInplace { .. }
        ));
        assert!(registry.resolve_inplace("sigmoid_").is_ok());
        assert!(!registry.has_out("sigmoid"));
        assert!(registry.has_out("add"));
        assert_eq!(registry.function_names().count(), 15);

        let div_meta = registry.metadata("div").expect("div metadata");
        assert!(div_meta.promotes_integer_to_float);
        let add_meta = registry.metadata("add").expect("add metadata");
        assert!(!add_meta.promotes_integer_to_float);
    }

    #[test]
    fn unsupported_dtype_fails_closed() {
        let flags = DenseTensor::from_values(
            TensorData::Bool(vec![true, false]),
            vec![2],
            Device::Cpu,
        )
        .expect("bool tensor");
        let err = dispatch(
            OpKind::Unary(UnaryKernelOp::Neg),
            &[&flags],
            false,
            ExecutionMode::Strict,
        )
        .expect_err("bool neg unsupported");
        assert!(err.is_unsupported_dtype());

        let err = dispatch(
            OpKind::Unary(UnaryKernelOp::Exp),
            &[&flags],
            true,
            ExecutionMode::Strict,
        )
        .expect_err("bool exp unsupported even though exp promotes ints");
        assert!(err.is_unsupported_dtype());
    }

    #[test]
    fn promotion_widens_functional_path() {
        let ints = tensor_i32(&[1, 4, 9]);
        let outcome = dispatch(
            OpKind::Unary(UnaryKernelOp::Sqrt),
            &[&ints],
            true,
            ExecutionMode::Strict,
        )
        .expect("promoted sqrt");
        assert_eq!(outcome.value.dtype(), DType::F32);
        assert!(outcome.decision.promotion_applied);
        assert_eq!(outcome.decision.requested_dtype, DType::I32);
        assert_eq!(outcome.decision.kernel_dtype, DType::F32);
        assert_eq!(
            outcome.value.values_f64().expect("values"),
            vec![1.0, 2.0, 3.0]
        );

        let seed = det_seed(&[outcome.value.fingerprint64()]);
        let log = build_packet_012_log(
            "promotion_widens_functional_path",
            "dispatch/strict:int_promotion_widens",
            "strict",
            seed,
            "promotion_decision_ok",
        );
        assert_packet_012_log_contract(&log);
    }

    #[test]
    fn promotion_refuses_integral_destination() {
        let ints = tensor_i32(&[1, 4, 9]);
        let err = dispatch_into(
            OpKind::Unary(UnaryKernelOp::Sqrt),
            &[&ints],
            &ints,
            true,
            ExecutionMode::Strict,
        )
        .expect_err("in-place promoting op on ints must fail");
        assert!(err.is_promotion_failure());

        // Hardened mode must not soften the promotion contract.
        let err = dispatch_into(
            OpKind::Unary(UnaryKernelOp::Sqrt),
            &[&ints],
            &ints,
            true,
            ExecutionMode::Hardened,
        )
        .expect_err("hardened keeps promotion fail-closed");
        assert!(err.is_promotion_failure());
    }

    #[test]
    fn non_promoting_inplace_on_ints_succeeds() {
        let lhs = tensor_i32(&[1, 2, 3]);
        let rhs = tensor_i32(&[10, 20, 30]);
        let decision = dispatch_into(
            OpKind::Binary(BinaryKernelOp::Add),
            &[&lhs, &rhs],
            &lhs,
            false,
            ExecutionMode::Strict,
        )
        .expect("int add_ should work");
        assert!(!decision.promotion_applied);
        assert_eq!(lhs.values_f64().expect("values"), vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn mixed_dtypes_fail_before_kernel_selection() {
        let lhs = tensor_f64(&[1.0]);
        let rhs = tensor_i32(&[1]);
        let err = dispatch(
            OpKind::Binary(BinaryKernelOp::Add),
            &[&lhs, &rhs],
            false,
            ExecutionMode::Strict,
        )
        .expect_err("mixed dtypes");
        assert!(matches!(
            err,
            DispatchError::MixedDTypes {
                lhs: DType::F64,
                rhs: DType::I32
            }
        ));
    }

    #[test]
    fn arity_mismatch_fails_closed() {
        let lone = tensor_f64(&[1.0]);
        let err = dispatch(
            OpKind::Binary(BinaryKernelOp::Mul),
            &[&lone],
            false,
            ExecutionMode::Strict,
        )
        .expect_err("missing rhs");
        assert!(matches!(
            err,
            DispatchError::ArityMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn sum_and_cast_have_no_out_route() {
        let input = tensor_f64(&[1.0, 2.0]);
        let dest = tensor_f64(&[0.0, 0.0]);
        assert!(matches!(
            dispatch_into(OpKind::Sum, &[&input], &dest, false, ExecutionMode::Strict)
                .expect_err("sum has no out"),
            DispatchError::MissingOutVariant { .. }
        ));
    }

    #[test]
    fn division_by_zero_survives_dispatch() {
        let lhs = tensor_f64(&[1.0]);
        let rhs = tensor_f64(&[0.0]);
        let outcome = dispatch(
            OpKind::Binary(BinaryKernelOp::Div),
            &[&lhs, &rhs],
            true,
            ExecutionMode::Strict,
        )
        .expect("ieee division");
        let values = outcome.value.values_f64().expect("values");
        assert!(values[0].is_infinite());
    }

    proptest! {
        #[test]
        fn prop_builtin_schema_texts_always_parse(
            op_index in 0usize..15,
            variant in 0u8..3
        ) {
            let registry = SchemaRegistry::builtin().expect("registry");
            let name = registry
                .function_names()
                .nth(op_index)
                .expect("op name")
                .to_string();
            let entry = registry.resolve_function(&name).expect("entry");
            let arity = entry.kind.arity();
            let text = match variant {
                0 => function_schema_text(&name, arity),
                1 => inplace_schema_text(&name, arity),
                _ => out_schema_text(&name, arity),
            };
            let schema = parse_schema(&text).expect("builtin text parses");
            prop_assert!(schema.qualified_name.starts_with("fo::"));
        }

        #[test]
        fn prop_dispatch_never_panics_over_dtype_grid(
            dtype_index in 0usize..5,
            promotes in proptest::bool::ANY
        ) {
            let dtype = [DType::F64, DType::F32, DType::I64, DType::I32, DType::Bool]
                [dtype_index];
            let tensor = DenseTensor::from_values(
                fo_core::TensorData::from_f64_values(dtype, &[1.0, 2.0]),
                vec![2],
                Device::Cpu,
            )
            .expect("tensor");
            let result = dispatch(
                OpKind::Unary(UnaryKernelOp::Sqrt),
                &[&tensor],
                promotes,
                ExecutionMode::Strict,
            );
            match result {
                Ok(outcome) => {
                    prop_assert!(outcome.value.dtype().is_floating_point());
                }
                Err(error) => {
                    prop_assert!(error.is_unsupported_dtype());
                }
            }
        }
    }
}
