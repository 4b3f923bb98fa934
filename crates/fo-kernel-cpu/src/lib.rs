#![forbid(unsafe_code)]

use std::fmt;

use fo_core::{DType, DTypeSet, DenseTensor, Device, TensorData, TensorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKernelOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryKernelOp {
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryKernelOp {
    Neg,
    Abs,
    Relu,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tanh,
    Sigmoid,
    Reciprocal,
    // Derivative masks. Piecewise constant, so their own gradient is zero;
    // the tape relies on that.
    SignMask,
    StepMask,
}

impl UnaryKernelOp {
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Relu => "relu",
            Self::Sqrt => "sqrt",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
            Self::Reciprocal => "reciprocal",
            Self::SignMask => "sign_mask",
            Self::StepMask => "step_mask",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelError {
    MissingKernel {
        op: &'static str,
        dtype: DType,
    },
    DTypeMismatch {
        lhs: DType,
        rhs: DType,
    },
    DeviceMismatch {
        lhs: Device,
        rhs: Device,
    },
    ShapeMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    NonWritableLayout {
        side: &'static str,
    },
    Tensor(TensorError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKernel { op, dtype } => {
                write!(f, "no cpu kernel registered for '{op}' with dtype {dtype:?}")
            }
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::NonWritableLayout { side } => {
                write!(f, "destination layout on {side} is not writable")
            }
            Self::Tensor(inner) => write!(f, "tensor error: {inner}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorError> for KernelError {
    fn from(inner: TensorError) -> Self {
        Self::Tensor(inner)
    }
}

/// Kernel-side registration table for binary ops. This is the behavioral
/// ground truth the dtype-support suite compares registry claims against.
#[must_use]
pub fn binary_kernel_dtypes(op: BinaryKernelOp) -> DTypeSet {
    match op {
        BinaryKernelOp::Add | BinaryKernelOp::Sub | BinaryKernelOp::Mul => {
            DTypeSet::floating_and_integral()
        }
        BinaryKernelOp::Div => DTypeSet::floating(),
    }
}

/// Kernel-side registration table for unary ops.
#[must_use]
pub fn unary_kernel_dtypes(op: UnaryKernelOp) -> DTypeSet {
    match op {
        UnaryKernelOp::Neg | UnaryKernelOp::Abs | UnaryKernelOp::Relu => {
            DTypeSet::floating_and_integral()
        }
        UnaryKernelOp::Sqrt
        | UnaryKernelOp::Exp
        | UnaryKernelOp::Log
        | UnaryKernelOp::Sin
        | UnaryKernelOp::Cos
        | UnaryKernelOp::Tanh
        | UnaryKernelOp::Sigmoid
        | UnaryKernelOp::Reciprocal
        | UnaryKernelOp::SignMask
        | UnaryKernelOp::StepMask => DTypeSet::floating(),
    }
}

#[must_use]
pub fn has_binary_kernel(op: BinaryKernelOp, dtype: DType) -> bool {
    binary_kernel_dtypes(op).contains(dtype)
}

#[must_use]
pub fn has_unary_kernel(op: UnaryKernelOp, dtype: DType) -> bool {
    unary_kernel_dtypes(op).contains(dtype)
}

fn binary_apply(op: BinaryKernelOp, lhs: f64, rhs: f64) -> f64 {
    match op {
        BinaryKernelOp::Add => lhs + rhs,
        BinaryKernelOp::Sub => lhs - rhs,
        BinaryKernelOp::Mul => lhs * rhs,
        BinaryKernelOp::Div => lhs / rhs,
    }
}

fn unary_apply(op: UnaryKernelOp, value: f64) -> f64 {
    match op {
        UnaryKernelOp::Neg => -value,
        UnaryKernelOp::Abs => value.abs(),
        UnaryKernelOp::Relu => {
            if value > 0.0 {
                value
            } else {
                0.0
            }
        }
        UnaryKernelOp::Sqrt => value.sqrt(),
        UnaryKernelOp::Exp => value.exp(),
        UnaryKernelOp::Log => value.ln(),
        UnaryKernelOp::Sin => value.sin(),
        UnaryKernelOp::Cos => value.cos(),
        UnaryKernelOp::Tanh => value.tanh(),
        UnaryKernelOp::Sigmoid => 1.0 / (1.0 + (-value).exp()),
        UnaryKernelOp::Reciprocal => 1.0 / value,
        UnaryKernelOp::SignMask => {
            if value > 0.0 {
                1.0
            } else if value < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        UnaryKernelOp::StepMask => {
            if value > 0.0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

fn ensure_pairwise_compatible(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), KernelError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(KernelError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }
    if lhs.device() != rhs.device() {
        return Err(KernelError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }
    if lhs.shape() != rhs.shape() {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }
    Ok(())
}

fn ensure_writable(dest: &DenseTensor, side: &'static str) -> Result<(), KernelError> {
    if !dest.meta().is_contiguous() {
        return Err(KernelError::NonWritableLayout { side });
    }
    Ok(())
}

/// Allocating binary elementwise kernel. Operands may be non-contiguous; the
/// output is always a fresh contiguous tensor of the operand dtype.
pub fn binary_elementwise(
    op: BinaryKernelOp,
    lhs: &DenseTensor,
    rhs: &DenseTensor,
) -> Result<DenseTensor, KernelError> {
    ensure_pairwise_compatible(lhs, rhs)?;
    if !has_binary_kernel(op, lhs.dtype()) {
        return Err(KernelError::MissingKernel {
            op: op.token(),
            dtype: lhs.dtype(),
        });
    }

    let lhs_values = lhs.values_f64()?;
    let rhs_values = rhs.values_f64()?;
    let out: Vec<f64> = lhs_values
        .iter()
        .zip(rhs_values.iter())
        .map(|(left, right)| binary_apply(op, *left, *right))
        .collect();

    Ok(DenseTensor::from_values(
        TensorData::from_f64_values(lhs.dtype(), &out),
        lhs.shape().to_vec(),
        lhs.device(),
    )?)
}

/// Binary elementwise kernel writing through an existing destination, used by
/// the in-place and out= paths. The destination must be contiguous and match
/// the operand shape and dtype.
pub fn binary_elementwise_into(
    op: BinaryKernelOp,
    lhs: &DenseTensor,
    rhs: &DenseTensor,
    dest: &DenseTensor,
) -> Result<(), KernelError> {
    ensure_pairwise_compatible(lhs, rhs)?;
    if !has_binary_kernel(op, lhs.dtype()) {
        return Err(KernelError::MissingKernel {
            op: op.token(),
            dtype: lhs.dtype(),
        });
    }
    if dest.dtype() != lhs.dtype() {
        return Err(KernelError::DTypeMismatch {
            lhs: dest.dtype(),
            rhs: lhs.dtype(),
        });
    }
    if dest.shape() != lhs.shape() {
        return Err(KernelError::ShapeMismatch {
            lhs: dest.shape().to_vec(),
            rhs: lhs.shape().to_vec(),
        });
    }
    ensure_writable(dest, "dest")?;

    let lhs_values = lhs.values_f64()?;
    let rhs_values = rhs.values_f64()?;
    for (flat, (left, right)) in lhs_values.iter().zip(rhs_values.iter()).enumerate() {
        dest.write_logical(flat, binary_apply(op, *left, *right))?;
    }
    Ok(())
}

/// Allocating unary elementwise kernel.
pub fn unary_elementwise(op: UnaryKernelOp, input: &DenseTensor) -> Result<DenseTensor, KernelError> {
    if !has_unary_kernel(op, input.dtype()) {
        return Err(KernelError::MissingKernel {
            op: op.token(),
            dtype: input.dtype(),
        });
    }

    let values = input.values_f64()?;
    let out: Vec<f64> = values.iter().map(|value| unary_apply(op, *value)).collect();

    Ok(DenseTensor::from_values(
        TensorData::from_f64_values(input.dtype(), &out),
        input.shape().to_vec(),
        input.device(),
    )?)
}

/// Unary elementwise kernel writing through an existing destination.
pub fn unary_elementwise_into(
    op: UnaryKernelOp,
    input: &DenseTensor,
    dest: &DenseTensor,
) -> Result<(), KernelError> {
    if !has_unary_kernel(op, input.dtype()) {
        return Err(KernelError::MissingKernel {
            op: op.token(),
            dtype: input.dtype(),
        });
    }
    if dest.dtype() != input.dtype() {
        return Err(KernelError::DTypeMismatch {
            lhs: dest.dtype(),
            rhs: input.dtype(),
        });
    }
    if dest.shape() != input.shape() {
        return Err(KernelError::ShapeMismatch {
            lhs: dest.shape().to_vec(),
            rhs: input.shape().to_vec(),
        });
    }
    ensure_writable(dest, "dest")?;

    let values = input.values_f64()?;
    for (flat, value) in values.iter().enumerate() {
        dest.write_logical(flat, unary_apply(op, *value))?;
    }
    Ok(())
}

/// Full reduction to a rank-0 tensor of the input dtype. Registered for
/// floating dtypes only; the harness reduces float losses before backward.
pub fn reduce_sum(input: &DenseTensor) -> Result<DenseTensor, KernelError> {
    if !input.dtype().is_floating_point() {
        return Err(KernelError::MissingKernel {
            op: "sum",
            dtype: input.dtype(),
        });
    }

    let total: f64 = input.values_f64()?.iter().sum();
    Ok(DenseTensor::from_values(
        TensorData::from_f64_values(input.dtype(), &[total]),
        Vec::new(),
        input.device(),
    )?)
}

/// Dtype conversion producing a fresh contiguous tensor. Used by the
/// integer-to-float promotion path in dispatch.
pub fn cast(input: &DenseTensor, to: DType) -> Result<DenseTensor, KernelError> {
    let values = input.values_f64()?;
    Ok(DenseTensor::from_values(
        TensorData::from_f64_values(to, &values),
        input.shape().to_vec(),
        input.device(),
    )?)
}
