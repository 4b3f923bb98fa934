#![forbid(unsafe_code)]

use std::fmt;

use fo_core::{DType, DTypeSet, DenseTensor, Device, TensorData, TensorError};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Function,
    Method,
    Inplace,
}

impl Variant {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Inplace => "inplace",
        }
    }
}

/// A concrete way to invoke an operator against the session: the variant
/// plus the name the session resolves (`add`, `add` as method, `add_`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantCall {
    pub variant: Variant,
    pub name: String,
}

/// Declares a combination the suites must record as a skip instead of
/// running. Empty fields match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRule {
    pub variant: Option<Variant>,
    pub dtype: Option<DType>,
    pub device: Option<Device>,
    pub reason: &'static str,
}

impl SkipRule {
    #[must_use]
    pub fn matches(&self, variant: Variant, dtype: DType, device: Device) -> bool {
        self.variant.is_none_or(|v| v == variant)
            && self.dtype.is_none_or(|d| d == dtype)
            && self.device.is_none_or(|d| d == device)
    }
}

/// Value range a generated sample draws from. Ranges sit away from
/// non-differentiable points and singularities so gradient checks stay
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDomain {
    /// Uniform in [-2, 2].
    Symmetric,
    /// Uniform in [1, 2]; used where zero or negatives are out of domain.
    PositiveUnit,
    /// Magnitude in [0.1, 2] with a random sign; avoids the kink at zero.
    OffsetFromZero,
}

#[derive(Debug, Clone)]
pub struct SampleInput {
    pub label: &'static str,
    pub input: DenseTensor,
    pub args: Vec<DenseTensor>,
    pub requires_grad: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpInfoError {
    RequiresGradNeedsFloat { op: &'static str, dtype: DType },
    Tensor(TensorError),
}

impl fmt::Display for OpInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequiresGradNeedsFloat { op, dtype } => write!(
                f,
                "samples for `{op}` cannot require grad at non-floating dtype {dtype:?}"
            ),
            Self::Tensor(error) => write!(f, "sample construction failed: {error}"),
        }
    }
}

impl std::error::Error for OpInfoError {}

impl From<TensorError> for OpInfoError {
    fn from(inner: TensorError) -> Self {
        Self::Tensor(inner)
    }
}

/// One registry entry. Claims here are what the conformance suites hold the
/// dispatcher to; a wrong claim is a suite failure, not a registry update.
#[derive(Debug, Clone)]
pub struct OpInfo {
    pub name: &'static str,
    pub arity: usize,
    pub has_method: bool,
    pub has_inplace: bool,
    pub supports_out: bool,
    pub promotes_integers_to_float: bool,
    pub test_inplace_grad: bool,
    pub dtypes_cpu: DTypeSet,
    pub dtypes_cuda: DTypeSet,
    pub sample_domain: SampleDomain,
    pub partner_domain: SampleDomain,
    pub autodiff_nonfusible_nodes: Option<Vec<&'static str>>,
    pub autodiff_fusible_nodes: Option<Vec<&'static str>>,
    pub skips: Vec<SkipRule>,
}

impl OpInfo {
    #[must_use]
    pub fn supported_dtypes(&self, device: Device) -> DTypeSet {
        match device {
            Device::Cpu => self.dtypes_cpu,
            Device::Cuda => self.dtypes_cuda,
        }
    }

    #[must_use]
    pub fn supports_dtype(&self, dtype: DType, device: Device) -> bool {
        self.supported_dtypes(device).contains(dtype)
    }

    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.arity == 2
    }

    /// `None` when the registry deliberately lacks that variant; the suites
    /// must treat that as a skip, not a failure.
    #[must_use]
    pub fn variant(&self, variant: Variant) -> Option<VariantCall> {
        let available = match variant {
            Variant::Function => true,
            Variant::Method => self.has_method,
            Variant::Inplace => self.has_inplace,
        };
        if !available {
            return None;
        }
        let name = match variant {
            Variant::Function | Variant::Method => self.name.to_string(),
            Variant::Inplace => format!("{}_", self.name),
        };
        Some(VariantCall { variant, name })
    }

    #[must_use]
    pub fn variants(&self) -> Vec<VariantCall> {
        [Variant::Function, Variant::Method, Variant::Inplace]
            .into_iter()
            .filter_map(|variant| self.variant(variant))
            .collect()
    }

    /// Autodiff claims with the registry defaults filled in: a
    /// differentiable op with no explicit claim is one nonfusible node
    /// named after itself.
    #[must_use]
    pub fn default_autodiff_nodes(&self) -> (Vec<String>, Vec<String>) {
        let nonfusible = match &self.autodiff_nonfusible_nodes {
            Some(nodes) => nodes.iter().map(|n| (*n).to_string()).collect(),
            None => vec![format!("fo::{}", self.name)],
        };
        let fusible = match &self.autodiff_fusible_nodes {
            Some(nodes) => nodes.iter().map(|n| (*n).to_string()).collect(),
            None => Vec::new(),
        };
        (nonfusible, fusible)
    }

    #[must_use]
    pub fn skip_for(&self, variant: Variant, dtype: DType, device: Device) -> Option<&SkipRule> {
        self.skips
            .iter()
            .find(|rule| rule.matches(variant, dtype, device))
    }

    /// Deterministic samples for one invocation shape set: a contiguous
    /// `[2, 3]` tensor and a rank-0 scalar, with a same-shape partner for
    /// binary operators. Bit-identical for equal `(op, device, dtype, seed)`.
    pub fn sample_inputs(
        &self,
        device: Device,
        dtype: DType,
        requires_grad: bool,
        seed: u64,
    ) -> Result<Vec<SampleInput>, OpInfoError> {
        if requires_grad && !dtype.is_floating_point() {
            return Err(OpInfoError::RequiresGradNeedsFloat {
                op: self.name,
                dtype,
            });
        }
        let mut rng = StdRng::seed_from_u64(sample_stream_seed(self.name, device, dtype, seed));
        let mut samples = Vec::with_capacity(2);
        for (label, shape) in [("contiguous_2x3", vec![2usize, 3]), ("scalar", Vec::new())] {
            let input = draw_tensor(&mut rng, self.sample_domain, &shape, dtype, device)?;
            let args = if self.is_binary() {
                vec![draw_tensor(&mut rng, self.partner_domain, &shape, dtype, device)?]
            } else {
                Vec::new()
            };
            samples.push(SampleInput {
                label,
                input,
                args,
                requires_grad,
            });
        }
        Ok(samples)
    }
}

/// Folds the sample coordinates into one rng stream id. FNV-1a, so equal
/// coordinates always replay the same stream.
fn sample_stream_seed(op: &str, device: Device, dtype: DType, seed: u64) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut mix = |byte: u8| {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    };
    for byte in op.bytes() {
        mix(byte);
    }
    mix(device as u8);
    mix(dtype as u8);
    for byte in seed.to_le_bytes() {
        mix(byte);
    }
    hash
}

fn draw_value(rng: &mut StdRng, domain: SampleDomain) -> f64 {
    match domain {
        SampleDomain::Symmetric => rng.random_range(-2.0..2.0),
        SampleDomain::PositiveUnit => rng.random_range(1.0..2.0),
        SampleDomain::OffsetFromZero => {
            let magnitude = rng.random_range(0.1..2.0);
            if rng.random_range(0..2) == 1 {
                magnitude
            } else {
                -magnitude
            }
        }
    }
}

fn draw_tensor(
    rng: &mut StdRng,
    domain: SampleDomain,
    shape: &[usize],
    dtype: DType,
    device: Device,
) -> Result<DenseTensor, OpInfoError> {
    let numel: usize = shape.iter().product();
    let values: Vec<f64> = (0..numel).map(|_| draw_value(rng, domain)).collect();
    let data = TensorData::from_f64_values(dtype, &values);
    Ok(DenseTensor::from_values(data, shape.to_vec(), device)?)
}

fn pointwise(name: &'static str, arity: usize, domain: SampleDomain) -> OpInfo {
    OpInfo {
        name,
        arity,
        has_method: true,
        has_inplace: true,
        supports_out: true,
        promotes_integers_to_float: false,
        test_inplace_grad: true,
        dtypes_cpu: DTypeSet::floating_and_integral(),
        dtypes_cuda: DTypeSet::floating_and_integral(),
        sample_domain: domain,
        partner_domain: SampleDomain::Symmetric,
        autodiff_nonfusible_nodes: None,
        autodiff_fusible_nodes: None,
        skips: Vec::new(),
    }
}

fn fusible_unary(name: &'static str, domain: SampleDomain, node: &'static str) -> OpInfo {
    OpInfo {
        promotes_integers_to_float: true,
        autodiff_nonfusible_nodes: Some(Vec::new()),
        autodiff_fusible_nodes: Some(vec![node]),
        ..pointwise(name, 1, domain)
    }
}

static OP_DB: Lazy<Vec<OpInfo>> = Lazy::new(|| {
    vec![
        pointwise("add", 2, SampleDomain::Symmetric),
        pointwise("sub", 2, SampleDomain::Symmetric),
        pointwise("mul", 2, SampleDomain::Symmetric),
        OpInfo {
            promotes_integers_to_float: true,
            // Denominators stay away from zero.
            partner_domain: SampleDomain::PositiveUnit,
            ..pointwise("div", 2, SampleDomain::Symmetric)
        },
        pointwise("neg", 1, SampleDomain::Symmetric),
        pointwise("abs", 1, SampleDomain::OffsetFromZero),
        pointwise("relu", 1, SampleDomain::OffsetFromZero),
        fusible_unary("sqrt", SampleDomain::PositiveUnit, "fo::sqrt"),
        fusible_unary("exp", SampleDomain::Symmetric, "fo::exp"),
        OpInfo {
            has_inplace: false,
            ..fusible_unary("log", SampleDomain::PositiveUnit, "fo::log")
        },
        fusible_unary("sin", SampleDomain::Symmetric, "fo::sin"),
        fusible_unary("cos", SampleDomain::Symmetric, "fo::cos"),
        fusible_unary("tanh", SampleDomain::Symmetric, "fo::tanh"),
        OpInfo {
            has_method: false,
            supports_out: false,
            ..fusible_unary("sigmoid", SampleDomain::Symmetric, "fo::sigmoid")
        },
        fusible_unary("reciprocal", SampleDomain::PositiveUnit, "fo::reciprocal"),
    ]
});

/// The operator registry the suites iterate. Entries are ordered by
/// registration, not alphabetically.
#[must_use]
pub fn op_db() -> &'static [OpInfo] {
    &OP_DB
}

#[must_use]
pub fn find_op(name: &str) -> Option<&'static OpInfo> {
    op_db().iter().find(|op| op.name == name)
}
