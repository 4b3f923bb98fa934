#![forbid(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F64,
    F32,
    I64,
    I32,
    Bool,
}

impl DType {
    #[must_use]
    pub fn is_floating_point(self) -> bool {
        matches!(self, Self::F64 | Self::F32)
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(self, Self::I64 | Self::I32)
    }

    /// Widening target for integer-to-float promotion. Matches the
    /// default-float rule: integral and boolean inputs widen to F32.
    #[must_use]
    pub fn promote_to_float(self) -> Self {
        if self.is_floating_point() {
            self
        } else {
            Self::F32
        }
    }

    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::I64 => "i64",
            Self::I32 => "i32",
            Self::Bool => "bool",
        }
    }

    #[must_use]
    pub fn parse_token(token: &str) -> Option<Self> {
        match token {
            "f64" => Some(Self::F64),
            "f32" => Some(Self::F32),
            "i64" => Some(Self::I64),
            "i32" => Some(Self::I32),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }

    const ALL: [Self; 5] = [Self::F64, Self::F32, Self::I64, Self::I32, Self::Bool];

    const fn mask(self) -> u8 {
        match self {
            Self::F64 => 1,
            Self::F32 => 1 << 1,
            Self::I64 => 1 << 2,
            Self::I32 => 1 << 3,
            Self::Bool => 1 << 4,
        }
    }
}

/// Bit-mask set of dtypes, used for support claims in dispatch tables and the
/// operator registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DTypeSet {
    bits: u8,
}

impl DTypeSet {
    pub const EMPTY: Self = Self { bits: 0 };

    #[must_use]
    pub const fn with(self, dtype: DType) -> Self {
        Self {
            bits: self.bits | dtype.mask(),
        }
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[must_use]
    pub const fn contains(self, dtype: DType) -> bool {
        self.bits & dtype.mask() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    #[must_use]
    pub fn count(self) -> usize {
        self.bits.count_ones() as usize
    }

    #[must_use]
    pub const fn all() -> Self {
        Self::EMPTY
            .with(DType::F64)
            .with(DType::F32)
            .with(DType::I64)
            .with(DType::I32)
            .with(DType::Bool)
    }

    #[must_use]
    pub const fn floating() -> Self {
        Self::EMPTY.with(DType::F64).with(DType::F32)
    }

    #[must_use]
    pub const fn floating_and_integral() -> Self {
        Self::floating().with(DType::I64).with(DType::I32)
    }

    pub fn iter(self) -> impl Iterator<Item = DType> {
        DType::ALL
            .into_iter()
            .filter(move |dtype| self.contains(*dtype))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }

    #[must_use]
    pub fn parse_token(token: &str) -> Option<Self> {
        match token {
            "cpu" => Some(Self::Cpu),
            "cuda" => Some(Self::Cuda),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    let mut running = 1usize;
    for (slot, size) in strides.iter_mut().zip(shape.iter().copied()).rev() {
        *slot = running;
        running = running.saturating_mul(size.max(1));
    }
    strides
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar(dtype: DType, device: Device) -> Self {
        Self {
            shape: Vec::new(),
            strides: Vec::new(),
            storage_offset: 0,
            dtype,
            device,
        }
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            storage_offset: 0,
            dtype,
            device,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            storage_offset,
            dtype,
            device,
        };
        meta.validate()?;
        Ok(meta)
    }

    #[must_use]
    pub fn with_storage_offset(mut self, storage_offset: usize) -> Self {
        self.storage_offset = storage_offset;
        self
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }

        let mut max_linear_offset = 0usize;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            if size == 0 {
                continue;
            }

            let span = stride
                .checked_mul(size.saturating_sub(1))
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset.checked_add(span).ok_or(
                TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset,
                },
            )?;
        }

        let _ = self.storage_offset.checked_add(max_linear_offset).ok_or(
            TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset,
            },
        )?;

        Ok(())
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            return 1;
        }
        self.shape.iter().copied().product()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Singleton dimensions are contiguous regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, TensorMetaError> {
        if index.len() != self.shape.len() {
            return Err(TensorMetaError::IndexRankMismatch {
                expected: self.shape.len(),
                actual: index.len(),
            });
        }

        let mut linear = self.storage_offset;
        for (dim, ((idx, dim_size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= dim_size {
                return Err(TensorMetaError::IndexOutOfBounds {
                    dim,
                    index: idx,
                    size: dim_size,
                });
            }

            let step = idx
                .checked_mul(stride)
                .ok_or(TensorMetaError::StrideOverflow { size: idx, stride })?;
            linear = linear
                .checked_add(step)
                .ok_or(TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset: step,
                })?;
        }

        Ok(linear)
    }

    /// Minimum storage length needed to address every element of this layout.
    pub fn required_storage_len(&self) -> Result<usize, TensorMetaError> {
        self.validate()?;
        if self.numel() == 0 {
            return Ok(0);
        }

        let mut last = self.storage_offset;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            if size == 0 {
                continue;
            }
            let span = stride
                .checked_mul(size - 1)
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            last = last
                .checked_add(span)
                .ok_or(TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset: span,
                })?;
        }
        last.checked_add(1)
            .ok_or(TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset: last,
            })
    }

    /// Storage indices in row-major logical order. The strided kernels walk
    /// this to support non-contiguous operands.
    pub fn storage_indices(&self) -> Result<Vec<usize>, TensorMetaError> {
        self.validate()?;
        let numel = self.numel();
        if numel == 0 {
            return Ok(Vec::new());
        }
        if self.shape.is_empty() {
            return Ok(vec![self.storage_offset]);
        }

        let rank = self.shape.len();
        let mut out = Vec::with_capacity(numel);
        let mut index = vec![0usize; rank];
        'outer: loop {
            out.push(self.storage_index_for(&index)?);
            for dim in (0..rank).rev() {
                index[dim] += 1;
                if index[dim] < self.shape[dim] {
                    continue 'outer;
                }
                index[dim] = 0;
            }
            break;
        }
        Ok(out)
    }

    pub fn unravel(&self, flat: usize) -> Result<Vec<usize>, TensorMetaError> {
        let numel = self.numel();
        if flat >= numel {
            return Err(TensorMetaError::IndexOutOfBounds {
                dim: 0,
                index: flat,
                size: numel,
            });
        }
        let mut index = vec![0usize; self.shape.len()];
        let mut rest = flat;
        for dim in (0..self.shape.len()).rev() {
            let size = self.shape[dim].max(1);
            index[dim] = rest % size;
            rest /= size;
        }
        Ok(index)
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.shape.hash(&mut hasher);
        self.strides.hash(&mut hasher);
        self.storage_offset.hash(&mut hasher);
        self.dtype.hash(&mut hasher);
        self.device.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    StorageOffsetOverflow {
        storage_offset: usize,
        max_linear_offset: usize,
    },
    IndexRankMismatch {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            } => write!(
                f,
                "storage offset overflow for storage_offset={storage_offset}, max_linear_offset={max_linear_offset}"
            ),
            Self::IndexRankMismatch { expected, actual } => {
                write!(
                    f,
                    "index rank mismatch expected={expected}, actual={actual}"
                )
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(
                    f,
                    "index out of bounds at dim={dim}: index={index}, size={size}"
                )
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F64(Vec<f64>),
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
}

impl TensorData {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F64(_) => DType::F64,
            Self::F32(_) => DType::F32,
            Self::I64(_) => DType::I64,
            Self::I32(_) => DType::I32,
            Self::Bool(_) => DType::Bool,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F64(values) => values.len(),
            Self::F32(values) => values.len(),
            Self::I64(values) => values.len(),
            Self::I32(values) => values.len(),
            Self::Bool(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F64 => Self::F64(vec![0.0; len]),
            DType::F32 => Self::F32(vec![0.0; len]),
            DType::I64 => Self::I64(vec![0; len]),
            DType::I32 => Self::I32(vec![0; len]),
            DType::Bool => Self::Bool(vec![false; len]),
        }
    }

    /// Builds typed storage from f64 source values, truncating toward zero
    /// for integral dtypes. Sample-input generation and casts go through
    /// here.
    #[must_use]
    pub fn from_f64_values(dtype: DType, values: &[f64]) -> Self {
        match dtype {
            DType::F64 => Self::F64(values.to_vec()),
            DType::F32 => Self::F32(values.iter().map(|v| *v as f32).collect()),
            DType::I64 => Self::I64(values.iter().map(|v| *v as i64).collect()),
            DType::I32 => Self::I32(values.iter().map(|v| *v as i32).collect()),
            DType::Bool => Self::Bool(values.iter().map(|v| *v != 0.0).collect()),
        }
    }

    #[must_use]
    pub fn read_f64(&self, index: usize) -> Option<f64> {
        match self {
            Self::F64(values) => values.get(index).copied(),
            Self::F32(values) => values.get(index).copied().map(f64::from),
            Self::I64(values) => values.get(index).copied().map(|v| v as f64),
            Self::I32(values) => values.get(index).copied().map(f64::from),
            Self::Bool(values) => values.get(index).map(|v| if *v { 1.0 } else { 0.0 }),
        }
    }

    pub fn write_f64(&mut self, index: usize, value: f64) -> bool {
        match self {
            Self::F64(values) => values.get_mut(index).map(|slot| *slot = value).is_some(),
            Self::F32(values) => values
                .get_mut(index)
                .map(|slot| *slot = value as f32)
                .is_some(),
            Self::I64(values) => values
                .get_mut(index)
                .map(|slot| *slot = value as i64)
                .is_some(),
            Self::I32(values) => values
                .get_mut(index)
                .map(|slot| *slot = value as i32)
                .is_some(),
            Self::Bool(values) => values
                .get_mut(index)
                .map(|slot| *slot = value != 0.0)
                .is_some(),
        }
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        match self {
            Self::F64(values) => {
                for value in values {
                    value.to_bits().hash(&mut hasher);
                }
            }
            Self::F32(values) => {
                for value in values {
                    value.to_bits().hash(&mut hasher);
                }
            }
            Self::I64(values) => values.hash(&mut hasher),
            Self::I32(values) => values.hash(&mut hasher),
            Self::Bool(values) => values.hash(&mut hasher),
        }
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    Meta(TensorMetaError),
    ShapeDataMismatch {
        expected_numel: usize,
        data_len: usize,
    },
    StorageTooSmall {
        required: usize,
        actual: usize,
    },
    LogicalIndexOutOfRange {
        index: usize,
        numel: usize,
    },
    DTypeMismatch {
        expected: DType,
        actual: DType,
    },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta(inner) => write!(f, "tensor meta error: {inner}"),
            Self::ShapeDataMismatch {
                expected_numel,
                data_len,
            } => write!(
                f,
                "shape expects {expected_numel} elements but data holds {data_len}"
            ),
            Self::StorageTooSmall { required, actual } => {
                write!(f, "storage too small: required {required}, actual {actual}")
            }
            Self::LogicalIndexOutOfRange { index, numel } => {
                write!(f, "logical index {index} out of range for numel {numel}")
            }
            Self::DTypeMismatch { expected, actual } => {
                write!(f, "dtype mismatch: expected {expected:?}, got {actual:?}")
            }
        }
    }
}

impl std::error::Error for TensorError {}

impl From<TensorMetaError> for TensorError {
    fn from(inner: TensorMetaError) -> Self {
        Self::Meta(inner)
    }
}

/// Dense tensor with shared storage. Views produced by `alias_view` share the
/// storage cell, the storage id, and the version counter; in-place writes bump
/// the version for every alias.
#[derive(Debug, Clone)]
pub struct DenseTensor {
    id: u64,
    storage_id: u64,
    storage: Rc<RefCell<TensorData>>,
    version: Rc<Cell<u64>>,
    meta: TensorMeta,
}

impl DenseTensor {
    pub fn from_values(
        data: TensorData,
        shape: Vec<usize>,
        device: Device,
    ) -> Result<Self, TensorError> {
        let meta = TensorMeta::from_shape(shape, data.dtype(), device);
        if meta.numel() != data.len() {
            return Err(TensorError::ShapeDataMismatch {
                expected_numel: meta.numel(),
                data_len: data.len(),
            });
        }
        Ok(Self::fresh(meta, data))
    }

    pub fn from_meta_and_storage(meta: TensorMeta, data: TensorData) -> Result<Self, TensorError> {
        if data.dtype() != meta.dtype() {
            return Err(TensorError::DTypeMismatch {
                expected: meta.dtype(),
                actual: data.dtype(),
            });
        }
        let required = meta.required_storage_len()?;
        if data.len() < required {
            return Err(TensorError::StorageTooSmall {
                required,
                actual: data.len(),
            });
        }
        Ok(Self::fresh(meta, data))
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let meta = TensorMeta::from_shape(shape, dtype, device);
        let data = TensorData::zeros(dtype, meta.numel());
        Self::fresh(meta, data)
    }

    fn fresh(meta: TensorMeta, data: TensorData) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage_id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            storage: Rc::new(RefCell::new(data)),
            version: Rc::new(Cell::new(0)),
            meta,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn storage_id(&self) -> u64 {
        self.storage_id
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.meta.device()
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.meta.numel()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    pub fn bump_version(&self) {
        self.version.set(self.version.get() + 1);
    }

    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        self.storage_id == other.storage_id
    }

    /// Fresh storage, fresh ids, version zero. Gradient checks use this to
    /// build safe in-place variants.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        let data = self.storage.borrow().clone();
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage_id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            storage: Rc::new(RefCell::new(data)),
            version: Rc::new(Cell::new(0)),
            meta: self.meta.clone(),
        }
    }

    /// New view over the same storage under a different layout. The layout
    /// must fit inside the backing storage and keep the dtype.
    pub fn alias_view(&self, meta: TensorMeta) -> Result<Self, TensorError> {
        if meta.dtype() != self.meta.dtype() {
            return Err(TensorError::DTypeMismatch {
                expected: self.meta.dtype(),
                actual: meta.dtype(),
            });
        }
        let required = meta.required_storage_len()?;
        let actual = self.storage.borrow().len();
        if actual < required {
            return Err(TensorError::StorageTooSmall { required, actual });
        }
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage_id: self.storage_id,
            storage: Rc::clone(&self.storage),
            version: Rc::clone(&self.version),
            meta,
        })
    }

    pub fn read_logical(&self, flat: usize) -> Result<f64, TensorError> {
        let numel = self.meta.numel();
        if flat >= numel {
            return Err(TensorError::LogicalIndexOutOfRange { index: flat, numel });
        }
        let index = self.meta.unravel(flat)?;
        let storage_index = self.meta.storage_index_for(&index)?;
        self.storage
            .borrow()
            .read_f64(storage_index)
            .ok_or(TensorError::StorageTooSmall {
                required: storage_index + 1,
                actual: self.storage.borrow().len(),
            })
    }

    pub fn write_logical(&self, flat: usize, value: f64) -> Result<(), TensorError> {
        let numel = self.meta.numel();
        if flat >= numel {
            return Err(TensorError::LogicalIndexOutOfRange { index: flat, numel });
        }
        let index = self.meta.unravel(flat)?;
        let storage_index = self.meta.storage_index_for(&index)?;
        let written = self.storage.borrow_mut().write_f64(storage_index, value);
        if !written {
            return Err(TensorError::StorageTooSmall {
                required: storage_index + 1,
                actual: self.storage.borrow().len(),
            });
        }
        self.bump_version();
        Ok(())
    }

    /// Values in row-major logical order, widened to f64.
    pub fn values_f64(&self) -> Result<Vec<f64>, TensorError> {
        let storage = self.storage.borrow();
        let mut out = Vec::with_capacity(self.meta.numel());
        for storage_index in self.meta.storage_indices()? {
            let value =
                storage
                    .read_f64(storage_index)
                    .ok_or(TensorError::StorageTooSmall {
                        required: storage_index + 1,
                        actual: storage.len(),
                    })?;
            out.push(value);
        }
        Ok(out)
    }

    pub fn with_storage<R>(&self, f: impl FnOnce(&TensorData) -> R) -> R {
        f(&self.storage.borrow())
    }

    pub fn with_storage_mut<R>(&self, f: impl FnOnce(&mut TensorData) -> R) -> R {
        let result = f(&mut self.storage.borrow_mut());
        self.bump_version();
        result
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.meta.fingerprint64().hash(&mut hasher);
        self.storage.borrow().fingerprint64().hash(&mut hasher);
        hasher.finish()
    }
}

impl PartialEq for DenseTensor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::{
        DType, DTypeSet, DenseTensor, Device, TensorData, TensorError, TensorMeta,
        TensorMetaError, contiguous_strides,
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

    fn build_packet_010_log(
        test_id: &str,
        scenario_id: &str,
        mode: &str,
        seed: u64,
        input_digest: u64,
        output_digest: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("ts_utc".to_string(), "1970-01-01T00:00:00Z".to_string());
        log.insert("suite_id".to_string(), "fo_core_unit".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("packet_id".to_string(), "FO-OPS-010".to_string());
        log.insert("fixture_id".to_string(), "fo_core_packet_010".to_string());
        log.insert("scenario_id".to_string(), scenario_id.to_string());
        log.insert("mode".to_string(), mode.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "input_digest".to_string(),
            format!("det64:{input_digest:016x}"),
        );
        log.insert(
            "output_digest".to_string(),
            format!("det64:{output_digest:016x}"),
        );
        log.insert(
            "env_fingerprint".to_string(),
            "det64:fo-core-test".to_string(),
        );
        log.insert(
            "artifact_refs".to_string(),
            "artifacts/conformance/FO-OPS-010/contract_table.md".to_string(),
        );
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p fo-core {test_id} -- --nocapture"),
        );
        log.insert("duration_ms".to_string(), "0".to_string());
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_packet_010_log_contract(log: &BTreeMap<String, String>) {
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

    fn tensor_f64(values: &[f64], shape: &[usize]) -> DenseTensor {
        DenseTensor::from_values(
            TensorData::F64(values.to_vec()),
            shape.to_vec(),
            Device::Cpu,
        )
        .expect("tensor build should succeed")
    }

    #[test]
    fn contiguous_strides_are_row_major() {
        assert_eq!(contiguous_strides(&[2, 3]), vec![3, 1]);
        assert_eq!(contiguous_strides(&[4, 1, 2]), vec![2, 2, 1]);
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());

        let input_digest = det_seed(&[2, 3]);
        let output_digest = det_seed(&[3, 1]);
        let seed = det_seed(&[input_digest, output_digest, 3]);
        let log = build_packet_010_log(
            "contiguous_strides_are_row_major",
            "tensor_meta/strict:row_major_strides",
            "strict",
            seed,
            input_digest,
            output_digest,
            "row_major_stride_contract_ok",
        );
        assert_packet_010_log_contract(&log);
    }

    #[test]
    fn singleton_dimension_is_contiguous_with_any_stride() {
        let meta = TensorMeta::from_shape_and_strides(
            vec![1, 3],
            vec![99, 1],
            0,
            DType::F64,
            Device::Cpu,
        )
        .expect("meta should validate");
        assert!(meta.is_contiguous());
    }

    #[test]
    fn stride_two_layout_is_not_contiguous() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![3], vec![2], 0, DType::F64, Device::Cpu)
                .expect("meta should validate");
        assert!(!meta.is_contiguous());
        assert_eq!(meta.required_storage_len().expect("span"), 5);
        assert_eq!(meta.storage_indices().expect("indices"), vec![0, 2, 4]);
    }

    #[test]
    fn rank_mismatch_fails_closed() {
        let err = TensorMeta::from_shape_and_strides(
            vec![2, 2],
            vec![1],
            0,
            DType::F64,
            Device::Cpu,
        )
        .expect_err("rank mismatch must fail");
        assert!(matches!(
            err,
            TensorMetaError::RankStrideMismatch { rank: 2, strides: 1 }
        ));
    }

    #[test]
    fn storage_index_walk_matches_manual_layout() {
        let meta = TensorMeta::from_shape_and_strides(
            vec![2, 2],
            vec![1, 2],
            1,
            DType::F32,
            Device::Cpu,
        )
        .expect("transposed meta should validate");
        assert_eq!(meta.storage_index_for(&[0, 0]).expect("index"), 1);
        assert_eq!(meta.storage_index_for(&[0, 1]).expect("index"), 3);
        assert_eq!(meta.storage_index_for(&[1, 0]).expect("index"), 2);
        assert_eq!(meta.storage_indices().expect("walk"), vec![1, 3, 2, 4]);
    }

    #[test]
    fn dtype_set_claims_are_bit_exact() {
        let floats = DTypeSet::floating();
        assert!(floats.contains(DType::F64));
        assert!(floats.contains(DType::F32));
        assert!(!floats.contains(DType::I32));
        assert_eq!(floats.count(), 2);

        let wide = DTypeSet::floating_and_integral();
        assert_eq!(wide.count(), 4);
        assert!(!wide.contains(DType::Bool));
        assert_eq!(DTypeSet::all().count(), 5);

        let collected: Vec<DType> = wide.iter().collect();
        assert_eq!(
            collected,
            vec![DType::F64, DType::F32, DType::I64, DType::I32]
        );
    }

    #[test]
    fn promotion_targets_default_float() {
        assert_eq!(DType::I32.promote_to_float(), DType::F32);
        assert_eq!(DType::I64.promote_to_float(), DType::F32);
        assert_eq!(DType::Bool.promote_to_float(), DType::F32);
        assert_eq!(DType::F64.promote_to_float(), DType::F64);
    }

    #[test]
    fn dtype_tokens_round_trip() {
        for dtype in [DType::F64, DType::F32, DType::I64, DType::I32, DType::Bool] {
            assert_eq!(DType::parse_token(dtype.token()), Some(dtype));
        }
        assert_eq!(DType::parse_token("f16"), None);
    }

    #[test]
    fn dense_tensor_rejects_shape_data_mismatch() {
        let err = DenseTensor::from_values(
            TensorData::F64(vec![1.0, 2.0, 3.0]),
            vec![2, 2],
            Device::Cpu,
        )
        .expect_err("mismatched payload must fail");
        assert!(matches!(
            err,
            TensorError::ShapeDataMismatch {
                expected_numel: 4,
                data_len: 3
            }
        ));
    }

    #[test]
    fn logical_reads_follow_row_major_order() {
        let tensor = tensor_f64(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(tensor.read_logical(0).expect("read"), 1.0);
        assert_eq!(tensor.read_logical(4).expect("read"), 5.0);
        assert_eq!(
            tensor.values_f64().expect("values"),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );

        let err = tensor.read_logical(6).expect_err("out of range");
        assert!(matches!(
            err,
            TensorError::LogicalIndexOutOfRange { index: 6, numel: 6 }
        ));
    }

    #[test]
    fn writes_bump_version_for_every_alias() {
        let tensor = tensor_f64(&[1.0, 2.0, 3.0, 4.0], &[4]);
        let view_meta = TensorMeta::from_shape_and_strides(
            vec![2],
            vec![2],
            0,
            DType::F64,
            Device::Cpu,
        )
        .expect("view meta");
        let view = tensor.alias_view(view_meta).expect("alias view");

        assert!(tensor.shares_storage_with(&view));
        assert_eq!(tensor.version(), 0);
        assert_eq!(view.version(), 0);

        tensor.write_logical(2, 9.0).expect("write");
        assert_eq!(tensor.version(), 1);
        assert_eq!(view.version(), 1);
        assert_eq!(view.values_f64().expect("view values"), vec![1.0, 9.0]);
    }

    #[test]
    fn deep_clone_detaches_storage_and_version() {
        let tensor = tensor_f64(&[1.0, 2.0], &[2]);
        tensor.write_logical(0, 5.0).expect("write");
        let clone = tensor.deep_clone();

        assert!(!tensor.shares_storage_with(&clone));
        clone.write_logical(1, 7.0).expect("write clone");
        assert_eq!(tensor.values_f64().expect("orig"), vec![5.0, 2.0]);
        assert_eq!(clone.values_f64().expect("clone"), vec![5.0, 7.0]);
        assert_eq!(tensor.version(), 1);
    }

    #[test]
    fn alias_view_rejects_dtype_change_and_overrun() {
        let tensor = tensor_f64(&[1.0, 2.0, 3.0], &[3]);

        let wrong_dtype = TensorMeta::from_shape(vec![3], DType::F32, Device::Cpu);
        assert!(matches!(
            tensor.alias_view(wrong_dtype).expect_err("dtype must match"),
            TensorError::DTypeMismatch { .. }
        ));

        let overrun = TensorMeta::from_shape(vec![4], DType::F64, Device::Cpu);
        assert!(matches!(
            tensor.alias_view(overrun).expect_err("span must fit"),
            TensorError::StorageTooSmall {
                required: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn integral_storage_truncates_toward_zero() {
        let data = TensorData::from_f64_values(DType::I32, &[1.9, -1.9, 0.2]);
        assert_eq!(data.read_f64(0), Some(1.0));
        assert_eq!(data.read_f64(1), Some(-1.0));
        assert_eq!(data.read_f64(2), Some(0.0));

        let flags = TensorData::from_f64_values(DType::Bool, &[0.0, 2.0]);
        assert_eq!(flags.read_f64(0), Some(0.0));
        assert_eq!(flags.read_f64(1), Some(1.0));
    }

    #[test]
    fn rank_zero_scalar_has_one_element() {
        let tensor = DenseTensor::from_values(TensorData::F64(vec![42.0]), vec![], Device::Cpu)
            .expect("scalar build");
        assert_eq!(tensor.numel(), 1);
        assert_eq!(tensor.values_f64().expect("values"), vec![42.0]);

        let meta = TensorMeta::scalar(DType::F64, Device::Cpu);
        assert_eq!(meta.storage_indices().expect("indices"), vec![0]);
    }

    proptest! {
        #[test]
        fn prop_contiguous_meta_walks_sequentially(
            shape in proptest::collection::vec(1usize..5, 0..4)
        ) {
            let meta = TensorMeta::from_shape(shape, DType::F64, Device::Cpu);
            let indices = meta.storage_indices().expect("walk");
            let expected: Vec<usize> = (0..meta.numel()).collect();
            prop_assert_eq!(indices, expected);
        }

        #[test]
        fn prop_unravel_round_trips_flat_order(
            shape in proptest::collection::vec(1usize..5, 1..4),
            seed in 0u64..1_000
        ) {
            let meta = TensorMeta::from_shape(shape, DType::F64, Device::Cpu);
            let flat = (seed as usize) % meta.numel();
            let index = meta.unravel(flat).expect("unravel");
            let storage = meta.storage_index_for(&index).expect("index");
            prop_assert_eq!(storage, flat);
        }

        #[test]
        fn prop_required_len_covers_every_walked_index(
            shape in proptest::collection::vec(1usize..4, 1..4),
            offset in 0usize..3
        ) {
            let strides = contiguous_strides(&shape);
            let meta = TensorMeta::from_shape_and_strides(
                shape,
                strides,
                offset,
                DType::F32,
                Device::Cpu,
            )
            .expect("meta");
            let required = meta.required_storage_len().expect("span");
            for index in meta.storage_indices().expect("walk") {
                prop_assert!(index < required);
            }
        }

        #[test]
        fn prop_dtype_set_iter_matches_contains(bits in 0u8..32) {
            let mut set = DTypeSet::EMPTY;
            for dtype in [DType::F64, DType::F32, DType::I64, DType::I32, DType::Bool] {
                if bits & (1 << (dtype as u8)) != 0 {
                    set = set.with(dtype);
                }
            }
            let listed: Vec<DType> = set.iter().collect();
            for dtype in &listed {
                prop_assert!(set.contains(*dtype));
            }
            prop_assert_eq!(listed.len(), set.count());
        }
    }
}
