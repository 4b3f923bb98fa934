#![forbid(unsafe_code)]

use std::fmt;

use fo_core::{DenseTensor, Device};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    Mismatch { expected: Device, actual: Device },
    Unavailable { device: Device },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::Unavailable { device } => {
                write!(f, "device {device:?} has no runtime backend")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Devices the suites can actually execute on. CUDA claims stay in the
/// registry metadata; until a CUDA runtime exists, cases targeting it are
/// recorded as skips.
#[must_use]
pub fn available_devices() -> &'static [Device] {
    &[Device::Cpu]
}

#[must_use]
pub fn is_available(device: Device) -> bool {
    available_devices().contains(&device)
}

pub fn ensure_available(device: Device) -> Result<(), DeviceError> {
    if !is_available(device) {
        return Err(DeviceError::Unavailable { device });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ensure_tensor_device(&self, tensor: &DenseTensor) -> Result<(), DeviceError> {
        let actual = tensor.device();
        if actual != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual,
            });
        }
        Ok(())
    }
}

pub fn ensure_same_device(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<Device, DeviceError> {
    let lhs_device = lhs.device();
    let rhs_device = rhs.device();
    if lhs_device != rhs_device {
        return Err(DeviceError::Mismatch {
            expected: lhs_device,
            actual: rhs_device,
        });
    }
    Ok(lhs_device)
}
