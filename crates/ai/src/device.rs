use candle_core::{utils, DType, Device};
use std::{fmt, sync::Mutex};
use tracing::warn;

/// Compute device a caption model is placed on.
///
/// [`ComputeDevice::detect`] picks the first available in priority order:
/// CUDA, then Metal, then the local CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cuda,
    Metal,
    Cpu,
}

impl ComputeDevice {
    pub fn detect() -> Self {
        if utils::cuda_is_available() && Device::new_cuda(0).is_ok() {
            Self::Cuda
        } else if utils::metal_is_available() && Device::new_metal(0).is_ok() {
            Self::Metal
        } else {
            Self::Cpu
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }

    pub fn to_candle(&self) -> candle_core::Result<Device> {
        match self {
            Self::Cuda => Device::new_cuda(0),
            Self::Metal => Device::new_metal(0),
            Self::Cpu => Ok(Device::Cpu),
        }
    }

    /// Half precision on accelerators, full precision on the CPU.
    pub fn preferred_dtype(&self) -> DType {
        if self.is_accelerator() {
            DType::F16
        } else {
            DType::F32
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

/// Shares one candle device per [`ComputeDevice`] so input tensors and model
/// weights live on the same device instance.
#[derive(Default)]
pub(crate) struct CandleDevices {
    devices: Mutex<Vec<(ComputeDevice, Device)>>,
}

impl CandleDevices {
    pub fn get(&self, device: &ComputeDevice) -> candle_core::Result<Device> {
        let mut devices = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((_, candle_device)) = devices.iter().find(|(d, _)| d == device) {
            return Ok(candle_device.clone());
        }
        let candle_device = device.to_candle()?;
        devices.push((*device, candle_device.clone()));
        Ok(candle_device)
    }

    /// The device handed out earlier, without creating one.
    pub fn cached(&self, device: &ComputeDevice) -> Option<Device> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|(d, _)| d == device)
            .map(|(_, candle_device)| candle_device.clone())
    }

    /// Waits for queued kernels on `device` so the buffers of dropped weights
    /// are returned before the next load.
    pub fn synchronize(&self, device: &ComputeDevice) {
        if let Some(candle_device) = self.cached(device) {
            if let Err(e) = candle_device.synchronize() {
                warn!("failed to synchronize {}: {}", device, e);
            }
        }
    }
}

#[test]
fn test_candle_devices_are_shared() {
    let devices = CandleDevices::default();
    assert!(devices.cached(&ComputeDevice::Cpu).is_none());
    // nothing to wait for yet
    devices.synchronize(&ComputeDevice::Cpu);

    let first = devices.get(&ComputeDevice::Cpu).expect("cpu");
    let second = devices.get(&ComputeDevice::Cpu).expect("cpu");
    assert!(first.same_device(&second));
    assert!(devices
        .cached(&ComputeDevice::Cpu)
        .is_some_and(|cached| cached.same_device(&first)));
    assert_eq!(devices.devices.lock().expect("lock").len(), 1);
    devices.synchronize(&ComputeDevice::Cpu);
}

#[test]
fn test_cpu_device() {
    let device = ComputeDevice::Cpu;
    assert!(!device.is_accelerator());
    assert_eq!(device.preferred_dtype(), DType::F32);
    assert!(device.to_candle().expect("cpu device").is_cpu());
    assert_eq!(device.to_string(), "cpu");
}

#[test]
fn test_detect_without_accelerator_features() {
    if !utils::cuda_is_available() && !utils::metal_is_available() {
        assert_eq!(ComputeDevice::detect(), ComputeDevice::Cpu);
    }
}
