use anyhow::{Context, Result};
use candle_core::Device;
use log::{info, warn};

use crate::config::DevicePreference;

/// Picks the candle device, falling back to the CPU when `Auto` finds no
/// accelerator.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0).context("CUDA device unavailable")?,
        DevicePreference::Metal => Device::new_metal(0).context("Metal device unavailable")?,
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0).context("CUDA device unavailable")?
            } else if candle_core::utils::metal_is_available() {
                match Device::new_metal(0) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!("Metal device failed ({e}), falling back to CPU");
                        Device::Cpu
                    }
                }
            } else {
                Device::Cpu
            }
        }
    };
    info!("Using device {}", describe(&device));
    Ok(device)
}

pub fn describe(device: &Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(_) => "cuda:0".to_string(),
        Device::Metal(_) => "metal:0".to_string(),
    }
}
