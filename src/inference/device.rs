use anyhow::{anyhow, Result};
use candle::{DType, Device};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Auto,
    Cpu,
    Cuda(usize),
}

/// Parses `auto`, `cpu`, `cuda`, `cuda:N` or `gpu:N`.
pub fn parse_device_spec(value: &str) -> DeviceSpec {
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.is_empty() || lower == "auto" {
        DeviceSpec::Auto
    } else if lower == "cpu" {
        DeviceSpec::Cpu
    } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
        let ordinal = trimmed
            .split(':')
            .nth(1)
            .and_then(|part| part.trim().parse::<usize>().ok())
            .unwrap_or(0);
        DeviceSpec::Cuda(ordinal)
    } else {
        warn!("unrecognized MODEL_DEVICE value '{}', defaulting to auto", trimmed);
        DeviceSpec::Auto
    }
}

pub fn select_device(value: &str) -> Result<Device> {
    match parse_device_spec(value) {
        DeviceSpec::Auto => Ok(Device::cuda_if_available(0)?),
        DeviceSpec::Cpu => Ok(Device::Cpu),
        DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
            anyhow!(
                "requested CUDA device {} but initialization failed: {err}. Build with the \
                 `cuda` feature and ensure CUDA libraries are available.",
                ordinal
            )
        }),
    }
}

/// Half precision on accelerators, full precision on the CPU.
pub fn weight_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}
