//! Compute device selection.

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::{info, warn};

use crate::error::{DynamicsError, DynamicsResult};

/// Resolve a device spec to a usable candle [`Device`].
///
/// `None`, `""` and `"auto"` pick the best available accelerator (CUDA, then Metal)
/// and fall back to the CPU. Explicit specs are `cpu`, `cuda`, `cuda:N`, `metal`
/// and `metal:N`; they fail if the device cannot be opened on this host.
pub fn select_device(spec: Option<&str>) -> DynamicsResult<Device> {
    let spec = spec.map(|s| s.trim().to_ascii_lowercase());
    let device = match spec.as_deref() {
        None | Some("") | Some("auto") => best_available(),
        Some("cpu") => Device::Cpu,
        Some(other) => {
            let (kind, ordinal) = parse_accelerator(other)?;
            let opened = match kind {
                Accelerator::Cuda => Device::new_cuda(ordinal),
                Accelerator::Metal => Device::new_metal(ordinal),
            };
            opened.map_err(|e| DynamicsError::invalid_device(format!("{other}: {e}")))?
        }
    };
    info!(device = ?device, "selected compute device");
    Ok(device)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accelerator {
    Cuda,
    Metal,
}

fn parse_accelerator(spec: &str) -> DynamicsResult<(Accelerator, usize)> {
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal.parse().map_err(|_| {
                DynamicsError::invalid_device(format!("bad device ordinal in {spec:?}"))
            })?;
            (kind, ordinal)
        }
        None => (spec, 0),
    };
    let kind = match kind {
        "cuda" => Accelerator::Cuda,
        "metal" => Accelerator::Metal,
        _ => return Err(DynamicsError::invalid_device(format!("unknown device {spec:?}"))),
    };
    Ok((kind, ordinal))
}

fn best_available() -> Device {
    if cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(d) => return d,
            Err(e) => warn!("CUDA not available: {e}"),
        }
    }
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(d) => return d,
            Err(e) => warn!("Metal not available: {e}"),
        }
    }
    Device::Cpu
}
