//! Small helpers over the OpenCL device and platform queries the
//! engine relies on for strategy selection.

use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::flags::{DeviceType, DEVICE_TYPE_ACCELERATOR, DEVICE_TYPE_CPU, DEVICE_TYPE_GPU};
use ocl::{Context, Device, Platform, Queue};

use crate::error::{Error, Result};

pub fn device_type(device: &Device) -> Result<DeviceType> {
    match device.info(DeviceInfo::Type)? {
        DeviceInfoResult::Type(t) => Ok(t),
        other => Err(Error::resource(format!(
            "unexpected device type info result: {:?}",
            other
        ))),
    }
}

pub fn is_cpu(device: &Device) -> Result<bool> {
    Ok(device_type(device)?.contains(DEVICE_TYPE_CPU))
}

/// CPU and accelerator devices prefer per-item contiguous ranges
/// (local stride); GPUs prefer global-stride loops.
pub fn prefers_local_stride(device: &Device) -> Result<bool> {
    let t = device_type(device)?;
    Ok(t.contains(DEVICE_TYPE_CPU) || t.contains(DEVICE_TYPE_ACCELERATOR))
}

pub fn is_gpu(device: &Device) -> Result<bool> {
    Ok(device_type(device)?.contains(DEVICE_TYPE_GPU))
}

pub fn global_mem_size(device: &Device) -> Result<u64> {
    match device.info(DeviceInfo::GlobalMemSize)? {
        DeviceInfoResult::GlobalMemSize(s) => Ok(s),
        other => Err(Error::resource(format!(
            "unexpected global memory info result: {:?}",
            other
        ))),
    }
}

pub fn local_mem_size(device: &Device) -> Result<u64> {
    match device.info(DeviceInfo::LocalMemSize)? {
        DeviceInfoResult::LocalMemSize(s) => Ok(s),
        other => Err(Error::resource(format!(
            "unexpected local memory info result: {:?}",
            other
        ))),
    }
}

/// Selects a platform and device pair by index, wrapping out-of-range
/// device indices the way the `ocl` crate does.
pub fn select_device(platform_idx: usize, device_idx: usize) -> Result<(Platform, Device)> {
    let platforms = Platform::list();
    let platform = platforms.get(platform_idx).cloned().ok_or_else(|| {
        Error::resource(format!(
            "platform index {} out of range ({} available)",
            platform_idx,
            platforms.len()
        ))
    })?;
    let devices = Device::list_all(platform)?;
    if devices.is_empty() {
        return Err(Error::resource(format!(
            "platform {} has no devices",
            platform_idx
        )));
    }
    // Out-of-range indices wrap, like the ocl device specifiers do.
    let device = devices[device_idx % devices.len()];
    Ok((platform, device))
}

/// Context plus profiling-enabled queue on the selected device.
pub fn context_and_queue(platform_idx: usize, device_idx: usize) -> Result<(Context, Queue)> {
    let (platform, device) = select_device(platform_idx, device_idx)?;
    let context = Context::builder()
        .platform(platform)
        .devices(device)
        .build()?;
    let queue = Queue::new(
        &context,
        device,
        Some(ocl::flags::CommandQueueProperties::new().profiling()),
    )?;
    Ok((context, queue))
}
