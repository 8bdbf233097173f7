//! Tests that exercise an attached OpenCL device.
//!
//! Every test degrades to a no-op when no platform or device is
//! present, so the host-only parts of the suite stay green on machines
//! without an OpenCL runtime.

mod buffer_cache;
mod matrix_op;
mod pipeline;
mod reduce;
mod scheduler;

use ocl::{Context, Device, Queue};

pub(crate) fn cl_setup() -> Option<(Context, Queue, Device)> {
    let (context, queue) = crate::cl_common::context_and_queue(0, 0).ok()?;
    let device = queue.device();
    Some((context, queue, device))
}

/// Reinterprets a typed slice as bytes for staging into `Buffer<u8>`
/// tiles.
pub(crate) fn as_bytes<T: Copy>(values: &[T]) -> Vec<u8> {
    let len = std::mem::size_of_val(values);
    let mut bytes = vec![0u8; len];
    unsafe {
        std::ptr::copy_nonoverlapping(values.as_ptr() as *const u8, bytes.as_mut_ptr(), len);
    }
    bytes
}
