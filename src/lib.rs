//! Heterogeneous, out-of-core k-means clustering on OpenCL devices.
//!
//! The engine partitions N points in F-dimensional space into K
//! clusters with Lloyd's algorithm, offloading the three hot kernels
//! (labeling, mass update, centroid update) to one or more OpenCL
//! devices while streaming data larger than device memory through a
//! managed buffer cache.
//!
//! The crate is a stack of layers, each oblivious to the one above:
//!
//! * [`matrix`] — dense feature-major host storage and the tile
//!   partitioning transform.
//! * [`cache`] — the tiled buffer cache: object registration, slot
//!   locking and eviction, asynchronous host/device transfer through
//!   pinned staging buffers (or zero copy on CPU devices).
//! * [`scheduler`] — tile iteration and dependency wiring for
//!   unary/binary compute tasks.
//! * [`kernels`] — the device kernel families: column reduction,
//!   row-broadcast elementwise ops, and the labeling, mass-update,
//!   centroid-update and fused strategy sets.
//! * [`pipeline`] — the three-stage and fused single-stage Lloyd
//!   drivers.
//! * [`benchmark`] — the multi-run harness with host-reference
//!   verification.
//!
//! Measurements (per-kernel event timings, transfer durations) are
//! collected through [`measurement`] and written as CSV files.

pub mod benchmark;
pub mod cache;
pub mod cl_common;
pub mod config;
pub mod error;
pub mod initializer;
pub mod io;
pub mod kernels;
pub mod matrix;
pub mod measurement;
pub mod pipeline;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use crate::cache::{BufferDesc, ObjectMode, SimpleBufferCache};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::kernels::{ClIndex, ClPoint, ClType};
pub use crate::matrix::Matrix;
pub use crate::measurement::{DataPoint, Measurement};
pub use crate::pipeline::{SingleStagePipeline, ThreeStagePipeline};
pub use crate::scheduler::SingleDeviceScheduler;
