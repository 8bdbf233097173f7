//! Pipeline drivers: convergent Lloyd iteration over the kernel
//! strategies.
//!
//! Two drivers exist. The three-stage driver runs labeling, mass
//! update and centroid update as separate runnables per tile; the
//! single-stage driver runs one fused runnable. Both partition the
//! host points so every tile is a self-contained feature-major block,
//! stream tiles through the buffer cache, and finalize centroids with
//! the row-broadcast divide.

mod single_stage;
mod three_stage;

pub use single_stage::SingleStagePipeline;
pub use three_stage::ThreeStagePipeline;

use num_traits::Zero;
use ocl::{Buffer, Context, Device, Queue};

use crate::cache::{ObjectMode, SimpleBufferCache};
use crate::cl_common;
use crate::config::StageConfig;
use crate::error::{Error, Result};
use crate::kernels::{ClIndex, ClPoint};
use crate::matrix::{partition_matrix, Matrix};
use crate::scheduler::SingleDeviceScheduler;

/// Device tile size. Chosen so every power-of-two feature count up to
/// the kernel families' maximum divides it evenly.
pub const DEFAULT_BUFFER_SIZE: usize = 16 << 20;

/// Memory held back from the slot pool for the driver's own
/// allocations.
const POOL_HEADROOM: usize = 64 << 20;

/// Upper bound on pool slots, which also bounds the pinned staging
/// area.
const MAX_POOL_TILES: usize = 128;

/// All stages of one run execute on a single queue; their
/// configurations must therefore agree on the device.
pub(crate) fn common_device(stages: &[&StageConfig]) -> Result<(usize, usize)> {
    let first = match stages.first() {
        Some(s) => (s.platform, s.device),
        None => return Err(Error::config("no stage configurations given")),
    };
    for stage in stages {
        if (stage.platform, stage.device) != first {
            return Err(Error::config(
                "stages name different devices; the buffered pipeline runs on one queue",
            ));
        }
    }
    Ok(first)
}

/// Per-run device state: scheduler (owning the cache), persistent
/// k-means buffers and the registered object handles.
pub(crate) struct RunState<P: ClPoint, M: ClIndex> {
    pub scheduler: SingleDeviceScheduler,
    pub queue: Queue,
    pub old_centroids: Buffer<P>,
    pub new_centroids: Buffer<P>,
    pub masses: Buffer<M>,
    pub points_oid: u32,
    pub labels_oid: u32,
    pub points_step: usize,
    pub labels_step: usize,
    pub num_features: usize,
    pub num_points: usize,
    pub num_clusters: usize,
}

/// Builds the cache and scheduler, registers the partitioned points
/// and the labels, and uploads the initial centroids.
///
/// The cache borrows `points_partitioned` and `labels` for the
/// lifetime of the returned state; both outlive it in the drivers'
/// `run` frames.
pub(crate) fn setup_run<P: ClPoint, L: ClIndex, M: ClIndex>(
    context: &Context,
    device: Device,
    buffer_size: usize,
    points_partitioned: &mut [P],
    labels: &mut [L],
    centroids: &Matrix<P>,
) -> Result<RunState<P, M>> {
    let num_features = centroids.rows();
    let num_clusters = centroids.cols();
    if num_features == 0 || num_clusters == 0 {
        return Err(Error::config(
            "centroid matrix must have at least one feature and one cluster",
        ));
    }
    let num_points = points_partitioned.len() / num_features;

    let point_stride = num_features * std::mem::size_of::<P>();
    if buffer_size % point_stride != 0 {
        return Err(Error::alignment(format!(
            "buffer size {} is not a multiple of the {}-byte point stride",
            buffer_size, point_stride
        )));
    }
    let points_step = buffer_size;
    let labels_step = buffer_size / point_stride * std::mem::size_of::<L>();

    let mut cache = SimpleBufferCache::new(buffer_size);
    let pool_size = pool_size(&device, buffer_size)?;
    cache.add_device(context, device, pool_size)?;

    let points_bytes = std::mem::size_of_val(points_partitioned);
    let labels_bytes = std::mem::size_of_val(labels);
    let points_oid = unsafe {
        cache.add_object(
            points_partitioned.as_mut_ptr() as *mut u8,
            points_bytes,
            ObjectMode::ReadOnly,
        )?
    };
    let labels_oid = unsafe {
        cache.add_object(
            labels.as_mut_ptr() as *mut u8,
            labels_bytes,
            ObjectMode::ReadWrite,
        )?
    };

    let mut scheduler = SingleDeviceScheduler::new();
    scheduler.attach_buffer_cache(cache);
    scheduler.attach_device(context, device)?;
    let queue = scheduler.queue()?.clone();

    let old_centroids = Buffer::<P>::builder()
        .queue(queue.clone())
        .len(num_features * num_clusters)
        .build()?;
    let new_centroids = Buffer::<P>::builder()
        .queue(queue.clone())
        .len(num_features * num_clusters)
        .build()?;
    let masses = Buffer::<M>::builder()
        .queue(queue.clone())
        .len(num_clusters)
        .build()?;

    old_centroids.write(centroids.as_slice()).enq()?;

    Ok(RunState {
        scheduler,
        queue,
        old_centroids,
        new_centroids,
        masses,
        points_oid,
        labels_oid,
        points_step,
        labels_step,
        num_features,
        num_points,
        num_clusters,
    })
}

fn pool_size(device: &Device, buffer_size: usize) -> Result<usize> {
    let global = cl_common::global_mem_size(device)? as usize;
    let available = global.saturating_sub(POOL_HEADROOM);
    let capped = available.min(MAX_POOL_TILES * buffer_size);
    if capped <= 2 * buffer_size {
        return Err(Error::resource(format!(
            "device offers {} bytes, not enough for two {}-byte tiles",
            global, buffer_size
        )));
    }
    Ok(capped)
}

/// Copies centroids and masses back to the host and flushes every
/// cached labels tile. Consumes the run state; dropping it joins the
/// cache's I/O workers.
pub(crate) fn read_back<P: ClPoint, L: ClIndex, M: ClIndex>(
    mut state: RunState<P, M>,
    centroids: &mut Matrix<P>,
    masses: &mut [M],
) -> Result<()> {
    state.old_centroids.read(centroids.as_mut_slice()).enq()?;
    state.masses.read(masses).enq()?;

    let labels_bytes = state.num_points * std::mem::size_of::<L>();
    let cache = state
        .scheduler
        .buffer_cache_mut()
        .ok_or_else(|| Error::resource("scheduler lost its buffer cache"))?;
    let no_deps = ocl::EventList::new();
    let mut begin = 0;
    while begin < labels_bytes {
        let end = (begin + state.labels_step).min(labels_bytes);
        let dp = crate::measurement::DataPoint::detached();
        cache.read(&state.queue, state.labels_oid, begin, end, &no_deps, &dp)?;
        begin = end;
    }
    state.queue.finish()?;
    Ok(())
}

/// Partitions the host points matrix for tiled streaming.
pub(crate) fn partition_points<P: ClPoint>(
    points: &Matrix<P>,
    buffer_size: usize,
) -> Result<Vec<P>> {
    let mut partitioned = vec![P::zero(); points.len()];
    partition_matrix(points.as_slice(), &mut partitioned, points.rows(), buffer_size)?;
    Ok(partitioned)
}
