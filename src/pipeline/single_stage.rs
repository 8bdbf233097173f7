//! Single-stage pipeline driver: one fused runnable per tile.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use num_traits::Zero;
use ocl::{Context, Device, EventList};

use super::{common_device, partition_points, read_back, setup_run, DEFAULT_BUFFER_SIZE};
use crate::cl_common;
use crate::config::KmeansConfig;
use crate::error::{Error, Result};
use crate::kernels::{BinaryOp, ClIndex, ClPoint, FusedUpdater, MatrixBinaryOp};
use crate::matrix::Matrix;
use crate::measurement::Measurement;

pub struct SingleStagePipeline<P: ClPoint, L: ClIndex, M: ClIndex> {
    context: Context,
    device: Device,
    platform_name: String,
    max_iterations: u32,
    buffer_size: usize,
    fused: Rc<RefCell<FusedUpdater<P, L, M>>>,
    matrix_divide: MatrixBinaryOp<P, M>,
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> SingleStagePipeline<P, L, M> {
    pub fn new(config: &KmeansConfig) -> Result<SingleStagePipeline<P, L, M>> {
        let (platform_idx, device_idx) = common_device(&[&config.fused])?;
        let (platform, device) = cl_common::select_device(platform_idx, device_idx)?;
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()?;

        Ok(SingleStagePipeline {
            fused: Rc::new(RefCell::new(FusedUpdater::prepare(&context, &config.fused)?)),
            matrix_divide: MatrixBinaryOp::prepare(&context, BinaryOp::Divide)?,
            context,
            device,
            platform_name: platform.name().unwrap_or_else(|_| "unknown".to_string()),
            max_iterations: config.iterations,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size;
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Runs up to `max_iterations` Lloyd iterations with the fused
    /// kernel. Argument contract matches
    /// [`ThreeStagePipeline::run`](super::ThreeStagePipeline::run).
    pub fn run(
        &mut self,
        points: &Matrix<P>,
        centroids: &mut Matrix<P>,
        labels: &mut Vec<L>,
        masses: &mut Vec<M>,
        measurement: &mut Measurement,
    ) -> Result<()> {
        let num_features = points.rows();
        let num_points = points.cols();
        let num_clusters = centroids.cols();
        if centroids.rows() != num_features {
            return Err(Error::config(format!(
                "centroids have {} features, points have {}",
                centroids.rows(),
                num_features
            )));
        }
        labels.clear();
        labels.resize(num_points, L::zero());
        masses.clear();
        masses.resize(num_clusters, M::zero());

        measurement.set_parameter("Pipeline", "fused");
        measurement.set_parameter("FusedPlatform", &self.platform_name);
        measurement.set_parameter("FusedDevice", &self.device.name().unwrap_or_default());

        let mut points_partitioned = partition_points(points, self.buffer_size)?;

        let mut state = setup_run::<P, L, M>(
            &self.context,
            self.device,
            self.buffer_size,
            &mut points_partitioned,
            labels,
            centroids,
        )?;

        state.queue.finish()?;
        let total_timer = Instant::now();

        for iteration in 0..self.max_iterations {
            state.masses.cmd().fill(M::zero(), None).enq()?;
            state.new_centroids.cmd().fill(P::zero(), None).enq()?;

            let fused_dp = measurement.add_datapoint_for(iteration);
            let fused = Rc::clone(&self.fused);
            let old_centroids = state.old_centroids.clone();
            let new_centroids = state.new_centroids.clone();
            let device_masses = state.masses.clone();
            let (nf, nc) = (state.num_features, state.num_clusters);
            let events = state.scheduler.enqueue_binary(
                Box::new(move |queue, _offset, point_bytes, label_bytes, points, labels, dp| {
                    let _ = point_bytes;
                    let tile_points = label_bytes / std::mem::size_of::<L>();
                    fused.borrow_mut().launch(
                        queue,
                        nf,
                        tile_points,
                        nc,
                        points,
                        &old_centroids,
                        &new_centroids,
                        labels,
                        &device_masses,
                        dp,
                        &EventList::new(),
                    )
                }),
                state.points_oid,
                state.labels_oid,
                state.points_step,
                state.labels_step,
                fused_dp,
            )?;

            state.scheduler.run()?;
            drop(events);

            self.matrix_divide.row(
                &state.queue,
                state.num_features,
                state.num_clusters,
                &state.new_centroids,
                &state.masses,
                &measurement.add_datapoint_for(iteration),
                &EventList::new(),
            )?;

            std::mem::swap(&mut state.old_centroids, &mut state.new_centroids);
        }

        state.queue.finish()?;

        let total_dp = measurement.add_datapoint();
        total_dp.set_name("TotalTime");
        total_dp.add_value(total_timer.elapsed().as_nanos() as u64);

        read_back::<P, L, M>(state, centroids, masses)
    }
}
