//! Three-stage pipeline driver: labeling, mass update and centroid
//! update as separate runnables chained per tile.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use num_traits::Zero;
use ocl::{Context, Device, EventList};

use super::{common_device, partition_points, read_back, setup_run, DEFAULT_BUFFER_SIZE};
use crate::cl_common;
use crate::config::KmeansConfig;
use crate::error::{Error, Result};
use crate::kernels::{
    BinaryOp, CentroidUpdater, ClIndex, ClPoint, Labeler, MassUpdater, MatrixBinaryOp,
};
use crate::matrix::Matrix;
use crate::measurement::Measurement;

/// Driver state that survives across runs: the compiled kernel
/// strategies and the device they target.
pub struct ThreeStagePipeline<P: ClPoint, L: ClIndex, M: ClIndex> {
    context: Context,
    device: Device,
    platform_name: String,
    max_iterations: u32,
    buffer_size: usize,
    labeler: Rc<RefCell<Labeler<P, L>>>,
    mass_updater: Rc<RefCell<MassUpdater<L, M>>>,
    centroid_updater: Rc<RefCell<CentroidUpdater<P, L, M>>>,
    matrix_divide: MatrixBinaryOp<P, M>,
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> ThreeStagePipeline<P, L, M> {
    pub fn new(config: &KmeansConfig) -> Result<ThreeStagePipeline<P, L, M>> {
        let (platform_idx, device_idx) = common_device(&[
            &config.labeling,
            &config.mass_update,
            &config.centroid_update,
        ])?;
        let (platform, device) = cl_common::select_device(platform_idx, device_idx)?;
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()?;

        Ok(ThreeStagePipeline {
            labeler: Rc::new(RefCell::new(Labeler::prepare(&context, &config.labeling)?)),
            mass_updater: Rc::new(RefCell::new(MassUpdater::prepare(
                &context,
                &config.mass_update,
            )?)),
            centroid_updater: Rc::new(RefCell::new(CentroidUpdater::prepare(
                &context,
                &config.centroid_update,
            )?)),
            matrix_divide: MatrixBinaryOp::prepare(&context, BinaryOp::Divide)?,
            context,
            device,
            platform_name: platform.name().unwrap_or_else(|_| "unknown".to_string()),
            max_iterations: config.iterations,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    /// Overrides the tile size (bytes). Must remain a multiple of the
    /// point stride for every matrix this pipeline will see.
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size;
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Runs up to `max_iterations` Lloyd iterations.
    ///
    /// `centroids` carries the seed in and the result out; `labels`
    /// and `masses` are overwritten.
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

        measurement.set_parameter("Pipeline", "three-stage");
        measurement.set_parameter("LabelingPlatform", &self.platform_name);
        measurement.set_parameter("LabelingDevice", &self.device.name().unwrap_or_default());
        measurement.set_parameter("MassUpdatePlatform", &self.platform_name);
        measurement.set_parameter("MassUpdateDevice", &self.device.name().unwrap_or_default());
        measurement.set_parameter("CentroidUpdatePlatform", &self.platform_name);
        measurement.set_parameter("CentroidUpdateDevice", &self.device.name().unwrap_or_default());

        let mut points_partitioned = partition_points(points, self.buffer_size)?;

        let mut state = setup_run::<P, L, M>(
            &self.context,
            self.device,
            self.buffer_size,
            &mut points_partitioned,
            labels,
            centroids,
        )?;

        // Setup transfers are not part of the measured run.
        state.queue.finish()?;
        let total_timer = Instant::now();

        for iteration in 0..self.max_iterations {
            state.masses.cmd().fill(M::zero(), None).enq()?;
            state.new_centroids.cmd().fill(P::zero(), None).enq()?;

            let labeling_dp = measurement.add_datapoint_for(iteration);
            let labeler = Rc::clone(&self.labeler);
            let old_centroids = state.old_centroids.clone();
            let (nf, nc) = (state.num_features, state.num_clusters);
            let ll_events = state.scheduler.enqueue_binary(
                Box::new(move |queue, _offset, point_bytes, label_bytes, points, labels, dp| {
                    let _ = point_bytes;
                    let tile_points = label_bytes / std::mem::size_of::<L>();
                    labeler.borrow_mut().launch(
                        queue,
                        nf,
                        tile_points,
                        nc,
                        points,
                        &old_centroids,
                        labels,
                        dp,
                        &EventList::new(),
                    )
                }),
                state.points_oid,
                state.labels_oid,
                state.points_step,
                state.labels_step,
                labeling_dp,
            )?;

            let mass_dp = measurement.add_datapoint_for(iteration);
            let mass_updater = Rc::clone(&self.mass_updater);
            let device_masses = state.masses.clone();
            let nc = state.num_clusters;
            let mu_events = state.scheduler.enqueue_unary(
                Box::new(move |queue, _offset, label_bytes, labels, dp| {
                    let tile_points = label_bytes / std::mem::size_of::<L>();
                    mass_updater.borrow_mut().launch(
                        queue,
                        tile_points,
                        nc,
                        labels,
                        &device_masses,
                        dp,
                        &EventList::new(),
                    )
                }),
                state.labels_oid,
                state.labels_step,
                mass_dp,
            )?;

            let centroid_dp = measurement.add_datapoint_for(iteration);
            let centroid_updater = Rc::clone(&self.centroid_updater);
            let new_centroids = state.new_centroids.clone();
            let device_masses = state.masses.clone();
            let (nf, nc) = (state.num_features, state.num_clusters);
            let cu_events = state.scheduler.enqueue_binary(
                Box::new(move |queue, _offset, point_bytes, label_bytes, points, labels, dp| {
                    let _ = point_bytes;
                    let tile_points = label_bytes / std::mem::size_of::<L>();
                    centroid_updater.borrow_mut().launch(
                        queue,
                        nf,
                        tile_points,
                        nc,
                        points,
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
                centroid_dp,
            )?;

            state.scheduler.run()?;
            drop((ll_events, mu_events, cu_events));

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
