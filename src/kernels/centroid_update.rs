//! Centroid update strategies: per-cluster feature sums.
//!
//! All strategies add the labeled point sums into the new-centroids
//! accumulator; the pipeline zeroes it per iteration and divides by
//! the masses afterwards. Results agree up to floating-point
//! reassociation.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use super::{build_program, BinaryOp, ClIndex, ClPoint, Defines, MatrixBinaryOp, ReduceVectorParcol};
use crate::cl_common;
use crate::config::StageConfig;
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

const FEATURE_SUM_SRC: &str = include_str!("cl/centroid_update_feature_sum.cl");
const FEATURE_SUM_PARDIM_SRC: &str = include_str!("cl/centroid_update_feature_sum_pardim.cl");
const CLUSTER_MERGE_SRC: &str = include_str!("cl/centroid_update_cluster_merge.cl");

/// Strategy dispatch for the centroid-update phase.
#[derive(Debug)]
pub enum CentroidUpdater<P: ClPoint, L: ClIndex, M: ClIndex> {
    FeatureSum(CentroidUpdateFeatureSum<P, L, M>),
    FeatureSumPardim(CentroidUpdateFeatureSumPardim<P, L, M>),
    ClusterMerge(CentroidUpdateClusterMerge<P, L, M>),
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> CentroidUpdater<P, L, M> {
    pub fn prepare(context: &Context, config: &StageConfig) -> Result<CentroidUpdater<P, L, M>> {
        match config.strategy.as_str() {
            "feature_sum" => Ok(CentroidUpdater::FeatureSum(
                CentroidUpdateFeatureSum::prepare(context, config)?,
            )),
            "feature_sum_pardim" => Ok(CentroidUpdater::FeatureSumPardim(
                CentroidUpdateFeatureSumPardim::prepare(context, config)?,
            )),
            "cluster_merge" => Ok(CentroidUpdater::ClusterMerge(
                CentroidUpdateClusterMerge::prepare(context, config)?,
            )),
            other => Err(Error::config(format!(
                "unknown centroid update strategy \"{}\"",
                other
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        &mut self,
        queue: &Queue,
        num_features: usize,
        num_points: usize,
        num_clusters: usize,
        points: &Buffer<u8>,
        new_centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        match self {
            CentroidUpdater::FeatureSum(c) => c.launch(
                queue,
                num_features,
                num_points,
                num_clusters,
                points,
                new_centroids,
                labels,
                masses,
                datapoint,
                wait,
            ),
            CentroidUpdater::FeatureSumPardim(c) => c.launch(
                queue,
                num_features,
                num_points,
                num_clusters,
                points,
                new_centroids,
                labels,
                masses,
                datapoint,
                wait,
            ),
            CentroidUpdater::ClusterMerge(c) => c.launch(
                queue,
                num_features,
                num_points,
                num_clusters,
                points,
                new_centroids,
                labels,
                masses,
                datapoint,
                wait,
            ),
        }
    }
}

fn point_defines<P: ClPoint, L: ClIndex>() -> Defines {
    let mut defines = Defines::new()
        .def("CL_POINT", P::CL_NAME)
        .def("CL_LABEL", L::CL_NAME);
    if P::NEEDS_FP64 {
        defines = defines.flag("POINT64");
    }
    defines
}

/// One work-item per (feature, cluster) pair.
#[derive(Debug)]
pub struct CentroidUpdateFeatureSum<P: ClPoint, L: ClIndex, M: ClIndex> {
    config: StageConfig,
    program: Program,
    _marker: PhantomData<(P, L, M)>,
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> CentroidUpdateFeatureSum<P, L, M> {
    pub fn prepare(
        context: &Context,
        config: &StageConfig,
    ) -> Result<CentroidUpdateFeatureSum<P, L, M>> {
        let program = build_program(context, FEATURE_SUM_SRC, &point_defines::<P, L>())?;
        Ok(CentroidUpdateFeatureSum {
            config: config.clone(),
            program,
            _marker: PhantomData,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        &mut self,
        queue: &Queue,
        num_features: usize,
        num_points: usize,
        num_clusters: usize,
        points: &Buffer<u8>,
        new_centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        _masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name("CentroidUpdateFeatureSum");

        let mut builder = Kernel::builder();
        builder
            .program(&self.program)
            .name("centroid_update_feature_sum")
            .queue(queue.clone());
        unsafe {
            builder.disable_arg_type_check();
        }
        builder
            .arg(points)
            .arg(new_centroids)
            .arg(labels)
            .arg(num_features as u32)
            .arg(num_points as u32)
            .arg(num_clusters as u32);
        let kernel: Kernel = builder.build()?;

        let mut event = Event::empty();
        unsafe {
            kernel
                .cmd()
                .queue(queue)
                .global_work_size(self.config.global_dims()?[0])
                .local_work_size(self.config.local_dims()?[0])
                .ewait(wait)
                .enew(&mut event)
                .enq()?;
        }
        datapoint.add_event(queue, event.clone());
        Ok(event)
    }
}

/// Feature dimension split across the second work axis.
#[derive(Debug)]
pub struct CentroidUpdateFeatureSumPardim<P: ClPoint, L: ClIndex, M: ClIndex> {
    config: StageConfig,
    program: Program,
    _marker: PhantomData<(P, L, M)>,
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> CentroidUpdateFeatureSumPardim<P, L, M> {
    pub fn prepare(
        context: &Context,
        config: &StageConfig,
    ) -> Result<CentroidUpdateFeatureSumPardim<P, L, M>> {
        if !config.local_features.is_power_of_two() || !config.thread_features.is_power_of_two() {
            return Err(Error::config(format!(
                "local_features {} and thread_features {} must be powers of two",
                config.local_features, config.thread_features
            )));
        }
        let defines = point_defines::<P, L>().def("THREAD_FEATURES", config.thread_features);
        let program = build_program(context, FEATURE_SUM_PARDIM_SRC, &defines)?;
        Ok(CentroidUpdateFeatureSumPardim {
            config: config.clone(),
            program,
            _marker: PhantomData,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        &mut self,
        queue: &Queue,
        num_features: usize,
        num_points: usize,
        num_clusters: usize,
        points: &Buffer<u8>,
        new_centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        _masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name("CentroidUpdateFeatureSumPardim");

        let feature_blocks =
            (num_features + self.config.thread_features - 1) / self.config.thread_features;
        let feature_axis = round_up(feature_blocks, self.config.local_features);

        let mut builder = Kernel::builder();
        builder
            .program(&self.program)
            .name("centroid_update_feature_sum_pardim")
            .queue(queue.clone());
        unsafe {
            builder.disable_arg_type_check();
        }
        builder
            .arg(points)
            .arg(new_centroids)
            .arg(labels)
            .arg(num_features as u32)
            .arg(num_points as u32)
            .arg(num_clusters as u32);
        let kernel: Kernel = builder.build()?;

        let mut event = Event::empty();
        unsafe {
            kernel
                .cmd()
                .queue(queue)
                .global_work_size([self.config.global_dims()?[0], feature_axis])
                .local_work_size([self.config.local_dims()?[0], self.config.local_features])
                .ewait(wait)
                .enew(&mut event)
                .enq()?;
        }
        datapoint.add_event(queue, event.clone());
        Ok(event)
    }
}

/// Per-work-item (feature x cluster) tiles folded by reduction.
#[derive(Debug)]
pub struct CentroidUpdateClusterMerge<P: ClPoint, L: ClIndex, M: ClIndex> {
    config: StageConfig,
    g_stride: Program,
    l_stride: Program,
    scratch: Option<Buffer<P>>,
    reduce: ReduceVectorParcol<P>,
    add: MatrixBinaryOp<P, P>,
    _marker: PhantomData<(L, M)>,
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> CentroidUpdateClusterMerge<P, L, M> {
    pub fn prepare(
        context: &Context,
        config: &StageConfig,
    ) -> Result<CentroidUpdateClusterMerge<P, L, M>> {
        let global = config.global_dims()?[0];
        if !global.is_power_of_two() {
            return Err(Error::config(format!(
                "cluster_merge global size {} is not a power of two",
                global
            )));
        }

        let defines = point_defines::<P, L>();
        let g_stride = build_program(context, CLUSTER_MERGE_SRC, &defines)?;
        let l_stride = build_program(
            context,
            CLUSTER_MERGE_SRC,
            &defines.clone().flag("LOCAL_STRIDE"),
        )?;

        Ok(CentroidUpdateClusterMerge {
            config: config.clone(),
            g_stride,
            l_stride,
            scratch: None,
            reduce: ReduceVectorParcol::prepare(context)?,
            add: MatrixBinaryOp::prepare(context, BinaryOp::Add)?,
            _marker: PhantomData,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        &mut self,
        queue: &Queue,
        num_features: usize,
        num_points: usize,
        num_clusters: usize,
        points: &Buffer<u8>,
        new_centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        _masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name("CentroidUpdateClusterMerge");

        let global = self.config.global_dims()?[0];
        let tile_len = num_features * num_clusters;
        let scratch = self.ensure_scratch(queue, global * tile_len)?;

        let program = if cl_common::prefers_local_stride(&queue.device())? {
            &self.l_stride
        } else {
            &self.g_stride
        };

        let mut builder = Kernel::builder();
        builder
            .program(program)
            .name("centroid_update_cluster_merge")
            .queue(queue.clone());
        unsafe {
            builder.disable_arg_type_check();
        }
        builder
            .arg(points)
            .arg(&scratch)
            .arg(labels)
            .arg(num_features as u32)
            .arg(num_points as u32)
            .arg(num_clusters as u32);
        let kernel: Kernel = builder.build()?;

        let mut event = Event::empty();
        unsafe {
            kernel
                .cmd()
                .queue(queue)
                .global_work_size(global)
                .local_work_size(self.config.local_dims()?[0])
                .ewait(wait)
                .enew(&mut event)
                .enq()?;
        }
        datapoint.add_event(queue, event.clone());

        let mut wait_list = EventList::new();
        wait_list.push(event);

        let reduce_event = self.reduce.launch(
            queue,
            global,
            tile_len,
            &scratch,
            &datapoint.create_child(),
            &wait_list,
        )?;
        if let Some(ev) = reduce_event {
            wait_list = EventList::new();
            wait_list.push(ev);
        }

        self.add.matrix(
            queue,
            tile_len,
            new_centroids,
            &scratch,
            &datapoint.create_child(),
            &wait_list,
        )
    }

    fn ensure_scratch(&mut self, queue: &Queue, len: usize) -> Result<Buffer<P>> {
        if let Some(buf) = &self.scratch {
            if buf.len() >= len {
                return Ok(buf.clone());
            }
        }
        let context = queue.context();
        let buf = Buffer::<P>::builder().context(&context).len(len).build()?;
        self.scratch = Some(buf.clone());
        Ok(buf)
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        value
    } else {
        ((value + multiple - 1) / multiple) * multiple
    }
}
