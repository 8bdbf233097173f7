//! Fused single-pass strategies: labeling, mass update and centroid
//! update in one sweep over the points.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use super::{
    build_program, feature_index, BinaryOp, ClIndex, ClPoint, ClType, Defines, MatrixBinaryOp,
    ReduceVectorParcol, MAX_FEATURES,
};
use crate::cl_common;
use crate::config::StageConfig;
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

const CLUSTER_MERGE_SRC: &str = include_str!("cl/fused_cluster_merge.cl");
const FEATURE_SUM_SRC: &str = include_str!("cl/fused_feature_sum.cl");

/// Strategy dispatch for the fused single-stage pipeline.
#[derive(Debug)]
pub enum FusedUpdater<P: ClPoint, L: ClIndex, M: ClIndex> {
    ClusterMerge(FusedClusterMerge<P, L, M>),
    FeatureSum(FusedFeatureSum<P, L, M>),
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> FusedUpdater<P, L, M> {
    pub fn prepare(context: &Context, config: &StageConfig) -> Result<FusedUpdater<P, L, M>> {
        match config.strategy.as_str() {
            "cluster_merge" => Ok(FusedUpdater::ClusterMerge(FusedClusterMerge::prepare(
                context, config,
            )?)),
            "feature_sum" => Ok(FusedUpdater::FeatureSum(FusedFeatureSum::prepare(
                context, config,
            )?)),
            other => Err(Error::config(format!(
                "unknown fused strategy \"{}\"",
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
        old_centroids: &Buffer<P>,
        new_centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        match self {
            FusedUpdater::ClusterMerge(f) => f.launch(
                queue,
                num_features,
                num_points,
                num_clusters,
                points,
                old_centroids,
                new_centroids,
                labels,
                masses,
                datapoint,
                wait,
            ),
            FusedUpdater::FeatureSum(f) => f.launch(
                queue,
                num_features,
                num_points,
                num_clusters,
                points,
                old_centroids,
                new_centroids,
                labels,
                masses,
                datapoint,
                wait,
            ),
        }
    }
}

fn fused_defines<P: ClPoint, L: ClIndex, M: ClIndex>(config: &StageConfig) -> Defines {
    let mut defines = Defines::new()
        .def("CL_POINT", P::CL_NAME)
        .def("CL_SINT", P::CL_SINT)
        .def("CL_POINT_MAX", P::CL_MAX)
        .def("CL_LABEL", L::CL_NAME)
        .def("CL_MASS", M::CL_NAME)
        .def("VEC_LEN", config.vector_length);
    if P::NEEDS_FP64 {
        defines = defines.flag("POINT64");
    }
    defines
}

/// Shared scratch folding: reduce the per-owner partials and add them
/// into the accumulators. Returns the event of the final add.
#[allow(clippy::too_many_arguments)]
fn fold_partials<P: ClPoint, M: ClIndex>(
    queue: &Queue,
    owners: usize,
    tile_len: usize,
    num_clusters: usize,
    scratch_centroids: &Buffer<P>,
    scratch_masses: &Buffer<M>,
    new_centroids: &Buffer<P>,
    masses: &Buffer<M>,
    reduce_centroids: &ReduceVectorParcol<P>,
    reduce_masses: &ReduceVectorParcol<M>,
    add_centroids: &MatrixBinaryOp<P, P>,
    add_masses: &MatrixBinaryOp<M, M>,
    datapoint: &DataPoint,
    kernel_event: Event,
) -> Result<Event> {
    let mut wait_list = EventList::new();
    wait_list.push(kernel_event.clone());

    let reduce_event = reduce_centroids.launch(
        queue,
        owners,
        tile_len,
        scratch_centroids,
        &datapoint.create_child(),
        &wait_list,
    )?;
    let mut centroid_wait = EventList::new();
    centroid_wait.push(reduce_event.unwrap_or_else(|| kernel_event.clone()));
    add_centroids.matrix(
        queue,
        tile_len,
        new_centroids,
        scratch_centroids,
        &datapoint.create_child(),
        &centroid_wait,
    )?;

    let mut mass_wait = EventList::new();
    mass_wait.push(kernel_event.clone());
    let reduce_event = reduce_masses.launch(
        queue,
        owners,
        num_clusters,
        scratch_masses,
        &datapoint.create_child(),
        &mass_wait,
    )?;
    let mut add_wait = EventList::new();
    add_wait.push(reduce_event.unwrap_or(kernel_event));
    add_masses.matrix(
        queue,
        num_clusters,
        masses,
        scratch_masses,
        &datapoint.create_child(),
        &add_wait,
    )
}

/// Per-work-item scratch tiles, one full (feature x cluster) block and
/// mass row per item.
#[derive(Debug)]
pub struct FusedClusterMerge<P: ClPoint, L: ClIndex, M: ClIndex> {
    config: StageConfig,
    g_stride_g_mem: Vec<Program>,
    g_stride_l_mem: Vec<Program>,
    l_stride_g_mem: Vec<Program>,
    scratch_centroids: Option<Buffer<P>>,
    scratch_masses: Option<Buffer<M>>,
    reduce_centroids: ReduceVectorParcol<P>,
    reduce_masses: ReduceVectorParcol<M>,
    add_centroids: MatrixBinaryOp<P, P>,
    add_masses: MatrixBinaryOp<M, M>,
    _marker: PhantomData<L>,
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> FusedClusterMerge<P, L, M> {
    pub fn prepare(context: &Context, config: &StageConfig) -> Result<FusedClusterMerge<P, L, M>> {
        let global = config.global_dims()?[0];
        if !global.is_power_of_two() {
            return Err(Error::config(format!(
                "fused cluster_merge global size {} is not a power of two",
                global
            )));
        }

        let mut g_stride_g_mem = Vec::new();
        let mut g_stride_l_mem = Vec::new();
        let mut l_stride_g_mem = Vec::new();

        let mut num_features = 2;
        while num_features <= MAX_FEATURES {
            let base =
                fused_defines::<P, L, M>(config).def("NUM_FEATURES", num_features);
            g_stride_g_mem.push(build_program(
                context,
                CLUSTER_MERGE_SRC,
                &base.clone().flag("GLOBAL_MEM"),
            )?);
            g_stride_l_mem.push(build_program(context, CLUSTER_MERGE_SRC, &base.clone())?);
            l_stride_g_mem.push(build_program(
                context,
                CLUSTER_MERGE_SRC,
                &base.flag("LOCAL_STRIDE").flag("GLOBAL_MEM"),
            )?);
            num_features *= 2;
        }

        Ok(FusedClusterMerge {
            config: config.clone(),
            g_stride_g_mem,
            g_stride_l_mem,
            l_stride_g_mem,
            scratch_centroids: None,
            scratch_masses: None,
            reduce_centroids: ReduceVectorParcol::prepare(context)?,
            reduce_masses: ReduceVectorParcol::prepare(context)?,
            add_centroids: MatrixBinaryOp::prepare(context, BinaryOp::Add)?,
            add_masses: MatrixBinaryOp::prepare(context, BinaryOp::Add)?,
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
        old_centroids: &Buffer<P>,
        new_centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name("FusedClusterMerge");

        let index = feature_index(num_features)?;
        let global = self.config.global_dims()?[0];
        let tile_len = num_features * num_clusters;

        let scratch_centroids = ensure_buffer(&mut self.scratch_centroids, queue, global * tile_len)?;
        let scratch_masses = ensure_buffer(&mut self.scratch_masses, queue, global * num_clusters)?;

        let device = queue.device();
        let use_local_stride = cl_common::prefers_local_stride(&device)?;
        let cache_bytes = (tile_len * std::mem::size_of::<P>()) as u64;
        let use_local_memory =
            cl_common::is_gpu(&device)? && cl_common::local_mem_size(&device)? > cache_bytes;

        let program = if use_local_stride {
            &self.l_stride_g_mem[index]
        } else if use_local_memory {
            &self.g_stride_l_mem[index]
        } else {
            &self.g_stride_g_mem[index]
        };

        let mut builder = Kernel::builder();
        builder
            .program(program)
            .name("fused_cluster_merge")
            .queue(queue.clone());
        unsafe {
            builder.disable_arg_type_check();
        }
        builder
            .arg(points)
            .arg(old_centroids)
            .arg(&scratch_centroids)
            .arg(labels)
            .arg(&scratch_masses);
        if !use_local_stride && use_local_memory {
            builder.arg_local::<P>(tile_len);
        }
        builder
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

        fold_partials(
            queue,
            global,
            tile_len,
            num_clusters,
            &scratch_centroids,
            &scratch_masses,
            new_centroids,
            masses,
            &self.reduce_centroids,
            &self.reduce_masses,
            &self.add_centroids,
            &self.add_masses,
            datapoint,
            event,
        )
    }
}

/// Per-work-group scratch rows; the group partitions the features
/// among its items after a cooperative labeling phase.
#[derive(Debug)]
pub struct FusedFeatureSum<P: ClPoint, L: ClIndex, M: ClIndex> {
    config: StageConfig,
    programs: Vec<Program>,
    scratch_centroids: Option<Buffer<P>>,
    scratch_masses: Option<Buffer<M>>,
    reduce_centroids: ReduceVectorParcol<P>,
    reduce_masses: ReduceVectorParcol<M>,
    add_centroids: MatrixBinaryOp<P, P>,
    add_masses: MatrixBinaryOp<M, M>,
    _marker: PhantomData<L>,
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> FusedFeatureSum<P, L, M> {
    pub fn prepare(context: &Context, config: &StageConfig) -> Result<FusedFeatureSum<P, L, M>> {
        let global = config.global_dims()?[0];
        let local = config.local_dims()?[0];
        if local == 0 || global % local != 0 {
            return Err(Error::config(format!(
                "global size {} is not a multiple of local size {}",
                global, local
            )));
        }
        if !(global / local).is_power_of_two() {
            return Err(Error::config(format!(
                "fused feature_sum group count {} is not a power of two",
                global / local
            )));
        }

        let mut programs = Vec::new();
        let mut num_features = 2;
        while num_features <= MAX_FEATURES {
            let defines = fused_defines::<P, L, M>(config).def("NUM_FEATURES", num_features);
            programs.push(build_program(context, FEATURE_SUM_SRC, &defines)?);
            num_features *= 2;
        }

        Ok(FusedFeatureSum {
            config: config.clone(),
            programs,
            scratch_centroids: None,
            scratch_masses: None,
            reduce_centroids: ReduceVectorParcol::prepare(context)?,
            reduce_masses: ReduceVectorParcol::prepare(context)?,
            add_centroids: MatrixBinaryOp::prepare(context, BinaryOp::Add)?,
            add_masses: MatrixBinaryOp::prepare(context, BinaryOp::Add)?,
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
        old_centroids: &Buffer<P>,
        new_centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name("FusedFeatureSum");

        let index = feature_index(num_features)?;
        let global = self.config.global_dims()?[0];
        let local = self.config.local_dims()?[0];
        let groups = global / local;
        let tile_len = num_features * num_clusters;

        let scratch_centroids = ensure_buffer(&mut self.scratch_centroids, queue, groups * tile_len)?;
        let scratch_masses = ensure_buffer(&mut self.scratch_masses, queue, groups * num_clusters)?;

        let mut builder = Kernel::builder();
        builder
            .program(&self.programs[index])
            .name("fused_feature_sum")
            .queue(queue.clone());
        unsafe {
            builder.disable_arg_type_check();
        }
        builder
            .arg(points)
            .arg(old_centroids)
            .arg(&scratch_centroids)
            .arg(labels)
            .arg(&scratch_masses)
            .arg(num_points as u32)
            .arg(num_clusters as u32);
        let kernel: Kernel = builder.build()?;

        let mut event = Event::empty();
        unsafe {
            kernel
                .cmd()
                .queue(queue)
                .global_work_size(global)
                .local_work_size(local)
                .ewait(wait)
                .enew(&mut event)
                .enq()?;
        }
        datapoint.add_event(queue, event.clone());

        fold_partials(
            queue,
            groups,
            tile_len,
            num_clusters,
            &scratch_centroids,
            &scratch_masses,
            new_centroids,
            masses,
            &self.reduce_centroids,
            &self.reduce_masses,
            &self.add_centroids,
            &self.add_masses,
            datapoint,
            event,
        )
    }
}

fn ensure_buffer<T: ClType>(
    slot: &mut Option<Buffer<T>>,
    queue: &Queue,
    len: usize,
) -> Result<Buffer<T>> {
    if let Some(buf) = slot {
        if buf.len() >= len {
            return Ok(buf.clone());
        }
    }
    let context = queue.context();
    let buf = Buffer::<T>::builder().context(&context).len(len).build()?;
    *slot = Some(buf.clone());
    Ok(buf)
}
