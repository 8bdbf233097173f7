//! Labeling strategies: assign every point to its nearest centroid.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use super::{build_program, feature_index, ClIndex, ClPoint, Defines, MAX_FEATURES};
use crate::cl_common;
use crate::config::StageConfig;
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

const SRC: &str = include_str!("cl/lloyd_labeling_vp_clcp.cl");
const KERNEL_NAME: &str = "lloyd_labeling_vp_clcp";

/// Strategy dispatch for the labeling phase.
///
/// A single family exists today; the enum keeps the construction
/// surface uniform with the other phases.
#[derive(Debug)]
pub enum Labeler<P: ClPoint, L: ClIndex> {
    UnrollVector(LabelingUnrollVector<P, L>),
}

impl<P: ClPoint, L: ClIndex> Labeler<P, L> {
    pub fn prepare(context: &Context, config: &StageConfig) -> Result<Labeler<P, L>> {
        match config.strategy.as_str() {
            "unroll_vector" => Ok(Labeler::UnrollVector(LabelingUnrollVector::prepare(
                context, config,
            )?)),
            other => Err(Error::config(format!(
                "unknown labeling strategy \"{}\"",
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
        centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        match self {
            Labeler::UnrollVector(l) => l.launch(
                queue,
                num_features,
                num_points,
                num_clusters,
                points,
                centroids,
                labels,
                datapoint,
                wait,
            ),
        }
    }
}

/// The unroll-vector labeling family.
///
/// Kernels are instantiated for every power-of-two feature count up to
/// [`MAX_FEATURES`] and in three work distributions: local stride for
/// CPU-class devices, global stride with a local-memory centroid cache
/// for GPUs that can hold the centroids, and a global-memory fallback.
#[derive(Debug)]
pub struct LabelingUnrollVector<P: ClPoint, L: ClIndex> {
    config: StageConfig,
    g_stride_g_mem: Vec<Program>,
    g_stride_l_mem: Vec<Program>,
    l_stride_g_mem: Vec<Program>,
    ro_centroids: Option<Buffer<P>>,
    _marker: PhantomData<L>,
}

impl<P: ClPoint, L: ClIndex> LabelingUnrollVector<P, L> {
    pub fn prepare(context: &Context, config: &StageConfig) -> Result<LabelingUnrollVector<P, L>> {
        if config.vector_length == 0 || !config.vector_length.is_power_of_two() {
            return Err(Error::config(format!(
                "labeling vector_length {} is not a power of two",
                config.vector_length
            )));
        }

        let mut g_stride_g_mem = Vec::new();
        let mut g_stride_l_mem = Vec::new();
        let mut l_stride_g_mem = Vec::new();

        let mut num_features = 2;
        while num_features <= MAX_FEATURES {
            let base = Self::base_defines(config).def("NUM_FEATURES", num_features);

            g_stride_g_mem.push(build_program(
                context,
                SRC,
                &base.clone().flag("GLOBAL_MEM"),
            )?);
            g_stride_l_mem.push(build_program(context, SRC, &base.clone())?);
            l_stride_g_mem.push(build_program(
                context,
                SRC,
                &base.flag("LOCAL_STRIDE").flag("GLOBAL_MEM"),
            )?);

            num_features *= 2;
        }

        Ok(LabelingUnrollVector {
            config: config.clone(),
            g_stride_g_mem,
            g_stride_l_mem,
            l_stride_g_mem,
            ro_centroids: None,
            _marker: PhantomData,
        })
    }

    fn base_defines(config: &StageConfig) -> Defines {
        let mut defines = Defines::new()
            .def("CL_POINT", P::CL_NAME)
            .def("CL_SINT", P::CL_SINT)
            .def("CL_POINT_MAX", P::CL_MAX)
            .def("CL_LABEL", L::CL_NAME)
            .def("VEC_LEN", config.vector_length)
            .def("UNROLL_CLUSTERS_LENGTH", config.unroll_clusters_length)
            .def("UNROLL_FEATURES_LENGTH", config.unroll_features_length);
        if P::NEEDS_FP64 {
            defines = defines.flag("POINT64");
        }
        defines
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        &mut self,
        queue: &Queue,
        num_features: usize,
        num_points: usize,
        num_clusters: usize,
        points: &Buffer<u8>,
        centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name("LabelingUnrollVector");

        let index = feature_index(num_features)?;
        let centroids_len = num_features * num_clusters;

        // The kernels read centroids through a buffer the labeling
        // phase owns, decoupled from the swap of old/new centroids.
        let ro_centroids = self.ensure_ro_centroids(queue, centroids_len)?;
        centroids
            .cmd()
            .queue(queue)
            .copy(&ro_centroids, None, Some(centroids_len))
            .enq()?;

        let device = queue.device();
        let use_local_stride = cl_common::prefers_local_stride(&device)?;
        let cache_bytes = (centroids_len * std::mem::size_of::<P>()) as u64;
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
            .name(KERNEL_NAME)
            .queue(queue.clone());
        unsafe {
            // Tile buffers are raw byte ranges; the kernel signature
            // carries the real element types.
            builder.disable_arg_type_check();
        }
        builder.arg(points).arg(&ro_centroids).arg(labels);
        if !use_local_stride && use_local_memory {
            builder.arg_local::<P>(centroids_len);
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
                .global_work_size(self.config.global_dims()?[0])
                .local_work_size(self.config.local_dims()?[0])
                .ewait(wait)
                .enew(&mut event)
                .enq()?;
        }
        datapoint.add_event(queue, event.clone());
        Ok(event)
    }

    fn ensure_ro_centroids(&mut self, queue: &Queue, len: usize) -> Result<Buffer<P>> {
        if let Some(buf) = &self.ro_centroids {
            if buf.len() >= len {
                return Ok(buf.clone());
            }
        }
        let context = queue.context();
        let buf = Buffer::<P>::builder().context(&context).len(len).build()?;
        self.ro_centroids = Some(buf.clone());
        Ok(buf)
    }
}
