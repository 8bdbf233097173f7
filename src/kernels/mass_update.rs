//! Mass update strategies: per-cluster point counts.
//!
//! Four interchangeable accumulators share one signature. All of them
//! add into the masses buffer; the pipeline zeroes it once per
//! iteration, so tiled invocations accumulate across tiles.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use super::{build_program, BinaryOp, ClIndex, Defines, MatrixBinaryOp, ReduceVectorParcol};
use crate::cl_common;
use crate::config::StageConfig;
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

const GLOBAL_ATOMIC_SRC: &str = include_str!("cl/histogram_global_atomic.cl");
const PART_GLOBAL_SRC: &str = include_str!("cl/histogram_part_global.cl");
const PART_LOCAL_SRC: &str = include_str!("cl/histogram_part_local.cl");
const PART_PRIVATE_SRC: &str = include_str!("cl/histogram_part_private.cl");

/// Capacity of the per-work-item register file used by the
/// `part_private` strategy.
pub const PRIVATE_BUCKETS: usize = 64;

/// Strategy dispatch for the mass-update phase.
#[derive(Debug)]
pub enum MassUpdater<L: ClIndex, M: ClIndex> {
    GlobalAtomic(MassUpdateGlobalAtomic<L, M>),
    Partial(MassUpdatePartial<L, M>),
}

impl<L: ClIndex, M: ClIndex> MassUpdater<L, M> {
    pub fn prepare(context: &Context, config: &StageConfig) -> Result<MassUpdater<L, M>> {
        match config.strategy.as_str() {
            "global_atomic" => Ok(MassUpdater::GlobalAtomic(MassUpdateGlobalAtomic::prepare(
                context, config,
            )?)),
            "part_global" => Ok(MassUpdater::Partial(MassUpdatePartial::prepare(
                context,
                config,
                PartialFlavor::Global,
            )?)),
            "part_local" => Ok(MassUpdater::Partial(MassUpdatePartial::prepare(
                context,
                config,
                PartialFlavor::Local,
            )?)),
            "part_private" => Ok(MassUpdater::Partial(MassUpdatePartial::prepare(
                context,
                config,
                PartialFlavor::Private,
            )?)),
            other => Err(Error::config(format!(
                "unknown mass update strategy \"{}\"",
                other
            ))),
        }
    }

    pub fn launch(
        &mut self,
        queue: &Queue,
        num_points: usize,
        num_clusters: usize,
        labels: &Buffer<u8>,
        masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        match self {
            MassUpdater::GlobalAtomic(m) => {
                m.launch(queue, num_points, num_clusters, labels, masses, datapoint, wait)
            }
            MassUpdater::Partial(m) => {
                m.launch(queue, num_points, num_clusters, labels, masses, datapoint, wait)
            }
        }
    }
}

fn stride_variants(
    context: &Context,
    src: &str,
    defines: &Defines,
) -> Result<(Program, Program)> {
    let g_stride = build_program(context, src, defines)?;
    let l_stride = build_program(context, src, &defines.clone().flag("LOCAL_STRIDE"))?;
    Ok((g_stride, l_stride))
}

fn base_defines<L: ClIndex, M: ClIndex>(needs_atomics: bool) -> Defines {
    let mut defines = Defines::new()
        .def("CL_LABEL", L::CL_NAME)
        .def("CL_MASS", M::CL_NAME);
    if needs_atomics && M::NEEDS_64BIT_ATOMICS {
        defines = defines.flag("MASS64");
    }
    defines
}

/// Every work-item bumps `masses[labels[p]]` with a global atomic add.
#[derive(Debug)]
pub struct MassUpdateGlobalAtomic<L: ClIndex, M: ClIndex> {
    config: StageConfig,
    g_stride: Program,
    l_stride: Program,
    _marker: PhantomData<(L, M)>,
}

impl<L: ClIndex, M: ClIndex> MassUpdateGlobalAtomic<L, M> {
    pub fn prepare(
        context: &Context,
        config: &StageConfig,
    ) -> Result<MassUpdateGlobalAtomic<L, M>> {
        let defines = base_defines::<L, M>(true);
        let (g_stride, l_stride) = stride_variants(context, GLOBAL_ATOMIC_SRC, &defines)?;
        Ok(MassUpdateGlobalAtomic {
            config: config.clone(),
            g_stride,
            l_stride,
            _marker: PhantomData,
        })
    }

    pub fn launch(
        &mut self,
        queue: &Queue,
        num_points: usize,
        num_clusters: usize,
        labels: &Buffer<u8>,
        masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name("MassUpdateGlobalAtomic");

        let program = if cl_common::prefers_local_stride(&queue.device())? {
            &self.l_stride
        } else {
            &self.g_stride
        };

        let mut builder = Kernel::builder();
        builder
            .program(program)
            .name("histogram_global_atomic")
            .queue(queue.clone());
        unsafe {
            builder.disable_arg_type_check();
        }
        builder
            .arg(labels)
            .arg(masses)
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

/// Scratch-row granularity of the partial-histogram strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartialFlavor {
    /// One row per work-group, accumulated with global atomics.
    Global,
    /// One row per work-group, accumulated in local memory.
    Local,
    /// One row per work-item, accumulated in private registers.
    Private,
}

/// Partial histograms folded into the masses via the column reduction
/// and an elementwise add.
#[derive(Debug)]
pub struct MassUpdatePartial<L: ClIndex, M: ClIndex> {
    config: StageConfig,
    flavor: PartialFlavor,
    g_stride: Program,
    l_stride: Program,
    scratch: Option<Buffer<M>>,
    reduce: ReduceVectorParcol<M>,
    add: MatrixBinaryOp<M, M>,
    _marker: PhantomData<L>,
}

impl<L: ClIndex, M: ClIndex> MassUpdatePartial<L, M> {
    fn prepare(
        context: &Context,
        config: &StageConfig,
        flavor: PartialFlavor,
    ) -> Result<MassUpdatePartial<L, M>> {
        let mut defines = base_defines::<L, M>(flavor != PartialFlavor::Private);
        if flavor == PartialFlavor::Private {
            defines = defines.def("NUM_BUCKETS", PRIVATE_BUCKETS);
        }

        let src = match flavor {
            PartialFlavor::Global => PART_GLOBAL_SRC,
            PartialFlavor::Local => PART_LOCAL_SRC,
            PartialFlavor::Private => PART_PRIVATE_SRC,
        };
        let (g_stride, l_stride) = stride_variants(context, src, &defines)?;

        let partial = MassUpdatePartial {
            config: config.clone(),
            flavor,
            g_stride,
            l_stride,
            scratch: None,
            reduce: ReduceVectorParcol::prepare(context)?,
            add: MatrixBinaryOp::prepare(context, BinaryOp::Add)?,
            _marker: PhantomData,
        };
        // Fail on geometry the reduction cannot fold.
        partial.scratch_cols()?;
        Ok(partial)
    }

    /// Number of scratch rows, which becomes the reduction's column
    /// count and therefore must be a power of two.
    fn scratch_cols(&self) -> Result<usize> {
        let global = self.config.global_dims()?[0];
        let local = self.config.local_dims()?[0];
        let cols = match self.flavor {
            PartialFlavor::Global | PartialFlavor::Local => {
                if local == 0 || global % local != 0 {
                    return Err(Error::config(format!(
                        "global size {} is not a multiple of local size {}",
                        global, local
                    )));
                }
                global / local
            }
            PartialFlavor::Private => global,
        };
        if !cols.is_power_of_two() {
            return Err(Error::config(format!(
                "partial histogram row count {} is not a power of two",
                cols
            )));
        }
        Ok(cols)
    }

    pub fn launch(
        &mut self,
        queue: &Queue,
        num_points: usize,
        num_clusters: usize,
        labels: &Buffer<u8>,
        masses: &Buffer<M>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name(match self.flavor {
            PartialFlavor::Global => "MassUpdatePartGlobal",
            PartialFlavor::Local => "MassUpdatePartLocal",
            PartialFlavor::Private => "MassUpdatePartPrivate",
        });

        if self.flavor == PartialFlavor::Private && num_clusters > PRIVATE_BUCKETS {
            return Err(Error::config(format!(
                "part_private supports at most {} clusters, got {}",
                PRIVATE_BUCKETS, num_clusters
            )));
        }

        let cols = self.scratch_cols()?;
        let scratch = self.ensure_scratch(queue, cols * num_clusters)?;

        let program = if cl_common::prefers_local_stride(&queue.device())? {
            &self.l_stride
        } else {
            &self.g_stride
        };

        let name = match self.flavor {
            PartialFlavor::Global => "histogram_part_global",
            PartialFlavor::Local => "histogram_part_local",
            PartialFlavor::Private => "histogram_part_private",
        };

        let mut builder = Kernel::builder();
        builder.program(program).name(name).queue(queue.clone());
        unsafe {
            builder.disable_arg_type_check();
        }
        builder.arg(labels).arg(&scratch);
        if self.flavor == PartialFlavor::Local {
            builder.arg_local::<M>(num_clusters);
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

        let mut wait_list = EventList::new();
        wait_list.push(event.clone());

        let reduce_event = self.reduce.launch(
            queue,
            cols,
            num_clusters,
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
            num_clusters,
            masses,
            &scratch,
            &datapoint.create_child(),
            &wait_list,
        )
    }

    fn ensure_scratch(&mut self, queue: &Queue, len: usize) -> Result<Buffer<M>> {
        if let Some(buf) = &self.scratch {
            if buf.len() >= len {
                return Ok(buf.clone());
            }
        }
        let context = queue.context();
        let buf = Buffer::<M>::builder().context(&context).len(len).build()?;
        self.scratch = Some(buf.clone());
        Ok(buf)
    }
}
