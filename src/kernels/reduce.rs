//! Parallel column reduction (multi-pass fold).

use std::marker::PhantomData;

use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use super::{build_program, ClType, Defines};
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

const SRC: &str = include_str!("cl/reduce_vector_parcol.cl");
const COMPACT_KERNEL_NAME: &str = "reduce_vector_parcol_compact";
const INNER_KERNEL_NAME: &str = "reduce_vector_parcol_inner";

pub const WORKGROUP_SIZE: usize = 256;

/// Reduces a device vector of `num_cols` interleaved columns to
/// `num_rows` sums.
///
/// The vector is folded in halves (`x[i] += x[i + L/2]`) while more
/// than `2 * WORKGROUP_SIZE` elements remain, then a single work-group
/// finishes the tree. `num_cols` must be a power of two so every fold
/// preserves column membership.
#[derive(Debug)]
pub struct ReduceVectorParcol<T: ClType> {
    program: Program,
    _marker: PhantomData<T>,
}

impl<T: ClType> ReduceVectorParcol<T> {
    pub fn prepare(context: &Context) -> Result<ReduceVectorParcol<T>> {
        let mut defines = Defines::new()
            .def("CL_TYPE", T::CL_NAME)
            .def("WORKGROUP_SIZE", WORKGROUP_SIZE);
        if T::NEEDS_FP64 {
            defines = defines.flag("TYPE64");
        }
        let program = build_program(context, SRC, &defines)?;
        Ok(ReduceVectorParcol {
            program,
            _marker: PhantomData,
        })
    }

    /// Folds `data[..num_cols * num_rows]` down to indices
    /// `[0, num_rows)`. Returns the last pass's event, or `None` when
    /// the input already has its final length.
    pub fn launch(
        &self,
        queue: &Queue,
        num_cols: usize,
        num_rows: usize,
        data: &Buffer<T>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Option<Event>> {
        datapoint.set_name("ReduceVectorParcol");

        if !num_cols.is_power_of_two() {
            return Err(Error::config(format!(
                "reduction column count {} is not a power of two",
                num_cols
            )));
        }
        if data.len() < num_cols * num_rows {
            return Err(Error::consistency(format!(
                "reduction buffer holds {} elements, {} columns of {} rows need {}",
                data.len(),
                num_cols,
                num_rows,
                num_cols * num_rows
            )));
        }

        let mut data_size = num_cols * num_rows;
        let mut global_size = data_size / 2;
        let mut last_event: Option<Event> = None;
        let mut wait_list: EventList = wait.clone();

        while data_size > num_rows && data_size > 2 * WORKGROUP_SIZE {
            let kernel = self.compact_kernel(queue, data, data_size)?;
            let mut event = Event::empty();
            unsafe {
                kernel
                    .cmd()
                    .queue(queue)
                    .global_work_size(global_size)
                    .ewait(&wait_list)
                    .enew(&mut event)
                    .enq()?;
            }
            datapoint.add_event(queue, event.clone());

            wait_list = EventList::new();
            wait_list.push(event.clone());
            last_event = Some(event);

            global_size /= 2;
            data_size = global_size * 2;
        }

        if data_size > num_rows {
            let kernel = self.inner_kernel(queue, data, num_cols, num_rows)?;
            let mut event = Event::empty();
            unsafe {
                kernel
                    .cmd()
                    .queue(queue)
                    .global_work_size(data_size / 2)
                    .local_work_size(data_size / 2)
                    .ewait(&wait_list)
                    .enew(&mut event)
                    .enq()?;
            }
            datapoint.add_event(queue, event.clone());
            last_event = Some(event);
        }

        Ok(last_event)
    }

    fn compact_kernel(&self, queue: &Queue, data: &Buffer<T>, data_size: usize) -> Result<Kernel> {
        let mut builder = Kernel::builder();
        builder
            .program(&self.program)
            .name(COMPACT_KERNEL_NAME)
            .queue(queue.clone())
            .arg(data)
            .arg(data_size as u32);
        Ok(builder.build()?)
    }

    fn inner_kernel(
        &self,
        queue: &Queue,
        data: &Buffer<T>,
        num_cols: usize,
        num_rows: usize,
    ) -> Result<Kernel> {
        let mut builder = Kernel::builder();
        builder
            .program(&self.program)
            .name(INNER_KERNEL_NAME)
            .queue(queue.clone())
            .arg(data)
            .arg(num_cols as u32)
            .arg(num_rows as u32);
        Ok(builder.build()?)
    }
}
