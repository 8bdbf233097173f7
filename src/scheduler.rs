//! Single-device scheduler.
//!
//! Accepts abstract unary/binary compute tasks bound to cache object
//! ids and executes them tile by tile: for every tile index, each
//! runnable's tiles are locked through the buffer cache, its kernel
//! function is invoked, and the tiles are unlocked again. Runnables
//! execute in enqueue order within one tile index, which is the
//! happens-before edge the three-stage pipeline relies on.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};

use ocl::{Buffer, Context, Device, Event, EventList, Queue};

use crate::cache::{BufferDesc, SimpleBufferCache};
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

/// Kernel callback of a unary runnable:
/// `(queue, offset, content_length, tile, datapoint)`.
pub type UnaryKernelFn =
    Box<dyn FnMut(&Queue, usize, usize, &Buffer<u8>, &DataPoint) -> Result<Event>>;

/// Kernel callback of a binary runnable: `(queue, offset,
/// fst_content_length, snd_content_length, fst_tile, snd_tile,
/// datapoint)`.
pub type BinaryKernelFn = Box<
    dyn FnMut(&Queue, usize, usize, usize, &Buffer<u8>, &Buffer<u8>, &DataPoint) -> Result<Event>,
>;

/// Events collected by a runnable over one `run`, published at
/// teardown.
pub struct KernelEvents {
    receiver: Receiver<Vec<Event>>,
}

impl KernelEvents {
    /// Blocks until the scheduler publishes the runnable's events. An
    /// aborted run drops the channel, which reports as an error here.
    pub fn wait(self) -> Result<Vec<Event>> {
        self.receiver
            .recv()
            .map_err(|_| Error::consistency("scheduler aborted before publishing events"))
    }
}

enum Runnable {
    Unary {
        kernel_fn: UnaryKernelFn,
        object_id: u32,
        step: usize,
        datapoint: DataPoint,
        events: Vec<Event>,
        sender: Sender<Vec<Event>>,
        active: Vec<BufferDesc>,
    },
    Binary {
        kernel_fn: BinaryKernelFn,
        fst_object_id: u32,
        snd_object_id: u32,
        fst_step: usize,
        snd_step: usize,
        datapoint: DataPoint,
        events: Vec<Event>,
        sender: Sender<Vec<Event>>,
        fst_active: Vec<BufferDesc>,
        snd_active: Vec<BufferDesc>,
    },
}

impl Runnable {
    fn tile_count(&self, cache: &SimpleBufferCache) -> Result<usize> {
        match self {
            Runnable::Unary { object_id, step, .. } => {
                let len = cache.object_len(*object_id)?;
                Ok((len + step - 1) / step)
            }
            Runnable::Binary {
                fst_object_id,
                snd_object_id,
                fst_step,
                snd_step,
                ..
            } => {
                let fst_len = cache.object_len(*fst_object_id)?;
                let snd_len = cache.object_len(*snd_object_id)?;
                let fst_n = (fst_len + fst_step - 1) / fst_step;
                let snd_n = (snd_len + snd_step - 1) / snd_step;
                if fst_n != snd_n {
                    return Err(Error::consistency(format!(
                        "binary runnable tiles disagree: {} vs {}",
                        fst_n, snd_n
                    )));
                }
                Ok(fst_n)
            }
        }
    }

    fn max_step(&self) -> usize {
        match self {
            Runnable::Unary { step, .. } => *step,
            Runnable::Binary {
                fst_step, snd_step, ..
            } => (*fst_step).max(*snd_step),
        }
    }

    fn run_tile(
        &mut self,
        queue: &Queue,
        cache: &mut SimpleBufferCache,
        index: usize,
    ) -> Result<()> {
        let no_deps = EventList::new();
        match self {
            Runnable::Unary {
                kernel_fn,
                object_id,
                step,
                datapoint,
                events,
                active,
                ..
            } => {
                let len = cache.object_len(*object_id)?;
                let begin = *step * index;
                let end = (begin + *step).min(len);

                let (buffers, transfer) = cache.get(
                    queue,
                    *object_id,
                    begin,
                    end,
                    &no_deps,
                    &datapoint.create_child(),
                )?;
                if let Some(event) = transfer {
                    events.push(event);
                }

                // Transfer and kernel share an in-order queue, which
                // orders them without an explicit wait list.
                let desc = &buffers[0];
                let event = kernel_fn(queue, 0, desc.content_length, &desc.buffer, datapoint)?;
                events.push(event);
                *active = buffers;
                Ok(())
            }
            Runnable::Binary {
                kernel_fn,
                fst_object_id,
                snd_object_id,
                fst_step,
                snd_step,
                datapoint,
                events,
                fst_active,
                snd_active,
                ..
            } => {
                let fst_len = cache.object_len(*fst_object_id)?;
                let snd_len = cache.object_len(*snd_object_id)?;
                let fst_begin = *fst_step * index;
                let snd_begin = *snd_step * index;
                let fst_end = (fst_begin + *fst_step).min(fst_len);
                let snd_end = (snd_begin + *snd_step).min(snd_len);

                let (fst_buffers, fst_transfer) = cache.get(
                    queue,
                    *fst_object_id,
                    fst_begin,
                    fst_end,
                    &no_deps,
                    &datapoint.create_child(),
                )?;
                if let Some(event) = fst_transfer {
                    events.push(event);
                }
                let (snd_buffers, snd_transfer) = cache.get(
                    queue,
                    *snd_object_id,
                    snd_begin,
                    snd_end,
                    &no_deps,
                    &datapoint.create_child(),
                )?;
                if let Some(event) = snd_transfer {
                    events.push(event);
                }

                let fst_desc = &fst_buffers[0];
                let snd_desc = &snd_buffers[0];
                let event = kernel_fn(
                    queue,
                    0,
                    fst_desc.content_length,
                    snd_desc.content_length,
                    &fst_desc.buffer,
                    &snd_desc.buffer,
                    datapoint,
                )?;
                events.push(event);
                *fst_active = fst_buffers;
                *snd_active = snd_buffers;
                Ok(())
            }
        }
    }

    fn finish_tile(&mut self, queue: &Queue, cache: &mut SimpleBufferCache) -> Result<()> {
        match self {
            Runnable::Unary {
                object_id,
                datapoint,
                active,
                ..
            } => {
                cache.unlock(queue, *object_id, active, &datapoint.create_child())?;
                active.clear();
                Ok(())
            }
            Runnable::Binary {
                fst_object_id,
                snd_object_id,
                datapoint,
                fst_active,
                snd_active,
                ..
            } => {
                cache.unlock(queue, *fst_object_id, fst_active, &datapoint.create_child())?;
                fst_active.clear();
                cache.unlock(queue, *snd_object_id, snd_active, &datapoint.create_child())?;
                snd_active.clear();
                Ok(())
            }
        }
    }

    fn teardown(&mut self) {
        let (events, sender) = match self {
            Runnable::Unary { events, sender, .. } => (std::mem::take(events), sender),
            Runnable::Binary { events, sender, .. } => (std::mem::take(events), sender),
        };
        // The receiver may have been dropped by an uninterested caller.
        let _ = sender.send(events);
    }
}

/// The scheduler described in the module docs. Owns the buffer cache
/// and two profiling command queues (primary plus shadow) per
/// attached device.
#[derive(Default)]
pub struct SingleDeviceScheduler {
    buffer_cache: Option<SimpleBufferCache>,
    queues: Vec<Queue>,
    run_queue: VecDeque<Runnable>,
}

impl SingleDeviceScheduler {
    pub fn new() -> SingleDeviceScheduler {
        SingleDeviceScheduler::default()
    }

    pub fn attach_buffer_cache(&mut self, cache: SimpleBufferCache) {
        self.buffer_cache = Some(cache);
    }

    pub fn buffer_cache(&self) -> Option<&SimpleBufferCache> {
        self.buffer_cache.as_ref()
    }

    pub fn buffer_cache_mut(&mut self) -> Option<&mut SimpleBufferCache> {
        self.buffer_cache.as_mut()
    }

    /// Registers the device's queue pair. Only one device is supported
    /// per scheduler instance.
    pub fn attach_device(&mut self, context: &Context, device: Device) -> Result<()> {
        if !self.queues.is_empty() {
            return Err(Error::resource(
                "single-device scheduler already has a device attached",
            ));
        }
        let properties = Some(ocl::flags::CommandQueueProperties::new().profiling());
        self.queues.push(Queue::new(context, device, properties)?);
        self.queues.push(Queue::new(context, device, properties)?);
        Ok(())
    }

    /// The primary queue of the attached device.
    pub fn queue(&self) -> Result<&Queue> {
        self.queues
            .first()
            .ok_or_else(|| Error::resource("no device attached to the scheduler"))
    }

    pub fn enqueue_unary(
        &mut self,
        kernel_fn: UnaryKernelFn,
        object_id: u32,
        step: usize,
        datapoint: DataPoint,
    ) -> Result<KernelEvents> {
        self.check_step(step)?;
        let (sender, receiver) = channel();
        self.run_queue.push_back(Runnable::Unary {
            kernel_fn,
            object_id,
            step,
            datapoint,
            events: Vec::new(),
            sender,
            active: Vec::new(),
        });
        Ok(KernelEvents { receiver })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_binary(
        &mut self,
        kernel_fn: BinaryKernelFn,
        fst_object_id: u32,
        snd_object_id: u32,
        fst_step: usize,
        snd_step: usize,
        datapoint: DataPoint,
    ) -> Result<KernelEvents> {
        self.check_step(fst_step)?;
        self.check_step(snd_step)?;
        let (sender, receiver) = channel();
        self.run_queue.push_back(Runnable::Binary {
            kernel_fn,
            fst_object_id,
            snd_object_id,
            fst_step,
            snd_step,
            datapoint,
            events: Vec::new(),
            sender,
            fst_active: Vec::new(),
            snd_active: Vec::new(),
        });
        Ok(KernelEvents { receiver })
    }

    /// Barriers between runnables are not supported; within one tile
    /// index, enqueue order on the shared queue already serializes the
    /// runnables.
    pub fn enqueue_barrier(&mut self) -> Result<()> {
        Err(Error::config("barrier runnables are not supported"))
    }

    /// Executes all enqueued runnables tile by tile. On failure,
    /// dispatch stops, already-submitted work is drained and the first
    /// error is returned; pending event logs are dropped.
    pub fn run(&mut self) -> Result<()> {
        let cache = self
            .buffer_cache
            .as_mut()
            .ok_or_else(|| Error::resource("no buffer cache attached to the scheduler"))?;
        if self.queues.is_empty() {
            return Err(Error::resource("no device attached to the scheduler"));
        }

        let mut num_tiles = 0usize;
        for runnable in &self.run_queue {
            if runnable.max_step() > cache.buffer_size() {
                return Err(Error::alignment(format!(
                    "step {} exceeds the {}-byte buffer size",
                    runnable.max_step(),
                    cache.buffer_size()
                )));
            }
            let n = runnable.tile_count(cache)?;
            if num_tiles == 0 {
                num_tiles = n;
            } else if n != num_tiles {
                log::error!(
                    "run: runnables disagree on tile count ({} vs {})",
                    num_tiles,
                    n
                );
                return Err(Error::consistency(
                    "runnables request different tile counts",
                ));
            }
        }

        // The queue pair exists for pipelining; dispatch stays on the
        // primary queue.
        let queue = &self.queues[0];

        let mut dispatch: Result<()> = Ok(());
        'tiles: for index in 0..num_tiles {
            for runnable in self.run_queue.iter_mut() {
                if let Err(err) = runnable
                    .run_tile(queue, cache, index)
                    .and_then(|_| runnable.finish_tile(queue, cache))
                {
                    dispatch = Err(err);
                    break 'tiles;
                }
            }
        }

        if dispatch.is_ok() {
            for runnable in self.run_queue.iter_mut() {
                runnable.teardown();
            }
        }

        for queue in &self.queues {
            if let Err(err) = queue.finish() {
                log::error!("run: draining queue failed: {}", err);
                if dispatch.is_ok() {
                    dispatch = Err(err.into());
                }
            }
        }

        self.run_queue.clear();
        dispatch
    }

    fn check_step(&self, step: usize) -> Result<()> {
        if step == 0 {
            return Err(Error::alignment("step must be nonzero"));
        }
        if let Some(cache) = &self.buffer_cache {
            if step > cache.buffer_size() {
                return Err(Error::alignment(format!(
                    "step {} exceeds the {}-byte buffer size",
                    step,
                    cache.buffer_size()
                )));
            }
        }
        Ok(())
    }
}
