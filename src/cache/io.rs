//! Per-queue I/O worker threads.
//!
//! Device DMA is only asynchronous against pinned host memory, so the
//! transfer path between a user's plain host array and the pinned
//! staging buffer is a host-side memcpy. Each command queue gets one
//! detached worker with a FIFO task list; a task waits on its
//! predecessor events, copies, and signals a user event that device
//! commands wait on.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use ocl::{Event, EventList};

use crate::measurement::DataPoint;

/// Raw copy endpoints. The cache guarantees both ranges stay valid
/// until the task's finish event is signalled.
pub(crate) struct IoTask {
    pub src: ConstPtr,
    pub dst: MutPtr,
    pub len: usize,
    pub wait_list: EventList,
    pub finish_event: Event,
    pub datapoint: DataPoint,
}

pub(crate) struct ConstPtr(pub *const u8);
pub(crate) struct MutPtr(pub *mut u8);

unsafe impl Send for ConstPtr {}
unsafe impl Send for MutPtr {}

type TaskQueue = Mutex<VecDeque<Option<IoTask>>>;

pub(crate) struct IoThread {
    handle: Option<JoinHandle<()>>,
    tasks: Arc<(TaskQueue, Condvar)>,
}

impl IoThread {
    pub fn launch() -> IoThread {
        let tasks: Arc<(TaskQueue, Condvar)> =
            Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let worker_tasks = Arc::clone(&tasks);
        let handle = std::thread::spawn(move || IoThread::work(&worker_tasks));
        IoThread {
            handle: Some(handle),
            tasks,
        }
    }

    /// Appends a task; `None` is the shutdown sentinel.
    pub fn push_back(&self, task: Option<IoTask>) {
        let (queue, condvar) = &*self.tasks;
        let mut guard = queue.lock().unwrap();
        guard.push_back(task);
        condvar.notify_all();
    }

    fn pop_front(tasks: &(TaskQueue, Condvar)) -> Option<IoTask> {
        let (queue, condvar) = tasks;
        let mut guard = queue.lock().unwrap();
        loop {
            if let Some(task) = guard.pop_front() {
                return task;
            }
            guard = condvar.wait(guard).unwrap();
        }
    }

    fn work(tasks: &(TaskQueue, Condvar)) {
        while let Some(task) = IoThread::pop_front(tasks) {
            if let Err(err) = task.wait_list.wait_for() {
                log::error!("io worker: waiting on predecessors failed: {}", err);
            }

            let started = Instant::now();
            unsafe {
                std::ptr::copy_nonoverlapping(task.src.0, task.dst.0, task.len);
            }
            task.datapoint.add_value(started.elapsed().as_nanos() as u64);

            if let Err(err) = task.finish_event.set_complete() {
                log::error!("io worker: completing user event failed: {}", err);
            }
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.push_back(None);
            if handle.join().is_err() {
                log::error!("io worker: thread panicked");
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.join();
    }
}
