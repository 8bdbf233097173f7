//! Tiled buffer cache.
//!
//! Maps host-resident data objects onto a fixed pool of buffer-sized
//! device slots, with locking, eviction and asynchronous host/device
//! transfer. Two slots are reserved per object id so the scheduler can
//! hold one tile while the next is prefetched.

mod io;

use std::collections::HashMap;

use ocl::flags::MemFlags;
use ocl::{Buffer, Context, Device, Event, EventList, Queue};

use crate::cl_common;
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

use self::io::{ConstPtr, IoTask, IoThread, MutPtr};

/// Whether CPU devices bypass staging and wrap the host object
/// directly as a device buffer.
const CPU_ZERO_COPY: bool = true;

/// How objects are treated on access and cache eviction.
///
/// `ReadWrite`: copied to device on access, written back on eviction.
/// `ReadOnly`: copied to device on access, dropped on eviction.
/// `Transient`: instantiated on device, dropped on eviction. Useful
/// for intermediates that only live while locked in cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectMode {
    ReadWrite,
    ReadOnly,
    Transient,
}

/// A locked device buffer handed out by the cache.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub buffer: Buffer<u8>,
    pub content_length: usize,
    /// Byte offset of the tile within its object.
    pub buffer_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotLock {
    Free,
    Read(u32),
    Write,
}

#[derive(Debug)]
struct SlotState {
    lock: SlotLock,
    object_id: Option<u32>,
    offset: usize,
    content_length: usize,
}

impl SlotState {
    fn empty() -> SlotState {
        SlotState {
            lock: SlotLock::Free,
            object_id: None,
            offset: 0,
            content_length: 0,
        }
    }
}

struct DeviceEntry {
    context: Context,
    device: Device,
    pool_size: usize,
    num_slots: usize,
    zero_copy: bool,
    slots: Vec<SlotState>,
    device_buffers: Vec<Option<Buffer<u8>>>,
    staging_buffers: Vec<Option<Buffer<u8>>>,
    // Maps are held for the cache's lifetime; the pointers below stay
    // valid as long as their entry exists.
    #[allow(dead_code)]
    staging_maps: Vec<Option<ocl::MemMap<u8>>>,
    staging_ptrs: Vec<*mut u8>,
}

struct ObjectInfo {
    ptr: *mut u8,
    len: usize,
    mode: ObjectMode,
}

/// Double-buffering: two slots per object id.
const SLOTS_PER_OBJECT: usize = 2;

/// The cache described in the module docs. One instance serves one
/// scheduler; concurrent schedulers sharing a cache are unsupported.
pub struct SimpleBufferCache {
    buffer_size: usize,
    // Declared before the device entries: dropping the cache must join
    // the workers while the staging maps they write through are still
    // alive.
    io_threads: HashMap<usize, IoThread>,
    devices: Vec<DeviceEntry>,
    objects: Vec<ObjectInfo>,
}

impl SimpleBufferCache {
    pub fn new(buffer_size: usize) -> SimpleBufferCache {
        SimpleBufferCache {
            buffer_size,
            io_threads: HashMap::new(),
            devices: Vec::new(),
            // Object id 0 is reserved and invalid.
            objects: vec![ObjectInfo {
                ptr: std::ptr::null_mut(),
                len: 0,
                mode: ObjectMode::ReadOnly,
            }],
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn pool_size(&self, device: &Device) -> Option<usize> {
        self.find_device(device).map(|i| self.devices[i].pool_size)
    }

    /// Registers a device with `pool_size` bytes of slot memory.
    /// `pool_size` must exceed two buffers, so every object can be
    /// double-buffered.
    pub fn add_device(
        &mut self,
        context: &Context,
        device: Device,
        pool_size: usize,
    ) -> Result<()> {
        if pool_size <= self.buffer_size * SLOTS_PER_OBJECT {
            return Err(Error::resource(format!(
                "pool of {} bytes cannot double-buffer {}-byte tiles",
                pool_size, self.buffer_size
            )));
        }
        if self.find_device(&device).is_some() {
            return Err(Error::resource("device already registered"));
        }

        let num_slots = pool_size / self.buffer_size;
        let zero_copy = CPU_ZERO_COPY && cl_common::is_cpu(&device)?;

        let mut entry = DeviceEntry {
            context: context.clone(),
            device,
            pool_size,
            num_slots,
            zero_copy,
            slots: (0..num_slots).map(|_| SlotState::empty()).collect(),
            device_buffers: (0..num_slots).map(|_| None).collect(),
            staging_buffers: (0..num_slots).map(|_| None).collect(),
            staging_maps: (0..num_slots).map(|_| None).collect(),
            staging_ptrs: vec![std::ptr::null_mut(); num_slots],
        };

        // CPU buffers are bound on demand (zero copy); other devices
        // get their pool and pinned staging area up front.
        if !zero_copy {
            let queue = Queue::new(context, entry.device, None)?;
            for slot in 0..num_slots {
                let device_buffer = Buffer::<u8>::builder()
                    .context(context)
                    .len(self.buffer_size)
                    .build()?;
                entry.device_buffers[slot] = Some(device_buffer);

                let staging = Buffer::<u8>::builder()
                    .context(context)
                    .len(self.buffer_size)
                    .flags(MemFlags::new().read_write().alloc_host_ptr())
                    .build()?;
                let mut map = unsafe {
                    staging
                        .map()
                        .queue(&queue)
                        .write_invalidate()
                        .len(self.buffer_size)
                        .enq()?
                };
                entry.staging_ptrs[slot] = map.as_mut_ptr();
                entry.staging_maps[slot] = Some(map);
                entry.staging_buffers[slot] = Some(staging);
            }
            queue.finish()?;
        }

        self.devices.push(entry);
        Ok(())
    }

    /// Registers a host address range. The cache borrows the range; it
    /// never copies or frees it.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must stay valid and unaliased by other writers
    /// until the cache is dropped (or the registration is abandoned
    /// and all queues drained).
    pub unsafe fn add_object(
        &mut self,
        ptr: *mut u8,
        len: usize,
        mode: ObjectMode,
    ) -> Result<u32> {
        if ptr.is_null() || len == 0 {
            return Err(Error::resource("cannot register an empty object"));
        }
        let oid = self.objects.len() as u32;
        self.objects.push(ObjectInfo { ptr, len, mode });
        Ok(oid)
    }

    /// Pointer and length of a registered object.
    pub fn object(&self, object_id: u32) -> Result<(*mut u8, usize)> {
        let info = self.object_info(object_id)?;
        Ok((info.ptr, info.len))
    }

    pub fn object_len(&self, object_id: u32) -> Result<usize> {
        Ok(self.object_info(object_id)?.len)
    }

    /// Acquires a read lock on the slot caching `[begin, end)` of the
    /// object, transferring the range to the device first if needed.
    /// Returns the locked buffer descriptors and the transfer
    /// completion event, if a transfer was scheduled.
    pub fn get(
        &mut self,
        queue: &Queue,
        object_id: u32,
        begin: usize,
        end: usize,
        wait_list: &EventList,
        datapoint: &DataPoint,
    ) -> Result<(Vec<BufferDesc>, Option<Event>)> {
        datapoint.set_name("BufferCache::get");

        let size = self.check_range(object_id, begin, end)?;
        let device_id = self.find_queue_device(queue)?;

        let slot = match self.find_cache_slot(device_id, object_id, begin) {
            Some(slot) => slot,
            None => {
                return self.write_and_get(
                    queue,
                    object_id,
                    begin,
                    end,
                    wait_list,
                    &datapoint.create_child(),
                );
            }
        };

        self.try_read_lock(device_id, slot)?;
        let entry = &self.devices[device_id];
        let buffer = match &entry.device_buffers[slot] {
            Some(b) => b.clone(),
            None => {
                return Err(Error::consistency(format!(
                    "slot {} cached without a bound device buffer",
                    slot
                )))
            }
        };

        Ok((
            vec![BufferDesc {
                buffer,
                content_length: size,
                buffer_id: begin,
            }],
            None,
        ))
    }

    /// Allocates (evicting if necessary) a slot for `[begin, end)`,
    /// write-locks it and schedules the host-to-device transfer.
    pub fn write_and_get(
        &mut self,
        queue: &Queue,
        object_id: u32,
        begin: usize,
        end: usize,
        wait_list: &EventList,
        datapoint: &DataPoint,
    ) -> Result<(Vec<BufferDesc>, Option<Event>)> {
        datapoint.set_name("BufferCache::write_and_get");

        let size = self.check_range(object_id, begin, end)?;
        let device_id = self.find_queue_device(queue)?;
        let slot = self.assign_cache_slot(device_id, object_id)?;

        self.try_write_lock(device_id, slot)?;
        self.evict_cache_slot(queue, device_id, slot, wait_list, &datapoint.create_child())?;

        let mode = self.object_info(object_id)?.mode;
        let (obj_ptr, _) = self.object(object_id)?;

        let entry = &mut self.devices[device_id];
        entry.slots[slot].object_id = Some(object_id);
        entry.slots[slot].offset = begin;
        entry.slots[slot].content_length = size;

        if entry.zero_copy {
            // Bind the host range directly; no transfer happens.
            let host_slice = unsafe { std::slice::from_raw_parts(obj_ptr.add(begin), size) };
            let buffer = unsafe {
                Buffer::<u8>::new(
                    &entry.context,
                    MemFlags::new().read_write().use_host_ptr(),
                    size,
                    Some(host_slice),
                )?
            };
            entry.device_buffers[slot] = Some(buffer.clone());

            return Ok((
                vec![BufferDesc {
                    buffer,
                    content_length: size,
                    buffer_id: begin,
                }],
                None,
            ));
        }

        let device_buffer = match &entry.device_buffers[slot] {
            Some(b) => b.clone(),
            None => return Err(Error::consistency("staged slot without device buffer")),
        };
        let staging_buffer = match &entry.staging_buffers[slot] {
            Some(b) => b.clone(),
            None => return Err(Error::consistency("staged slot without staging buffer")),
        };
        let staging_ptr = entry.staging_ptrs[slot];

        let desc = BufferDesc {
            buffer: device_buffer.clone(),
            content_length: size,
            buffer_id: begin,
        };

        if mode == ObjectMode::Transient {
            // Nothing to transfer; holding the lock is enough.
            return Ok((vec![desc], None));
        }

        // Host array -> staging on the I/O worker, then staging ->
        // device once the worker signals.
        let upload_ready = Event::user(&self.devices[device_id].context)?;
        let task = IoTask {
            src: ConstPtr(unsafe { obj_ptr.add(begin) }),
            dst: MutPtr(staging_ptr),
            len: size,
            wait_list: wait_list.clone(),
            finish_event: upload_ready.clone(),
            datapoint: datapoint.clone(),
        };
        self.io_thread(queue).push_back(Some(task));

        let mut upload_wait = EventList::new();
        upload_wait.push(upload_ready);

        let mut transfer_event = Event::empty();
        staging_buffer
            .cmd()
            .queue(queue)
            .copy(&device_buffer, Some(0), Some(size))
            .ewait(&upload_wait)
            .enew(&mut transfer_event)
            .enq()?;
        datapoint.add_event(queue, transfer_event.clone());

        Ok((vec![desc], Some(transfer_event)))
    }

    /// Schedules an asynchronous device-to-host write-back of the
    /// cached range. A no-op (returning `None`) for objects that are
    /// not `ReadWrite` or ranges that are not cached.
    pub fn read(
        &mut self,
        queue: &Queue,
        object_id: u32,
        begin: usize,
        end: usize,
        wait_list: &EventList,
        datapoint: &DataPoint,
    ) -> Result<Option<Event>> {
        datapoint.set_name("BufferCache::read");

        let size = self.check_range(object_id, begin, end)?;
        let device_id = self.find_queue_device(queue)?;

        if self.object_info(object_id)?.mode != ObjectMode::ReadWrite {
            return Ok(None);
        }
        let slot = match self.find_cache_slot(device_id, object_id, begin) {
            Some(slot) => slot,
            None => return Ok(None),
        };

        let entry = &self.devices[device_id];
        if entry.slots[slot].content_length > size {
            return Err(Error::consistency(format!(
                "cannot read {} bytes of a {}-byte cached range",
                size, entry.slots[slot].content_length
            )));
        }
        if entry.zero_copy {
            // The device buffer is the host memory.
            return Ok(None);
        }

        let device_buffer = match &entry.device_buffers[slot] {
            Some(b) => b.clone(),
            None => return Err(Error::consistency("cached slot without device buffer")),
        };
        let staging_buffer = match &entry.staging_buffers[slot] {
            Some(b) => b.clone(),
            None => return Err(Error::consistency("cached slot without staging buffer")),
        };
        let staging_ptr = entry.staging_ptrs[slot];
        let (obj_ptr, _) = self.object(object_id)?;

        // Device -> staging, then staging -> host array on the worker.
        let mut read_event = Event::empty();
        device_buffer
            .cmd()
            .queue(queue)
            .copy(&staging_buffer, Some(0), Some(size))
            .ewait(wait_list)
            .enew(&mut read_event)
            .enq()?;
        datapoint.add_event(queue, read_event.clone());

        let downloaded = Event::user(&self.devices[device_id].context)?;
        let mut task_wait = EventList::new();
        task_wait.push(read_event);
        let task = IoTask {
            src: ConstPtr(staging_ptr as *const u8),
            dst: MutPtr(unsafe { obj_ptr.add(begin) }),
            len: size,
            wait_list: task_wait,
            finish_event: downloaded.clone(),
            datapoint: datapoint.clone(),
        };
        self.io_thread(queue).push_back(Some(task));

        let mut marker_wait = EventList::new();
        marker_wait.push(downloaded);
        let finish = queue.enqueue_marker(Some(&marker_wait))?;
        Ok(Some(finish))
    }

    /// Releases the locks acquired by `get`/`write_and_get`.
    pub fn unlock(
        &mut self,
        queue: &Queue,
        object_id: u32,
        buffers: &[BufferDesc],
        datapoint: &DataPoint,
    ) -> Result<()> {
        datapoint.set_name("BufferCache::unlock");

        let device_id = self.find_queue_device(queue)?;
        if buffers.is_empty() {
            return Err(Error::consistency("unlock: empty buffer list"));
        }

        for desc in buffers {
            let slot = match self.find_cache_slot(device_id, object_id, desc.buffer_id) {
                Some(slot) => slot,
                None => {
                    log::error!(
                        "unlock: no slot caches object {} offset {} on device {}",
                        object_id,
                        desc.buffer_id,
                        device_id
                    );
                    return Err(Error::resource("unlock: range is not cached"));
                }
            };

            let lock = &mut self.devices[device_id].slots[slot].lock;
            *lock = match *lock {
                SlotLock::Read(1) | SlotLock::Write => SlotLock::Free,
                SlotLock::Read(n) if n > 1 => SlotLock::Read(n - 1),
                _ => {
                    return Err(Error::consistency(format!(
                        "unlock: slot {} is not locked",
                        slot
                    )))
                }
            };
        }

        Ok(())
    }

    /// Number of slots currently locked on any device. Zero after a
    /// balanced sequence of get/unlock calls.
    pub fn locked_slots(&self) -> usize {
        self.devices
            .iter()
            .flat_map(|d| d.slots.iter())
            .filter(|s| s.lock != SlotLock::Free)
            .count()
    }

    fn object_info(&self, object_id: u32) -> Result<&ObjectInfo> {
        if object_id == 0 || object_id as usize >= self.objects.len() {
            return Err(Error::resource(format!(
                "object id {} is not registered",
                object_id
            )));
        }
        Ok(&self.objects[object_id as usize])
    }

    /// Validates a range against the object bounds, the buffer size
    /// and the tile alignment. Returns the range length.
    fn check_range(&self, object_id: u32, begin: usize, end: usize) -> Result<usize> {
        let info = self.object_info(object_id)?;
        if begin >= end || end > info.len {
            return Err(Error::alignment(format!(
                "range [{}, {}) escapes object {} of {} bytes",
                begin, end, object_id, info.len
            )));
        }
        let size = end - begin;
        if size > self.buffer_size {
            return Err(Error::alignment(format!(
                "range of {} bytes exceeds the {}-byte buffer size",
                size, self.buffer_size
            )));
        }
        if begin % self.buffer_size != 0 {
            return Err(Error::alignment(format!(
                "range start {} is not aligned to the {}-byte buffer size",
                begin, self.buffer_size
            )));
        }
        Ok(size)
    }

    fn find_device(&self, device: &Device) -> Option<usize> {
        self.devices.iter().position(|d| d.device == *device)
    }

    fn find_queue_device(&self, queue: &Queue) -> Result<usize> {
        self.find_device(&queue.device())
            .ok_or_else(|| Error::resource("queue's device is not registered with the cache"))
    }

    fn find_cache_slot(&self, device_id: usize, object_id: u32, offset: usize) -> Option<usize> {
        self.devices[device_id]
            .slots
            .iter()
            .position(|s| s.object_id == Some(object_id) && s.offset == offset)
    }

    /// Double-buffered slot assignment: object o owns slots 2(o-1) and
    /// 2(o-1)+1; whichever is free wins.
    fn assign_cache_slot(&self, device_id: usize, object_id: u32) -> Result<usize> {
        let entry = &self.devices[device_id];
        let base = (object_id as usize - 1) * SLOTS_PER_OBJECT;
        if base + 1 >= entry.num_slots {
            return Err(Error::resource(format!(
                "object {} needs slots {}..{} but device {} has {}",
                object_id,
                base,
                base + 2,
                device_id,
                entry.num_slots
            )));
        }

        let slot = if entry.slots[base].lock == SlotLock::Free {
            base
        } else {
            base + 1
        };
        if entry.slots[slot].lock != SlotLock::Free {
            log::error!(
                "assign_cache_slot: no free slot for object {} on device {}",
                object_id,
                device_id
            );
            return Err(Error::resource("no free cache slot"));
        }
        Ok(slot)
    }

    fn try_read_lock(&mut self, device_id: usize, slot: usize) -> Result<()> {
        let lock = &mut self.devices[device_id].slots[slot].lock;
        *lock = match *lock {
            SlotLock::Free => SlotLock::Read(1),
            SlotLock::Read(n) => SlotLock::Read(n + 1),
            SlotLock::Write => {
                return Err(Error::resource(format!(
                    "slot {} is write-locked",
                    slot
                )))
            }
        };
        Ok(())
    }

    fn try_write_lock(&mut self, device_id: usize, slot: usize) -> Result<()> {
        let lock = &mut self.devices[device_id].slots[slot].lock;
        if *lock != SlotLock::Free {
            return Err(Error::resource(format!(
                "slot {} is locked and cannot be reassigned",
                slot
            )));
        }
        *lock = SlotLock::Write;
        Ok(())
    }

    /// Makes a slot reusable. Empty and immutable slots are cleared in
    /// place; dirty `ReadWrite` content is written back first, waiting
    /// on the write-back before the slot is handed out again.
    fn evict_cache_slot(
        &mut self,
        queue: &Queue,
        device_id: usize,
        slot: usize,
        wait_list: &EventList,
        datapoint: &DataPoint,
    ) -> Result<()> {
        datapoint.set_name("BufferCache::evict_cache_slot");

        let (old_object, old_offset, old_length) = {
            let state = &self.devices[device_id].slots[slot];
            (state.object_id, state.offset, state.content_length)
        };

        let old_object = match old_object {
            None => return Ok(()),
            Some(oid) => oid,
        };

        let mode = self.object_info(old_object)?.mode;
        if mode == ObjectMode::ReadWrite && !self.devices[device_id].zero_copy {
            // The lock for the new tenant is already held, which is
            // fine: read() only touches the slot's buffers.
            let event = self.read(
                queue,
                old_object,
                old_offset,
                old_offset + old_length,
                wait_list,
                &datapoint.create_child(),
            )?;
            if let Some(event) = event {
                event.wait_for()?;
            }
        }

        let state = &mut self.devices[device_id].slots[slot];
        state.object_id = None;
        state.offset = 0;
        state.content_length = 0;
        Ok(())
    }

    fn io_thread(&mut self, queue: &Queue) -> &IoThread {
        let key = queue.as_core().as_ptr() as usize;
        self.io_threads
            .entry(key)
            .or_insert_with(IoThread::launch)
    }
}
