use ocl::EventList;

use super::cl_setup;
use crate::cache::{ObjectMode, SimpleBufferCache};
use crate::measurement::DataPoint;

const BUFFER_SIZE: usize = 64 << 10;
const POOL_SIZE: usize = 16 * BUFFER_SIZE;
const OBJECT_SIZE: usize = 4 * BUFFER_SIZE;

struct Fixture {
    cache: SimpleBufferCache,
    queue: ocl::Queue,
    data: Vec<u8>,
    oid: u32,
}

fn fixture() -> Option<Fixture> {
    let (context, queue, device) = cl_setup()?;
    let mut cache = SimpleBufferCache::new(BUFFER_SIZE);
    cache.add_device(&context, device, POOL_SIZE).unwrap();

    let mut data = vec![0u8; OBJECT_SIZE];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    let oid = unsafe {
        cache
            .add_object(data.as_mut_ptr(), data.len(), ObjectMode::ReadWrite)
            .unwrap()
    };
    Some(Fixture {
        cache,
        queue,
        data,
        oid,
    })
}

#[test]
fn retrieve_object() {
    let Some(mut fx) = fixture() else { return };
    let (ptr, len) = fx.cache.object(fx.oid).unwrap();
    assert_eq!(ptr, fx.data.as_mut_ptr());
    assert_eq!(len, OBJECT_SIZE);
}

#[test]
fn sizes() {
    let Some(fx) = fixture() else { return };
    assert_eq!(fx.cache.buffer_size(), BUFFER_SIZE);
    assert_eq!(fx.cache.pool_size(&fx.queue.device()), Some(POOL_SIZE));
}

#[test]
fn rejects_invalid_object_ids() {
    let Some(mut fx) = fixture() else { return };
    let wl = EventList::new();
    let dp = DataPoint::detached();
    assert!(fx
        .cache
        .get(&fx.queue, 0, 0, BUFFER_SIZE, &wl, &dp)
        .is_err());
    assert!(fx
        .cache
        .get(&fx.queue, 99, 0, BUFFER_SIZE, &wl, &dp)
        .is_err());
}

#[test]
fn rejects_bad_ranges() {
    let Some(mut fx) = fixture() else { return };
    let wl = EventList::new();
    let dp = DataPoint::detached();
    // Longer than one buffer.
    assert!(fx
        .cache
        .get(&fx.queue, fx.oid, 0, 2 * BUFFER_SIZE, &wl, &dp)
        .is_err());
    // Misaligned start.
    assert!(fx
        .cache
        .get(&fx.queue, fx.oid, 1, BUFFER_SIZE, &wl, &dp)
        .is_err());
    // Escapes the object.
    assert!(fx
        .cache
        .get(
            &fx.queue,
            fx.oid,
            OBJECT_SIZE - BUFFER_SIZE,
            OBJECT_SIZE + 1,
            &wl,
            &dp
        )
        .is_err());
}

#[test]
fn write_and_get_returns_content() {
    let Some(mut fx) = fixture() else { return };
    let wl = EventList::new();
    let dp = DataPoint::detached();

    let (buffers, event) = fx
        .cache
        .write_and_get(&fx.queue, fx.oid, 0, BUFFER_SIZE, &wl, &dp)
        .unwrap();
    if let Some(event) = event {
        event.wait_for().unwrap();
    }
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].content_length, BUFFER_SIZE);

    fx.cache.unlock(&fx.queue, fx.oid, &buffers, &dp).unwrap();
    assert_eq!(fx.cache.locked_slots(), 0);
}

#[test]
fn write_then_read_round_trips() {
    let Some(mut fx) = fixture() else { return };
    let wl = EventList::new();
    let dp = DataPoint::detached();

    let (buffers, event) = fx
        .cache
        .write_and_get(&fx.queue, fx.oid, 0, BUFFER_SIZE, &wl, &dp)
        .unwrap();
    if let Some(event) = event {
        event.wait_for().unwrap();
    }

    // Overwrite the cached tile on the device, then read it back into
    // the host object.
    buffers[0]
        .buffer
        .cmd()
        .queue(&fx.queue)
        .fill(0xabu8, Some(BUFFER_SIZE))
        .enq()
        .unwrap();
    fx.queue.finish().unwrap();

    fx.cache.unlock(&fx.queue, fx.oid, &buffers, &dp).unwrap();

    let event = fx
        .cache
        .read(&fx.queue, fx.oid, 0, BUFFER_SIZE, &wl, &dp)
        .unwrap();
    if let Some(event) = event {
        event.wait_for().unwrap();
    }
    fx.queue.finish().unwrap();

    assert!(fx.data[..BUFFER_SIZE].iter().all(|&b| b == 0xab));
    // Bytes past the tile are untouched.
    assert_eq!(fx.data[BUFFER_SIZE], (BUFFER_SIZE % 251) as u8);
}

#[test]
fn double_buffering_two_tiles_then_exhaustion() {
    let Some(mut fx) = fixture() else { return };
    let wl = EventList::new();
    let dp = DataPoint::detached();

    let (first, e1) = fx
        .cache
        .get(&fx.queue, fx.oid, 0, BUFFER_SIZE, &wl, &dp)
        .unwrap();
    let (second, e2) = fx
        .cache
        .get(&fx.queue, fx.oid, BUFFER_SIZE, 2 * BUFFER_SIZE, &wl, &dp)
        .unwrap();
    for event in [e1, e2].into_iter().flatten() {
        event.wait_for().unwrap();
    }

    // Both reserved slots are locked; a third concurrent tile cannot
    // be placed.
    assert!(fx
        .cache
        .get(&fx.queue, fx.oid, 2 * BUFFER_SIZE, 3 * BUFFER_SIZE, &wl, &dp)
        .is_err());

    fx.cache.unlock(&fx.queue, fx.oid, &first, &dp).unwrap();

    let (third, e3) = fx
        .cache
        .get(&fx.queue, fx.oid, 2 * BUFFER_SIZE, 3 * BUFFER_SIZE, &wl, &dp)
        .unwrap();
    if let Some(event) = e3 {
        event.wait_for().unwrap();
    }

    fx.cache.unlock(&fx.queue, fx.oid, &second, &dp).unwrap();
    fx.cache.unlock(&fx.queue, fx.oid, &third, &dp).unwrap();
    assert_eq!(fx.cache.locked_slots(), 0);
}

#[test]
fn read_locks_are_counting() {
    let Some(mut fx) = fixture() else { return };
    let wl = EventList::new();
    let dp = DataPoint::detached();

    // Populate the slot, then release the transfer's write lock.
    let (populate, event) = fx
        .cache
        .write_and_get(&fx.queue, fx.oid, 0, BUFFER_SIZE, &wl, &dp)
        .unwrap();
    if let Some(event) = event {
        event.wait_for().unwrap();
    }
    fx.cache.unlock(&fx.queue, fx.oid, &populate, &dp).unwrap();

    // Cached gets take read locks, which compose on the same slot.
    let (first, e1) = fx
        .cache
        .get(&fx.queue, fx.oid, 0, BUFFER_SIZE, &wl, &dp)
        .unwrap();
    assert!(e1.is_none());
    let (second, e2) = fx
        .cache
        .get(&fx.queue, fx.oid, 0, BUFFER_SIZE, &wl, &dp)
        .unwrap();
    assert!(e2.is_none());
    assert_eq!(fx.cache.locked_slots(), 1);

    fx.cache.unlock(&fx.queue, fx.oid, &first, &dp).unwrap();
    assert_eq!(fx.cache.locked_slots(), 1);
    fx.cache.unlock(&fx.queue, fx.oid, &second, &dp).unwrap();
    assert_eq!(fx.cache.locked_slots(), 0);
}

#[test]
fn same_range_twice_gets_distinct_objects() {
    let Some(mut fx) = fixture() else { return };
    let ptr = fx.data.as_mut_ptr();
    let a = unsafe {
        fx.cache
            .add_object(ptr, OBJECT_SIZE, ObjectMode::ReadOnly)
            .unwrap()
    };
    let b = unsafe {
        fx.cache
            .add_object(ptr, OBJECT_SIZE, ObjectMode::Transient)
            .unwrap()
    };
    assert_ne!(a, b);
    assert_ne!(a, fx.oid);
}
