use ocl::{Event, EventList};

use super::{as_bytes, cl_setup};
use crate::cache::{ObjectMode, SimpleBufferCache};
use crate::kernels::MassUpdater;
use crate::config::StageConfig;
use crate::measurement::DataPoint;
use crate::scheduler::SingleDeviceScheduler;

#[test]
fn rejects_zero_and_oversized_steps() {
    let mut scheduler = SingleDeviceScheduler::new();
    scheduler.attach_buffer_cache(SimpleBufferCache::new(1 << 20));

    let zero = scheduler.enqueue_unary(
        Box::new(|_, _, _, _, _| Ok(Event::empty())),
        1,
        0,
        DataPoint::detached(),
    );
    assert!(zero.is_err());

    let oversized = scheduler.enqueue_unary(
        Box::new(|_, _, _, _, _| Ok(Event::empty())),
        1,
        2 << 20,
        DataPoint::detached(),
    );
    assert!(oversized.is_err());
}

#[test]
fn large_object_zero_fill_tiles() {
    let Some((context, _queue, device)) = cl_setup() else { return };

    const BUFFER_SIZE: usize = 512 << 10;
    const OBJECT_SIZE: usize = 16 * BUFFER_SIZE;

    let mut cache = SimpleBufferCache::new(BUFFER_SIZE);
    cache
        .add_device(&context, device, 8 * BUFFER_SIZE)
        .unwrap();

    let mut data = vec![0xffu8; OBJECT_SIZE];
    let oid = unsafe {
        cache
            .add_object(data.as_mut_ptr(), data.len(), ObjectMode::ReadWrite)
            .unwrap()
    };

    let mut scheduler = SingleDeviceScheduler::new();
    scheduler.attach_buffer_cache(cache);
    scheduler.attach_device(&context, device).unwrap();
    let queue = scheduler.queue().unwrap().clone();

    let events = scheduler
        .enqueue_unary(
            Box::new(|queue, _offset, content_length, tile, _dp| {
                let mut event = Event::empty();
                tile.cmd()
                    .queue(queue)
                    .fill(0u8, Some(content_length))
                    .enew(&mut event)
                    .enq()?;
                Ok(event)
            }),
            oid,
            BUFFER_SIZE,
            DataPoint::detached(),
        )
        .unwrap();

    scheduler.run().unwrap();
    let events = events.wait().unwrap();
    assert!(events.len() >= 16);

    // Flush the tiles still cached after the run.
    let cache = scheduler.buffer_cache_mut().unwrap();
    let dp = DataPoint::detached();
    let mut begin = 0;
    while begin < OBJECT_SIZE {
        cache
            .read(
                &queue,
                oid,
                begin,
                begin + BUFFER_SIZE,
                &EventList::new(),
                &dp,
            )
            .unwrap();
        begin += BUFFER_SIZE;
    }
    queue.finish().unwrap();

    assert_eq!(scheduler.buffer_cache().unwrap().locked_slots(), 0);
    assert!(data.iter().all(|&b| b == 0));
}

#[test]
fn short_final_tile_honors_content_length() {
    let Some((context, _queue, device)) = cl_setup() else { return };

    const BUFFER_SIZE: usize = 64 << 10;
    const OBJECT_SIZE: usize = 3 * BUFFER_SIZE + 1024;

    let mut cache = SimpleBufferCache::new(BUFFER_SIZE);
    cache
        .add_device(&context, device, 8 * BUFFER_SIZE)
        .unwrap();

    let mut data = vec![0x55u8; OBJECT_SIZE];
    let oid = unsafe {
        cache
            .add_object(data.as_mut_ptr(), data.len(), ObjectMode::ReadWrite)
            .unwrap()
    };

    let mut scheduler = SingleDeviceScheduler::new();
    scheduler.attach_buffer_cache(cache);
    scheduler.attach_device(&context, device).unwrap();
    let queue = scheduler.queue().unwrap().clone();

    let lengths = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let seen = std::rc::Rc::clone(&lengths);
    let events = scheduler
        .enqueue_unary(
            Box::new(move |queue, _offset, content_length, tile, _dp| {
                seen.borrow_mut().push(content_length);
                let mut event = Event::empty();
                tile.cmd()
                    .queue(queue)
                    .fill(0u8, Some(content_length))
                    .enew(&mut event)
                    .enq()?;
                Ok(event)
            }),
            oid,
            BUFFER_SIZE,
            DataPoint::detached(),
        )
        .unwrap();

    scheduler.run().unwrap();
    drop(events);

    assert_eq!(
        *lengths.borrow(),
        vec![BUFFER_SIZE, BUFFER_SIZE, BUFFER_SIZE, 1024]
    );

    let cache = scheduler.buffer_cache_mut().unwrap();
    let dp = DataPoint::detached();
    let mut begin = 0;
    while begin < OBJECT_SIZE {
        let end = (begin + BUFFER_SIZE).min(OBJECT_SIZE);
        cache
            .read(&queue, oid, begin, end, &EventList::new(), &dp)
            .unwrap();
        begin = end;
    }
    queue.finish().unwrap();

    assert!(data.iter().all(|&b| b == 0));
}

#[test]
fn binary_runnables_need_matching_tile_counts() {
    let Some((context, _queue, device)) = cl_setup() else { return };

    const BUFFER_SIZE: usize = 64 << 10;

    let mut cache = SimpleBufferCache::new(BUFFER_SIZE);
    cache
        .add_device(&context, device, 8 * BUFFER_SIZE)
        .unwrap();

    let mut fst = vec![0u8; 4 * BUFFER_SIZE];
    let mut snd = vec![0u8; 2 * BUFFER_SIZE];
    let fst_oid = unsafe {
        cache
            .add_object(fst.as_mut_ptr(), fst.len(), ObjectMode::ReadOnly)
            .unwrap()
    };
    let snd_oid = unsafe {
        cache
            .add_object(snd.as_mut_ptr(), snd.len(), ObjectMode::ReadOnly)
            .unwrap()
    };

    let mut scheduler = SingleDeviceScheduler::new();
    scheduler.attach_buffer_cache(cache);
    scheduler.attach_device(&context, device).unwrap();

    // 4 tiles of fst against 2 tiles of snd.
    let events = scheduler
        .enqueue_binary(
            Box::new(|_, _, _, _, _, _, _| Ok(Event::empty())),
            fst_oid,
            snd_oid,
            BUFFER_SIZE,
            BUFFER_SIZE,
            DataPoint::detached(),
        )
        .unwrap();

    assert!(scheduler.run().is_err());
    assert!(events.wait().is_err());
}

#[test]
fn mass_update_strategies_agree() {
    let Some((context, queue, _device)) = cl_setup() else { return };

    let labels: Vec<u32> = vec![0, 1, 2, 0, 1, 2, 0, 1];
    let expected: Vec<u32> = vec![3, 3, 2];

    let label_bytes = as_bytes(&labels);
    let labels_buffer = ocl::Buffer::<u8>::builder()
        .queue(queue.clone())
        .len(label_bytes.len())
        .build()
        .unwrap();
    labels_buffer.write(&label_bytes).enq().unwrap();

    for strategy in ["global_atomic", "part_global", "part_local", "part_private"] {
        let config = StageConfig {
            strategy: strategy.to_string(),
            global_size: vec![8],
            local_size: vec![4],
            ..StageConfig::default()
        };
        let mut updater = MassUpdater::<u32, u32>::prepare(&context, &config).unwrap();

        let masses = ocl::Buffer::<u32>::builder()
            .queue(queue.clone())
            .len(3)
            .fill_val(0u32)
            .build()
            .unwrap();

        updater
            .launch(
                &queue,
                labels.len(),
                3,
                &labels_buffer,
                &masses,
                &DataPoint::detached(),
                &EventList::new(),
            )
            .unwrap();
        queue.finish().unwrap();

        let mut result = vec![0u32; 3];
        masses.read(&mut result).enq().unwrap();
        assert_eq!(result, expected, "strategy {}", strategy);
    }
}
