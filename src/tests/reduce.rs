use ocl::{Buffer, EventList};

use super::cl_setup;
use crate::kernels::ReduceVectorParcol;
use crate::measurement::DataPoint;

#[test]
fn four_columns_of_four_partials() {
    let Some((context, queue, _device)) = cl_setup() else { return };

    // Four interleaved columns of four partials each; every output row
    // collects 1 + 2 + 3 + 4.
    let input: Vec<u32> = vec![
        1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4,
    ];
    let data = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(input.len())
        .build()
        .unwrap();
    data.write(&input).enq().unwrap();

    let reduce = ReduceVectorParcol::<u32>::prepare(&context).unwrap();
    let event = reduce
        .launch(&queue, 4, 4, &data, &DataPoint::detached(), &EventList::new())
        .unwrap();
    if let Some(event) = event {
        event.wait_for().unwrap();
    }
    queue.finish().unwrap();

    let mut result = vec![0u32; 4];
    data.read(&mut result).len(4).enq().unwrap();
    assert_eq!(result, vec![10, 10, 10, 10]);
}

#[test]
fn matches_serial_column_sum() {
    let Some((context, queue, _device)) = cl_setup() else { return };

    let num_rows = 8usize;
    let num_cols = 256usize;
    let input: Vec<u32> = (0..num_rows * num_cols).map(|i| (i % 97) as u32).collect();

    let mut expected = vec![0u32; num_rows];
    for (i, v) in input.iter().enumerate() {
        expected[i % num_rows] += v;
    }

    let data = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(input.len())
        .build()
        .unwrap();
    data.write(&input).enq().unwrap();

    let reduce = ReduceVectorParcol::<u32>::prepare(&context).unwrap();
    reduce
        .launch(
            &queue,
            num_cols,
            num_rows,
            &data,
            &DataPoint::detached(),
            &EventList::new(),
        )
        .unwrap();
    queue.finish().unwrap();

    let mut result = vec![0u32; num_rows];
    data.read(&mut result).len(num_rows).enq().unwrap();
    assert_eq!(result, expected);
}

#[test]
fn rejects_non_power_of_two_columns() {
    let Some((context, queue, _device)) = cl_setup() else { return };

    let data = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(12)
        .build()
        .unwrap();
    let reduce = ReduceVectorParcol::<u32>::prepare(&context).unwrap();
    assert!(reduce
        .launch(&queue, 3, 4, &data, &DataPoint::detached(), &EventList::new())
        .is_err());
}
