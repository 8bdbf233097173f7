use ocl::{Buffer, EventList};

use super::cl_setup;
use crate::kernels::{BinaryOp, MatrixBinaryOp};
use crate::measurement::DataPoint;

#[test]
fn row_broadcast_divide() {
    let Some((context, queue, _device)) = cl_setup() else { return };

    // F = 2, R = 3; element (f, r) at f * R + r.
    let matrix_host: Vec<f32> = vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0];
    let vector_host: Vec<u32> = vec![2, 2, 2];

    let matrix = Buffer::<f32>::builder()
        .queue(queue.clone())
        .len(matrix_host.len())
        .build()
        .unwrap();
    matrix.write(&matrix_host).enq().unwrap();
    let vector = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(vector_host.len())
        .build()
        .unwrap();
    vector.write(&vector_host).enq().unwrap();

    let divide = MatrixBinaryOp::<f32, u32>::prepare(&context, BinaryOp::Divide).unwrap();
    divide
        .row(
            &queue,
            2,
            3,
            &matrix,
            &vector,
            &DataPoint::detached(),
            &EventList::new(),
        )
        .unwrap();
    queue.finish().unwrap();

    let mut result = vec![0.0f32; matrix_host.len()];
    matrix.read(&mut result).enq().unwrap();
    assert_eq!(result, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn elementwise_add() {
    let Some((context, queue, _device)) = cl_setup() else { return };

    let lhs_host: Vec<u32> = vec![1, 2, 3, 4, 5];
    let rhs_host: Vec<u32> = vec![10, 20, 30, 40, 50];

    let lhs = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(lhs_host.len())
        .build()
        .unwrap();
    lhs.write(&lhs_host).enq().unwrap();
    let rhs = Buffer::<u32>::builder()
        .queue(queue.clone())
        .len(rhs_host.len())
        .build()
        .unwrap();
    rhs.write(&rhs_host).enq().unwrap();

    let add = MatrixBinaryOp::<u32, u32>::prepare(&context, BinaryOp::Add).unwrap();
    add.matrix(
        &queue,
        lhs_host.len(),
        &lhs,
        &rhs,
        &DataPoint::detached(),
        &EventList::new(),
    )
    .unwrap();
    queue.finish().unwrap();

    let mut result = vec![0u32; lhs_host.len()];
    lhs.read(&mut result).enq().unwrap();
    assert_eq!(result, vec![11, 22, 33, 44, 55]);
}

#[test]
fn unimplemented_projections_report_errors() {
    let Some((context, queue, _device)) = cl_setup() else { return };

    let buffer = Buffer::<f32>::builder()
        .queue(queue.clone())
        .len(4)
        .build()
        .unwrap();
    let op = MatrixBinaryOp::<f32, f32>::prepare(&context, BinaryOp::Multiply).unwrap();
    assert!(op.scalar(&queue, 2, 2, &buffer, 2.0).is_err());
    assert!(op.col(&queue, 2, 2, &buffer, &buffer).is_err());
}
