//! Elementwise binary operations between a matrix and a broadcast
//! operand, used to fold partial sums and to normalize centroids.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Event, EventList, Kernel, Program, Queue};

use super::{build_program, ClType, Defines};
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

const SRC: &str = include_str!("cl/matrix_binary_op.cl");
const ROW_KERNEL_NAME: &str = "matrix_row_vector";
const MATRIX_KERNEL_NAME: &str = "matrix_matrix";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    fn token(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

/// Applies `op` between an `F x R` matrix of `T1` and an operand of
/// `T2`. The operator is baked into the program at build time.
///
/// Division by zero follows OpenCL numerics (inf/NaN); callers
/// guarantee nonzero divisors where they need finite results.
#[derive(Debug)]
pub struct MatrixBinaryOp<T1: ClType, T2: ClType> {
    program: Program,
    _marker: PhantomData<(T1, T2)>,
}

impl<T1: ClType, T2: ClType> MatrixBinaryOp<T1, T2> {
    pub fn prepare(context: &Context, op: BinaryOp) -> Result<MatrixBinaryOp<T1, T2>> {
        let mut defines = Defines::new()
            .def("CL_TYPE_1", T1::CL_NAME)
            .def("CL_TYPE_2", T2::CL_NAME)
            .def("BINARY_OP", op.token());
        if T1::NEEDS_FP64 || T2::NEEDS_FP64 {
            defines = defines.flag("TYPE64");
        }
        let program = build_program(context, SRC, &defines)?;
        Ok(MatrixBinaryOp {
            program,
            _marker: PhantomData,
        })
    }

    /// Broadcasts `vector` along the matrix columns:
    /// `M[f, r] <- M[f, r] op v[r]`.
    pub fn row(
        &self,
        queue: &Queue,
        num_cols: usize,
        num_rows: usize,
        matrix: &Buffer<T1>,
        vector: &Buffer<T2>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name("MatrixBinaryOpRow");

        if matrix.len() < num_cols * num_rows {
            return Err(Error::consistency(format!(
                "matrix buffer holds {} elements, expected {} x {}",
                matrix.len(),
                num_cols,
                num_rows
            )));
        }
        if vector.len() < num_rows {
            return Err(Error::consistency(format!(
                "vector buffer holds {} elements, expected {}",
                vector.len(),
                num_rows
            )));
        }

        let kernel = self.kernel(queue, ROW_KERNEL_NAME, matrix, vector, num_cols as u32, num_rows as u32)?;
        let mut event = Event::empty();
        unsafe {
            kernel
                .cmd()
                .queue(queue)
                .global_work_size([num_rows, num_cols])
                .ewait(wait)
                .enew(&mut event)
                .enq()?;
        }
        datapoint.add_event(queue, event.clone());
        Ok(event)
    }

    /// Elementwise `lhs[i] <- lhs[i] op rhs[i]` over `length` elements.
    pub fn matrix(
        &self,
        queue: &Queue,
        length: usize,
        lhs: &Buffer<T1>,
        rhs: &Buffer<T2>,
        datapoint: &DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        datapoint.set_name("MatrixBinaryOpMatrix");

        if lhs.len() < length || rhs.len() < length {
            return Err(Error::consistency(format!(
                "operand buffers hold {} and {} elements, expected at least {}",
                lhs.len(),
                rhs.len(),
                length
            )));
        }

        let mut builder = Kernel::builder();
        builder
            .program(&self.program)
            .name(MATRIX_KERNEL_NAME)
            .queue(queue.clone())
            .arg(lhs)
            .arg(rhs)
            .arg(length as u32);
        let kernel = builder.build()?;

        let mut event = Event::empty();
        unsafe {
            kernel
                .cmd()
                .queue(queue)
                .global_work_size(length)
                .ewait(wait)
                .enew(&mut event)
                .enq()?;
        }
        datapoint.add_event(queue, event.clone());
        Ok(event)
    }

    /// Scalar broadcast. Present in the interface for parity with the
    /// other projections; not implemented.
    pub fn scalar(
        &self,
        _queue: &Queue,
        _num_cols: usize,
        _num_rows: usize,
        _matrix: &Buffer<T1>,
        _scalar: T2,
    ) -> Result<Event> {
        Err(Error::config("matrix scalar broadcast is not implemented"))
    }

    /// Column broadcast. Present in the interface for parity with the
    /// other projections; not implemented.
    pub fn col(
        &self,
        _queue: &Queue,
        _num_cols: usize,
        _num_rows: usize,
        _matrix: &Buffer<T1>,
        _vector: &Buffer<T2>,
    ) -> Result<Event> {
        Err(Error::config("matrix column broadcast is not implemented"))
    }

    fn kernel(
        &self,
        queue: &Queue,
        name: &str,
        matrix: &Buffer<T1>,
        vector: &Buffer<T2>,
        num_cols: u32,
        num_rows: u32,
    ) -> Result<Kernel> {
        let mut builder = Kernel::builder();
        builder
            .program(&self.program)
            .name(name.to_string())
            .queue(queue.clone())
            .arg(matrix)
            .arg(vector)
            .arg(num_cols)
            .arg(num_rows);
        Ok(builder.build()?)
    }
}
