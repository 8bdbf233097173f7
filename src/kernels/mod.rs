//! Device kernel families.
//!
//! Every family embeds its OpenCL C source (`cl/` directory) and
//! specializes it at build time with compiler defines: the numeric
//! types the engine was instantiated with, the feature count, and the
//! strategy tuning knobs. Host-side wrappers own the built kernels and
//! expose a `launch` in terms of cache tile buffers and the persistent
//! centroid/mass vectors.

use std::fmt::Display;

use ocl::{Context, OclPrm, Program};

use crate::error::{Error, Result};

pub mod centroid_update;
pub mod fused;
pub mod labeling;
pub mod mass_update;
pub mod matrix_op;
pub mod reduce;

pub use centroid_update::CentroidUpdater;
pub use fused::FusedUpdater;
pub use labeling::Labeler;
pub use mass_update::MassUpdater;
pub use matrix_op::{BinaryOp, MatrixBinaryOp};
pub use reduce::ReduceVectorParcol;

/// Largest feature count the per-F kernel families are instantiated
/// for. Powers of two only.
pub const MAX_FEATURES: usize = 1024;

/// Scalar types a kernel can be specialized with.
pub trait ClType: OclPrm + Display {
    /// OpenCL C spelling of the type.
    const CL_NAME: &'static str;
    /// Whether kernels touching this type need the fp64 extension.
    const NEEDS_FP64: bool = false;
}

impl ClType for f32 {
    const CL_NAME: &'static str = "float";
}

impl ClType for f64 {
    const CL_NAME: &'static str = "double";
    const NEEDS_FP64: bool = true;
}

impl ClType for u32 {
    const CL_NAME: &'static str = "uint";
}

impl ClType for u64 {
    const CL_NAME: &'static str = "ulong";
}

/// Point scalar types (`float32`/`float64` in the configuration).
pub trait ClPoint: ClType + num_traits::Float {
    /// Signed integer of the same width.
    const CL_SINT: &'static str;
    /// Largest finite value, as spelled in OpenCL C.
    const CL_MAX: &'static str;

    fn from_f64(v: f64) -> Self;
}

impl ClPoint for f32 {
    const CL_SINT: &'static str = "int";
    const CL_MAX: &'static str = "FLT_MAX";

    fn from_f64(v: f64) -> f32 {
        v as f32
    }
}

impl ClPoint for f64 {
    const CL_SINT: &'static str = "long";
    const CL_MAX: &'static str = "DBL_MAX";

    fn from_f64(v: f64) -> f64 {
        v
    }
}

/// Unsigned integer types used for labels and masses
/// (`uint32`/`uint64` in the configuration).
pub trait ClIndex: ClType + num_traits::PrimInt + num_traits::Unsigned {
    /// Whether atomic increments on this type need the 64-bit atomics
    /// extension.
    const NEEDS_64BIT_ATOMICS: bool = false;

    fn from_usize(v: usize) -> Self;
    fn as_usize(self) -> usize;
}

impl ClIndex for u32 {
    fn from_usize(v: usize) -> u32 {
        v as u32
    }

    fn as_usize(self) -> usize {
        self as usize
    }
}

impl ClIndex for u64 {
    const NEEDS_64BIT_ATOMICS: bool = true;

    fn from_usize(v: usize) -> u64 {
        v as u64
    }

    fn as_usize(self) -> usize {
        self as usize
    }
}

/// Accumulates `-D` compiler options for a program build.
#[derive(Debug, Default, Clone)]
pub(crate) struct Defines {
    opts: String,
}

impl Defines {
    pub fn new() -> Defines {
        Defines::default().def("CL_INT", "uint")
    }

    pub fn def<V: Display>(mut self, name: &str, value: V) -> Defines {
        self.opts.push_str(&format!(" -D{}={}", name, value));
        self
    }

    pub fn flag(mut self, name: &str) -> Defines {
        self.opts.push_str(&format!(" -D{}", name));
        self
    }

    pub fn to_options(&self) -> String {
        self.opts.clone()
    }
}

/// Builds `src` for every device in `context`. On failure the build
/// log (which the OpenCL layer folds into its error text) is logged
/// and carried in the returned error.
pub(crate) fn build_program(context: &Context, src: &str, defines: &Defines) -> Result<Program> {
    let mut builder = Program::builder();
    builder.src(src);
    let opts = defines.to_options();
    if !opts.is_empty() {
        builder.cmplr_opt(opts);
    }
    match builder.build(context) {
        Ok(program) => Ok(program),
        Err(err) => {
            let log = err.to_string();
            log::error!("kernel build failed:\n{}", log);
            Err(Error::KernelBuild { log })
        }
    }
}

/// log2 for the power-of-two feature counts the kernel families are
/// indexed by.
pub(crate) fn log2_exact(v: usize) -> Option<u32> {
    if v.is_power_of_two() {
        Some(v.trailing_zeros())
    } else {
        None
    }
}

/// Index into a per-F kernel family, or a configuration error for
/// feature counts the family was not instantiated for.
pub(crate) fn feature_index(num_features: usize) -> Result<usize> {
    if num_features < 2 || num_features > MAX_FEATURES {
        return Err(Error::config(format!(
            "unsupported feature count {} (supported: powers of two in [2, {}])",
            num_features, MAX_FEATURES
        )));
    }
    match log2_exact(num_features) {
        Some(l) => Ok(l as usize - 1),
        None => Err(Error::config(format!(
            "unsupported feature count {} (not a power of two)",
            num_features
        ))),
    }
}
