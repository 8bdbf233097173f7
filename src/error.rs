//! Standard error type for the clustering engine.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// An enum covering engine-level failures and the underlying OpenCL
/// error types.
///
/// Implements the usual error traits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown strategy name, out-of-range feature count, incompatible
    /// type selection and the like.
    #[error("configuration error: {0}")]
    Config(String),
    /// Pool too small, slot exhaustion, unregistered object or device.
    #[error("resource error: {0}")]
    Resource(String),
    /// Tile range not aligned to a buffer boundary, or spanning objects.
    #[error("alignment error: {0}")]
    Alignment(String),
    /// Program build failure; carries the build log of every device in
    /// the context.
    #[error("kernel build failure:\n{log}")]
    KernelBuild { log: String },
    /// Mismatched tile counts between runnables, invalid lock state.
    #[error("consistency error: {0}")]
    Consistency(String),
    #[error("{0}")]
    Ocl(ocl::Error),
    #[error("{0}")]
    OclCore(ocl::OclCoreError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Error {
        Error::Config(msg.into())
    }

    pub fn resource<S: Into<String>>(msg: S) -> Error {
        Error::Resource(msg.into())
    }

    pub fn alignment<S: Into<String>>(msg: S) -> Error {
        Error::Alignment(msg.into())
    }

    pub fn consistency<S: Into<String>>(msg: S) -> Error {
        Error::Consistency(msg.into())
    }
}

impl From<ocl::Error> for Error {
    fn from(err: ocl::Error) -> Error {
        Error::Ocl(err)
    }
}

impl From<ocl::OclCoreError> for Error {
    fn from(err: ocl::OclCoreError) -> Error {
        Error::OclCore(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Error {
        Error::Config(err.to_string())
    }
}

impl From<fmt::Error> for Error {
    fn from(err: fmt::Error) -> Error {
        Error::Config(err.to_string())
    }
}
