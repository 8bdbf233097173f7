//! Point-file readers, the binary writer and the synthetic data
//! generator.

pub mod binary;
pub mod generator;
pub mod text;

use std::path::Path;

use crate::error::Result;
use crate::kernels::ClPoint;
use crate::matrix::Matrix;

/// Reads a points file, dispatching on the extension: `.csv` is
/// parsed as text, everything else as the binary format.
pub fn read_points<P: ClPoint>(path: &Path) -> Result<Matrix<P>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => text::read(path),
        _ => binary::read(path),
    }
}
