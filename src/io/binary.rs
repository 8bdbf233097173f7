//! Binary points-file format.
//!
//! Three native-endian `u64` headers (`num_features`, `num_clusters`,
//! `num_points`) followed by `num_features * num_points` IEEE-754
//! single-precision values in feature-major order. The cluster-count
//! header must be zero; importing ground-truth centroids is not
//! supported.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::kernels::ClPoint;
use crate::matrix::Matrix;

pub fn read<P: ClPoint, Q: AsRef<Path>>(path: Q) -> Result<Matrix<P>> {
    let mut reader = BufReader::new(File::open(path)?);

    let num_features = reader.read_u64::<NativeEndian>()? as usize;
    let num_clusters = reader.read_u64::<NativeEndian>()?;
    let num_points = reader.read_u64::<NativeEndian>()? as usize;

    if num_clusters != 0 {
        return Err(Error::config(
            "points file carries ground-truth centroids, which is not supported",
        ));
    }

    let mut matrix = Matrix::new();
    matrix.resize(num_features, num_points);
    for f in 0..num_features {
        for p in 0..num_points {
            let value = reader.read_f32::<NativeEndian>()?;
            matrix.set(f, p, P::from_f64(value as f64));
        }
    }

    Ok(matrix)
}

pub fn write<Q: AsRef<Path>>(path: Q, matrix: &Matrix<f32>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    writer.write_u64::<NativeEndian>(matrix.rows() as u64)?;
    writer.write_u64::<NativeEndian>(0)?;
    writer.write_u64::<NativeEndian>(matrix.cols() as u64)?;

    for f in 0..matrix.rows() {
        for p in 0..matrix.cols() {
            writer.write_f32::<NativeEndian>(matrix.get(f, p))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.bin");

        let matrix =
            Matrix::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        write(&path, &matrix).unwrap();

        let back: Matrix<f32> = read(&path).unwrap();
        assert_eq!(back, matrix);
    }

    #[test]
    fn rejects_ground_truth_centroids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.bin");

        {
            let mut writer = BufWriter::new(File::create(&path).unwrap());
            writer.write_u64::<NativeEndian>(2).unwrap();
            writer.write_u64::<NativeEndian>(3).unwrap();
            writer.write_u64::<NativeEndian>(0).unwrap();
        }

        assert!(read::<f32, _>(&path).is_err());
    }
}
