//! CSV points reader: one point per line, comma-separated features.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::kernels::ClPoint;
use crate::matrix::Matrix;

pub fn read<P: ClPoint, Q: AsRef<Path>>(path: Q) -> Result<Matrix<P>> {
    let reader = BufReader::new(File::open(path)?);

    let mut values: Vec<Vec<P>> = Vec::new();
    let mut num_features = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mut point = Vec::with_capacity(num_features);
        for field in line.split(',') {
            let value: f64 = field.trim().parse().map_err(|_| {
                Error::config(format!(
                    "line {}: \"{}\" is not a number",
                    line_no + 1,
                    field.trim()
                ))
            })?;
            point.push(P::from_f64(value));
        }

        if num_features == 0 {
            num_features = point.len();
        } else if point.len() != num_features {
            return Err(Error::config(format!(
                "line {}: {} features, expected {}",
                line_no + 1,
                point.len(),
                num_features
            )));
        }
        values.push(point);
    }

    let num_points = values.len();
    let mut matrix = Matrix::new();
    matrix.resize(num_features, num_points);
    for (p, point) in values.iter().enumerate() {
        for (f, &v) in point.iter().enumerate() {
            matrix.set(f, p, v);
        }
    }

    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_feature_major() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "1.0,10.0").unwrap();
        writeln!(file, "2.0,20.0").unwrap();
        writeln!(file, "3.0,30.0").unwrap();
        drop(file);

        let matrix: Matrix<f32> = read(&path).unwrap();
        assert_eq!(matrix.rows(), 2);
        assert_eq!(matrix.cols(), 3);
        assert_eq!(matrix.get(0, 2), 3.0);
        assert_eq!(matrix.get(1, 0), 10.0);
    }

    #[test]
    fn rejects_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "1.0,2.0").unwrap();
        writeln!(file, "3.0").unwrap();
        drop(file);

        assert!(read::<f32, _>(&path).is_err());
    }
}
