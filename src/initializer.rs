//! Centroid seeding.

use rand::Rng;

use crate::kernels::ClPoint;
use crate::matrix::Matrix;

/// Seeds every centroid with one of the first K points (wrapping when
/// K exceeds N). Deterministic, which makes it the seed of choice for
/// verification runs.
pub fn first_x<P: ClPoint>(points: &Matrix<P>, centroids: &mut Matrix<P>) {
    let num_points = points.cols();
    for c in 0..centroids.cols() {
        for f in 0..centroids.rows() {
            centroids.set(f, c, points.get(f, c % num_points));
        }
    }
}

/// Forgy seeding: every centroid is a uniformly drawn point.
pub fn forgy<P: ClPoint>(points: &Matrix<P>, centroids: &mut Matrix<P>) {
    let mut rng = rand::thread_rng();
    let num_points = points.cols();
    for c in 0..centroids.cols() {
        let p = rng.gen_range(0..num_points);
        for f in 0..centroids.rows() {
            centroids.set(f, c, points.get(f, p));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_points() -> Matrix<f32> {
        Matrix::from_vec(vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0], 2, 3).unwrap()
    }

    #[test]
    fn first_x_takes_leading_points() {
        let points = sample_points();
        let mut centroids = Matrix::new();
        centroids.resize(2, 2);
        first_x(&points, &mut centroids);
        assert_eq!(centroids.get(0, 0), 1.0);
        assert_eq!(centroids.get(1, 0), 10.0);
        assert_eq!(centroids.get(0, 1), 2.0);
        assert_eq!(centroids.get(1, 1), 20.0);
    }

    #[test]
    fn forgy_copies_existing_points() {
        let points = sample_points();
        let mut centroids = Matrix::new();
        centroids.resize(2, 4);
        forgy(&points, &mut centroids);
        for c in 0..4 {
            let x = centroids.get(0, c);
            let y = centroids.get(1, c);
            assert!((0..3).any(|p| points.get(0, p) == x && points.get(1, p) == y));
        }
    }
}
