//! Synthetic clustered data.
//!
//! Draws one uniform centroid per cluster inside the domain, then
//! scatters Gaussian-distributed points around it and writes the
//! result in the binary points format.

use std::path::Path;

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::error::{Error, Result};
use crate::matrix::Matrix;

use super::binary;

#[derive(Debug, Clone)]
pub struct ClusterGenerator {
    num_features: usize,
    num_clusters: usize,
    radius: f32,
    domain_min: f32,
    domain_max: f32,
    total_bytes: usize,
    point_multiple: usize,
}

impl ClusterGenerator {
    pub fn new() -> ClusterGenerator {
        ClusterGenerator {
            num_features: 2,
            num_clusters: 10,
            radius: 10.0,
            domain_min: -100.0,
            domain_max: 100.0,
            total_bytes: 100 << 20,
            point_multiple: 8,
        }
    }

    pub fn num_features(mut self, features: usize) -> ClusterGenerator {
        self.num_features = features;
        self
    }

    pub fn num_clusters(mut self, clusters: usize) -> ClusterGenerator {
        self.num_clusters = clusters;
        self
    }

    pub fn cluster_radius(mut self, radius: f32) -> ClusterGenerator {
        self.radius = radius;
        self
    }

    pub fn domain(mut self, min: f32, max: f32) -> ClusterGenerator {
        self.domain_min = min;
        self.domain_max = max;
        self
    }

    /// Target file payload in bytes (as float-typed data).
    pub fn total_size(mut self, bytes: usize) -> ClusterGenerator {
        self.total_bytes = bytes;
        self
    }

    /// The generated point count is truncated to a multiple of this.
    pub fn point_multiple(mut self, multiple: usize) -> ClusterGenerator {
        self.point_multiple = multiple;
        self
    }

    /// Number of points the current settings produce.
    pub fn num_points(&self) -> usize {
        let raw = self.total_bytes / std::mem::size_of::<f32>() / self.num_features;
        let clustered = raw / self.num_clusters * self.num_clusters;
        clustered - clustered % self.point_multiple.max(1)
    }

    pub fn generate<Q: AsRef<Path>>(&self, path: Q) -> Result<()> {
        Ok(binary::write(path, &self.generate_matrix()?)?)
    }

    pub fn generate_matrix(&self) -> Result<Matrix<f32>> {
        if self.num_features == 0 || self.num_clusters == 0 {
            return Err(Error::config(
                "generator needs at least one feature and one cluster",
            ));
        }
        let num_points = self.num_points();
        if num_points == 0 {
            return Err(Error::config(
                "requested size yields zero points after truncation",
            ));
        }

        let mut rng = rand::thread_rng();
        let uniform = Uniform::new_inclusive(self.domain_min, self.domain_max);
        let gaussian = Normal::new(0.0f32, self.radius)
            .map_err(|e| Error::config(format!("invalid cluster radius: {}", e)))?;

        let mut matrix = Matrix::new();
        matrix.resize(self.num_features, num_points);

        let per_cluster = num_points / self.num_clusters;
        let mut remainder = num_points % self.num_clusters;

        let mut p = 0;
        for _ in 0..self.num_clusters {
            let mut centroid = Vec::with_capacity(self.num_features);
            for _ in 0..self.num_features {
                centroid.push(rng.sample(uniform));
            }

            let mut count = per_cluster;
            if remainder > 0 {
                count += 1;
                remainder -= 1;
            }

            for _ in 0..count {
                for (f, &center) in centroid.iter().enumerate() {
                    matrix.set(f, p, center + gaussian.sample(&mut rng));
                }
                p += 1;
            }
        }

        Ok(matrix)
    }
}

impl Default for ClusterGenerator {
    fn default() -> ClusterGenerator {
        ClusterGenerator::new()
    }
}
