//! Benchmark harness: repeated clustering runs, wall-clock capture,
//! verification against a host reference, and CSV emission.

use std::path::Path;
use std::time::Instant;

use num_traits::Zero;

use crate::error::{Error, Result};
use crate::kernels::{ClIndex, ClPoint};
use crate::matrix::Matrix;
use crate::measurement::Measurement;

/// A clustering implementation under benchmark:
/// `(max_iterations, points, centroids, labels, masses, measurement)`.
pub type ClusteringFn<P, L, M> = Box<
    dyn FnMut(
        u32,
        &Matrix<P>,
        &mut Matrix<P>,
        &mut Vec<L>,
        &mut Vec<M>,
        &mut Measurement,
    ) -> Result<()>,
>;

/// Centroid seeding callback.
pub type InitCentroidsFn<P> = Box<dyn FnMut(&Matrix<P>, &mut Matrix<P>)>;

/// Wall-clock times and measurements of all runs.
pub struct BenchmarkStats {
    pub microseconds: Vec<u64>,
    pub measurements: Vec<Measurement>,
    num_features: u64,
    num_points: u64,
    num_clusters: u64,
}

impl BenchmarkStats {
    fn new(num_features: u64, num_points: u64, num_clusters: u64) -> BenchmarkStats {
        BenchmarkStats {
            microseconds: Vec::new(),
            measurements: Vec::new(),
            num_features,
            num_points,
            num_clusters,
        }
    }

    pub fn print_times(&self) {
        let times: Vec<String> = self.microseconds.iter().map(|t| t.to_string()).collect();
        println!(
            "{} runs, in µs: [{}]",
            self.microseconds.len(),
            times.join(", ")
        );
    }

    /// Writes the measurement CSV files of every run, stamped with the
    /// experiment parameters.
    pub fn to_csv(&mut self, csv_base: &Path, input_file: &Path) -> Result<()> {
        let filename = input_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();

        for measurement in &mut self.measurements {
            measurement.set_parameter("Filename", &filename);
            measurement.set_parameter("Hostname", &hostname);
            measurement.set_parameter("NumFeatures", &self.num_features.to_string());
            measurement.set_parameter("NumPoints", &self.num_points.to_string());
            measurement.set_parameter("NumClusters", &self.num_clusters.to_string());
            measurement.write_csv(csv_base)?;
        }
        Ok(())
    }
}

/// Runs a clustering function `num_runs` times over one dataset,
/// re-seeding the centroids before every run.
pub struct ClusteringBenchmark<P: ClPoint, L: ClIndex, M: ClIndex> {
    num_runs: u32,
    max_iterations: u32,
    points: Matrix<P>,
    centroids: Matrix<P>,
    labels: Vec<L>,
    masses: Vec<M>,
    reference_labels: Vec<L>,
    init_centroids: InitCentroidsFn<P>,
}

impl<P: ClPoint, L: ClIndex, M: ClIndex> ClusteringBenchmark<P, L, M> {
    pub fn new(
        num_runs: u32,
        max_iterations: u32,
        points: Matrix<P>,
    ) -> ClusteringBenchmark<P, L, M> {
        let num_points = points.cols();
        ClusteringBenchmark {
            num_runs,
            max_iterations,
            points,
            centroids: Matrix::new(),
            labels: vec![L::zero(); num_points],
            masses: Vec::new(),
            reference_labels: Vec::new(),
            init_centroids: Box::new(|_, _| {}),
        }
    }

    pub fn initialize(&mut self, num_clusters: usize, init_centroids: InitCentroidsFn<P>) {
        self.centroids.resize(self.points.rows(), num_clusters);
        self.masses = vec![M::zero(); num_clusters];
        self.init_centroids = init_centroids;
    }

    pub fn num_points(&self) -> usize {
        self.points.cols()
    }

    pub fn num_features(&self) -> usize {
        self.points.rows()
    }

    pub fn run(&mut self, mut f: ClusteringFn<P, L, M>) -> Result<BenchmarkStats> {
        let mut stats = BenchmarkStats::new(
            self.points.rows() as u64,
            self.points.cols() as u64,
            self.centroids.cols() as u64,
        );

        for run in 0..self.num_runs {
            (self.init_centroids)(&self.points, &mut self.centroids);

            let mut measurement = Measurement::new();
            measurement.set_run(run);

            let timer = Instant::now();
            f(
                self.max_iterations,
                &self.points,
                &mut self.centroids,
                &mut self.labels,
                &mut self.masses,
                &mut measurement,
            )?;
            stats.microseconds.push(timer.elapsed().as_micros() as u64);
            stats.measurements.push(measurement);
        }

        Ok(stats)
    }

    /// Produces reference labels with `reference` (typically
    /// [`host_lloyd`] wrapped into a [`ClusteringFn`]).
    pub fn set_verification_reference(&mut self, mut reference: ClusteringFn<P, L, M>) -> Result<()> {
        (self.init_centroids)(&self.points, &mut self.centroids);

        let mut centroids = self.centroids.clone();
        let mut labels = vec![L::zero(); self.points.cols()];
        let mut masses = vec![M::zero(); self.centroids.cols()];
        let mut measurement = Measurement::new();

        reference(
            self.max_iterations,
            &self.points,
            &mut centroids,
            &mut labels,
            &mut masses,
            &mut measurement,
        )?;
        self.reference_labels = labels;
        Ok(())
    }

    /// Runs `f` once and counts label disagreements with the
    /// reference.
    pub fn verify(&mut self, mut f: ClusteringFn<P, L, M>) -> Result<u64> {
        if self.reference_labels.is_empty() {
            return Err(Error::config("no verification reference set"));
        }

        (self.init_centroids)(&self.points, &mut self.centroids);
        let mut measurement = Measurement::new();
        f(
            self.max_iterations,
            &self.points,
            &mut self.centroids,
            &mut self.labels,
            &mut self.masses,
            &mut measurement,
        )?;

        Ok(self
            .labels
            .iter()
            .zip(&self.reference_labels)
            .filter(|(a, b)| a != b)
            .count() as u64)
    }
}

/// Single-threaded Lloyd iteration, the verification reference.
///
/// Mirrors the device semantics: labels are the argmin of the squared
/// distance with ties toward the lower cluster index, and centroids
/// are divided by their mass unconditionally, so empty clusters go to
/// NaN exactly like on the device.
pub fn host_lloyd<P: ClPoint, L: ClIndex, M: ClIndex>(
    max_iterations: u32,
    points: &Matrix<P>,
    centroids: &mut Matrix<P>,
    labels: &mut Vec<L>,
    masses: &mut Vec<M>,
) -> Result<()> {
    let num_features = points.rows();
    let num_points = points.cols();
    let num_clusters = centroids.cols();

    labels.clear();
    labels.resize(num_points, L::zero());
    masses.clear();
    masses.resize(num_clusters, M::zero());

    let mut sums = vec![P::zero(); num_features * num_clusters];

    for _ in 0..max_iterations {
        for p in 0..num_points {
            let mut min_dist = P::infinity();
            let mut min_c = 0usize;
            for c in 0..num_clusters {
                let mut dist = P::zero();
                for f in 0..num_features {
                    let d = points.get(f, p) - centroids.get(f, c);
                    dist = dist + d * d;
                }
                if dist < min_dist {
                    min_dist = dist;
                    min_c = c;
                }
            }
            labels[p] = L::from_usize(min_c);
        }

        for m in masses.iter_mut() {
            *m = M::zero();
        }
        for s in sums.iter_mut() {
            *s = P::zero();
        }
        for p in 0..num_points {
            let c = labels[p].as_usize();
            masses[c] = masses[c] + M::from_usize(1);
            for f in 0..num_features {
                sums[f * num_clusters + c] = sums[f * num_clusters + c] + points.get(f, p);
            }
        }

        for c in 0..num_clusters {
            let mass = P::from_f64(masses[c].as_usize() as f64);
            for f in 0..num_features {
                centroids.set(f, c, sums[f * num_clusters + c] / mass);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer;

    fn two_cluster_points() -> Matrix<f32> {
        // Points (0,0), (0,1), (10,0), (10,1).
        Matrix::from_vec(vec![0.0, 0.0, 10.0, 10.0, 0.0, 1.0, 0.0, 1.0], 2, 4).unwrap()
    }

    #[test]
    fn host_lloyd_separates_two_clusters() {
        let points = two_cluster_points();
        let mut centroids =
            Matrix::from_vec(vec![0.0f32, 10.0, 0.0, 0.0], 2, 2).unwrap();
        let mut labels = Vec::new();
        let mut masses: Vec<u32> = Vec::new();

        host_lloyd::<f32, u32, u32>(1, &points, &mut centroids, &mut labels, &mut masses)
            .unwrap();

        assert_eq!(labels, vec![0, 0, 1, 1]);
        assert_eq!(masses, vec![2, 2]);
        assert_eq!(centroids.get(0, 0), 0.0);
        assert_eq!(centroids.get(1, 0), 0.5);
        assert_eq!(centroids.get(0, 1), 10.0);
        assert_eq!(centroids.get(1, 1), 0.5);
    }

    #[test]
    fn identity_when_centroids_are_the_points() {
        // N == K with distinct points: one iteration converges with
        // the identity labeling.
        let points = two_cluster_points();
        let mut centroids = points.clone();
        let mut labels: Vec<u32> = Vec::new();
        let mut masses: Vec<u32> = Vec::new();

        host_lloyd::<f32, u32, u32>(1, &points, &mut centroids, &mut labels, &mut masses)
            .unwrap();

        assert_eq!(labels, vec![0, 1, 2, 3]);
        assert_eq!(masses, vec![1, 1, 1, 1]);
        assert_eq!(centroids, points);
    }

    #[test]
    fn single_cluster_takes_the_mean() {
        let points = two_cluster_points();
        let mut centroids = Matrix::from_vec(vec![1.0f32, 1.0], 2, 1).unwrap();
        let mut labels: Vec<u32> = Vec::new();
        let mut masses: Vec<u32> = Vec::new();

        host_lloyd::<f32, u32, u32>(1, &points, &mut centroids, &mut labels, &mut masses)
            .unwrap();

        assert_eq!(labels, vec![0, 0, 0, 0]);
        assert_eq!(masses, vec![4]);
        assert_eq!(centroids.get(0, 0), 5.0);
        assert_eq!(centroids.get(1, 0), 0.5);
    }

    #[test]
    fn verification_counts_mismatches() {
        let points = two_cluster_points();
        let mut benchmark: ClusteringBenchmark<f32, u32, u32> =
            ClusteringBenchmark::new(1, 1, points);
        benchmark.initialize(2, Box::new(initializer::first_x));

        benchmark
            .set_verification_reference(Box::new(|iters, p, c, l, m, _| {
                host_lloyd(iters, p, c, l, m)
            }))
            .unwrap();

        // The reference against itself has zero mismatches.
        let mismatches = benchmark
            .verify(Box::new(|iters, p, c, l, m, _| host_lloyd(iters, p, c, l, m)))
            .unwrap();
        assert_eq!(mismatches, 0);
    }
}
