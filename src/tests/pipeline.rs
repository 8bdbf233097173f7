use super::cl_setup;
use crate::config::{KmeansConfig, PipelineKind, StageConfig, TypesConfig};
use crate::matrix::Matrix;
use crate::measurement::Measurement;
use crate::pipeline::{SingleStagePipeline, ThreeStagePipeline};

fn stage(strategy: &str) -> StageConfig {
    StageConfig {
        strategy: strategy.to_string(),
        global_size: vec![8],
        local_size: vec![4],
        ..StageConfig::default()
    }
}

fn minimal_config(centroid_strategy: &str) -> KmeansConfig {
    KmeansConfig {
        clusters: 2,
        pipeline: PipelineKind::ThreeStage,
        iterations: 1,
        converge: false,
        types: TypesConfig::default(),
        labeling: stage("unroll_vector"),
        mass_update: stage("global_atomic"),
        centroid_update: stage(centroid_strategy),
        fused: stage("cluster_merge"),
    }
}

/// Two well-separated clusters: points (0,0), (0,1), (10,0), (10,1)
/// with initial centroids (0,0) and (10,0).
fn two_cluster_fixture() -> (Matrix<f32>, Matrix<f32>) {
    let points =
        Matrix::from_vec(vec![0.0, 0.0, 10.0, 10.0, 0.0, 1.0, 0.0, 1.0], 2, 4).unwrap();
    let centroids = Matrix::from_vec(vec![0.0, 10.0, 0.0, 0.0], 2, 2).unwrap();
    (points, centroids)
}

fn assert_two_cluster_result(
    centroids: &Matrix<f32>,
    labels: &[u32],
    masses: &[u32],
) {
    assert_eq!(labels, &[0, 0, 1, 1]);
    assert_eq!(masses, &[2, 2]);
    assert!((centroids.get(0, 0) - 0.0).abs() < 1e-6);
    assert!((centroids.get(1, 0) - 0.5).abs() < 1e-6);
    assert!((centroids.get(0, 1) - 10.0).abs() < 1e-6);
    assert!((centroids.get(1, 1) - 0.5).abs() < 1e-6);
}

#[test]
fn three_stage_minimal() {
    if cl_setup().is_none() {
        return;
    }

    for centroid_strategy in ["feature_sum", "feature_sum_pardim", "cluster_merge"] {
        let config = minimal_config(centroid_strategy);
        let mut pipeline = ThreeStagePipeline::<f32, u32, u32>::new(&config).unwrap();
        pipeline.set_buffer_size(256 << 10);

        let (points, mut centroids) = two_cluster_fixture();
        let mut labels = Vec::new();
        let mut masses = Vec::new();
        let mut measurement = Measurement::new();

        pipeline
            .run(&points, &mut centroids, &mut labels, &mut masses, &mut measurement)
            .unwrap();

        assert_two_cluster_result(&centroids, &labels, &masses);
    }
}

#[test]
fn three_stage_mass_strategies() {
    if cl_setup().is_none() {
        return;
    }

    for mass_strategy in ["part_global", "part_local", "part_private"] {
        let mut config = minimal_config("feature_sum");
        config.mass_update = stage(mass_strategy);
        let mut pipeline = ThreeStagePipeline::<f32, u32, u32>::new(&config).unwrap();
        pipeline.set_buffer_size(256 << 10);

        let (points, mut centroids) = two_cluster_fixture();
        let mut labels = Vec::new();
        let mut masses = Vec::new();
        let mut measurement = Measurement::new();

        pipeline
            .run(&points, &mut centroids, &mut labels, &mut masses, &mut measurement)
            .unwrap();

        assert_two_cluster_result(&centroids, &labels, &masses);
    }
}

#[test]
fn fused_minimal() {
    if cl_setup().is_none() {
        return;
    }

    for fused_strategy in ["cluster_merge", "feature_sum"] {
        let mut config = minimal_config("feature_sum");
        config.pipeline = PipelineKind::Fused;
        config.fused = stage(fused_strategy);
        let mut pipeline = SingleStagePipeline::<f32, u32, u32>::new(&config).unwrap();
        pipeline.set_buffer_size(256 << 10);

        let (points, mut centroids) = two_cluster_fixture();
        let mut labels = Vec::new();
        let mut masses = Vec::new();
        let mut measurement = Measurement::new();

        pipeline
            .run(&points, &mut centroids, &mut labels, &mut masses, &mut measurement)
            .unwrap();

        assert_two_cluster_result(&centroids, &labels, &masses);
    }
}

#[test]
fn single_cluster_takes_the_mean() {
    if cl_setup().is_none() {
        return;
    }

    let mut config = minimal_config("feature_sum");
    config.clusters = 1;
    let mut pipeline = ThreeStagePipeline::<f32, u32, u32>::new(&config).unwrap();
    pipeline.set_buffer_size(256 << 10);

    let (points, _) = two_cluster_fixture();
    let mut centroids = Matrix::from_vec(vec![1.0f32, 1.0], 2, 1).unwrap();
    let mut labels = Vec::new();
    let mut masses = Vec::new();
    let mut measurement = Measurement::new();

    pipeline
        .run(&points, &mut centroids, &mut labels, &mut masses, &mut measurement)
        .unwrap();

    assert_eq!(labels, vec![0, 0, 0, 0]);
    assert_eq!(masses, vec![4]);
    assert!((centroids.get(0, 0) - 5.0).abs() < 1e-6);
    assert!((centroids.get(1, 0) - 0.5).abs() < 1e-6);
}

#[test]
fn identity_when_centroids_are_the_points() {
    if cl_setup().is_none() {
        return;
    }

    // N == K with distinct points and centroids seeded on them:
    // Lloyd converges immediately with the identity labeling.
    let mut config = minimal_config("feature_sum");
    config.clusters = 4;
    let mut pipeline = ThreeStagePipeline::<f32, u32, u32>::new(&config).unwrap();
    pipeline.set_buffer_size(256 << 10);

    let (points, _) = two_cluster_fixture();
    let mut centroids = points.clone();
    let mut labels = Vec::new();
    let mut masses = Vec::new();
    let mut measurement = Measurement::new();

    pipeline
        .run(&points, &mut centroids, &mut labels, &mut masses, &mut measurement)
        .unwrap();

    assert_eq!(labels, vec![0, 1, 2, 3]);
    assert_eq!(masses, vec![1, 1, 1, 1]);
    assert_eq!(centroids, points);
}

#[test]
fn masses_always_sum_to_the_point_count() {
    if cl_setup().is_none() {
        return;
    }

    let mut config = minimal_config("feature_sum");
    config.clusters = 3;
    config.iterations = 4;
    let mut pipeline = ThreeStagePipeline::<f32, u32, u32>::new(&config).unwrap();
    pipeline.set_buffer_size(256 << 10);

    // 16 points on a line, three centroids.
    let n = 16usize;
    let mut values = Vec::with_capacity(2 * n);
    for i in 0..n {
        values.push(i as f32);
    }
    for _ in 0..n {
        values.push(0.0);
    }
    let points = Matrix::from_vec(values, 2, n).unwrap();
    let mut centroids =
        Matrix::from_vec(vec![0.0f32, 7.0, 15.0, 0.0, 0.0, 0.0], 2, 3).unwrap();
    let mut labels = Vec::new();
    let mut masses = Vec::new();
    let mut measurement = Measurement::new();

    pipeline
        .run(&points, &mut centroids, &mut labels, &mut masses, &mut measurement)
        .unwrap();

    assert_eq!(masses.iter().sum::<u32>(), n as u32);
    assert!(labels.iter().all(|&l| l < 3));
}
