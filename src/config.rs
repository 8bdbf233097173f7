//! Configuration schema for the benchmark driver and the kernel
//! strategies.
//!
//! The file format is TOML with the section layout
//! `[benchmark]`, `[kmeans]`, `[kmeans.types]`, `[kmeans.labeling]`,
//! `[kmeans.mass_update]`, `[kmeans.centroid_update]` and
//! `[kmeans.fused]`. Every stage section shares one contract
//! ([`StageConfig`]): platform/device selection, a strategy name and
//! its work geometry, plus the strategy-specific tuning knobs.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PointType {
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "float64")]
    Float64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum IndexType {
    #[serde(rename = "uint32")]
    Uint32,
    #[serde(rename = "uint64")]
    Uint64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PipelineKind {
    #[serde(rename = "three-stage")]
    ThreeStage,
    #[serde(rename = "fused")]
    Fused,
}

/// Numeric types the engine is instantiated with.
///
/// A 32-bit mass type overflows for more than 2^32 points per cluster;
/// no saturating logic exists, pick `uint64` for such inputs.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TypesConfig {
    pub point: PointType,
    pub label: IndexType,
    pub mass: IndexType,
}

impl Default for TypesConfig {
    fn default() -> TypesConfig {
        TypesConfig {
            point: PointType::Float32,
            label: IndexType::Uint32,
            mass: IndexType::Uint32,
        }
    }
}

/// Shared configuration contract of the labeling, mass-update,
/// centroid-update and fused kernel families.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub platform: usize,
    pub device: usize,
    pub strategy: String,
    /// 1-3 entries; missing dimensions default to 1.
    pub global_size: Vec<usize>,
    /// 1-3 entries; missing dimensions default to 1.
    pub local_size: Vec<usize>,
    /// SIMD lane count processed per loop iteration.
    pub vector_length: usize,
    pub unroll_clusters_length: usize,
    pub unroll_features_length: usize,
    /// Work-group extent along the feature axis (`feature_sum_pardim`).
    pub local_features: usize,
    /// Features handled per work-item (`feature_sum_pardim`).
    pub thread_features: usize,
}

impl Default for StageConfig {
    fn default() -> StageConfig {
        StageConfig {
            platform: 0,
            device: 0,
            strategy: String::new(),
            global_size: vec![1024],
            local_size: vec![64],
            vector_length: 1,
            unroll_clusters_length: 1,
            unroll_features_length: 1,
            local_features: 1,
            thread_features: 1,
        }
    }
}

impl StageConfig {
    pub fn global_dims(&self) -> Result<[usize; 3]> {
        Self::dims(&self.global_size, "global_size")
    }

    pub fn local_dims(&self) -> Result<[usize; 3]> {
        Self::dims(&self.local_size, "local_size")
    }

    fn dims(v: &[usize], what: &str) -> Result<[usize; 3]> {
        if v.is_empty() || v.len() > 3 {
            return Err(Error::config(format!(
                "{} must have 1 to 3 entries, got {}",
                what,
                v.len()
            )));
        }
        let mut dims = [1usize; 3];
        dims[..v.len()].copy_from_slice(v);
        Ok(dims)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KmeansConfig {
    pub clusters: usize,
    pub pipeline: PipelineKind,
    pub iterations: u32,
    pub converge: bool,
    pub types: TypesConfig,
    pub labeling: StageConfig,
    pub mass_update: StageConfig,
    pub centroid_update: StageConfig,
    pub fused: StageConfig,
}

impl Default for KmeansConfig {
    fn default() -> KmeansConfig {
        KmeansConfig {
            clusters: 8,
            pipeline: PipelineKind::ThreeStage,
            iterations: 100,
            converge: false,
            types: TypesConfig::default(),
            labeling: StageConfig {
                strategy: "unroll_vector".to_string(),
                ..StageConfig::default()
            },
            mass_update: StageConfig {
                strategy: "global_atomic".to_string(),
                ..StageConfig::default()
            },
            centroid_update: StageConfig {
                strategy: "feature_sum".to_string(),
                ..StageConfig::default()
            },
            fused: StageConfig {
                strategy: "cluster_merge".to_string(),
                ..StageConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub runs: u32,
    pub verify: bool,
}

impl Default for BenchmarkConfig {
    fn default() -> BenchmarkConfig {
        BenchmarkConfig {
            runs: 1,
            verify: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub benchmark: BenchmarkConfig,
    pub kmeans: KmeansConfig,
}

impl Config {
    pub fn parse(text: &str) -> Result<Config> {
        Ok(toml::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        Config::parse(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [benchmark]
        runs = 3
        verify = true

        [kmeans]
        clusters = 16
        pipeline = "three-stage"
        iterations = 50

        [kmeans.types]
        point = "float32"
        label = "uint32"
        mass = "uint32"

        [kmeans.labeling]
        strategy = "unroll_vector"
        global_size = [8192]
        local_size = [128]
        vector_length = 4

        [kmeans.mass_update]
        strategy = "part_private"
        global_size = [4096, 1]

        [kmeans.centroid_update]
        strategy = "feature_sum_pardim"
        local_features = 2
        thread_features = 2
    "#;

    #[test]
    fn parses_full_schema() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.benchmark.runs, 3);
        assert!(config.benchmark.verify);
        assert_eq!(config.kmeans.clusters, 16);
        assert_eq!(config.kmeans.pipeline, PipelineKind::ThreeStage);
        assert_eq!(config.kmeans.iterations, 50);
        assert_eq!(config.kmeans.labeling.strategy, "unroll_vector");
        assert_eq!(config.kmeans.labeling.vector_length, 4);
        assert_eq!(config.kmeans.mass_update.global_dims().unwrap(), [4096, 1, 1]);
        assert_eq!(config.kmeans.centroid_update.thread_features, 2);
        // untouched sections keep their defaults
        assert_eq!(config.kmeans.fused.strategy, "cluster_merge");
    }

    #[test]
    fn defaults_without_file() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.benchmark.runs, 1);
        assert_eq!(config.kmeans.clusters, 8);
        assert_eq!(config.kmeans.types.point, PointType::Float32);
    }

    #[test]
    fn rejects_bad_geometry() {
        let config = Config::parse("[kmeans.labeling]\nglobal_size = [1, 2, 3, 4]\n").unwrap();
        assert!(config.kmeans.labeling.global_dims().is_err());
    }

    #[test]
    fn rejects_unknown_pipeline() {
        assert!(Config::parse("[kmeans]\npipeline = \"five-stage\"\n").is_err());
    }
}
