//! Synthetic clustered-data generator.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;

use cl_kmeans::io::generator::ClusterGenerator;

#[derive(Parser, Debug)]
#[command(name = "generate", about = "Generate clustered points files")]
struct Args {
    /// Output file (binary points format)
    out_file: PathBuf,

    /// Target file size in MiB (as float-typed data)
    #[arg(long, default_value_t = 100)]
    size: u64,

    /// Number of features (aka dimensions)
    #[arg(long, default_value_t = 2)]
    features: usize,

    /// Number of clusters
    #[arg(long, default_value_t = 10)]
    clusters: usize,

    /// Cluster radius (Gaussian standard deviation)
    #[arg(long, default_value_t = 10.0)]
    radius: f32,

    /// Minimum centroid coordinate
    #[arg(long, default_value_t = -100.0)]
    domain_min: f32,

    /// Maximum centroid coordinate
    #[arg(long, default_value_t = 100.0)]
    domain_max: f32,

    /// Point count is truncated to a multiple of this divisor
    #[arg(long, default_value_t = 8)]
    divisor: usize,
}

fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            exit(1);
        }
    };

    let generator = ClusterGenerator::new()
        .num_features(args.features)
        .num_clusters(args.clusters)
        .cluster_radius(args.radius)
        .domain(args.domain_min, args.domain_max)
        .total_size((args.size as usize) << 20)
        .point_multiple(args.divisor);

    println!(
        "writing {} points with {} features into {}",
        generator.num_points(),
        args.features,
        args.out_file.display()
    );

    if let Err(err) = generator.generate(&args.out_file) {
        eprintln!("error: {}", err);
        exit(2);
    }
}
