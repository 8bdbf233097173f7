//! Benchmark driver: clusters a points file on the configured device
//! pipeline, optionally verifying against the host reference.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::rc::Rc;

use clap::Parser;

use cl_kmeans::benchmark::{host_lloyd, ClusteringBenchmark, ClusteringFn};
use cl_kmeans::config::{Config, IndexType, PipelineKind, PointType};
use cl_kmeans::initializer;
use cl_kmeans::kernels::{ClIndex, ClPoint};
use cl_kmeans::pipeline::{SingleStagePipeline, ThreeStagePipeline};
use cl_kmeans::{io, Error, Result};

#[derive(Parser, Debug)]
#[command(
    name = "bench",
    about = "Heterogeneous out-of-core k-means benchmark driver"
)]
struct Args {
    /// Number of clusters
    clusters: usize,

    /// Points file (.csv is parsed as text, anything else as binary)
    file: PathBuf,

    /// Maximum number of Lloyd iterations
    #[arg(long)]
    iterations: Option<u32>,

    /// Number of benchmark runs
    #[arg(long)]
    runs: Option<u32>,

    /// Verify labels against a host reference run
    #[arg(long)]
    verify: bool,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
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

    if let Err(err) = run(&args) {
        eprintln!("error: {}", err);
        exit(error_code(&err));
    }
}

fn error_code(err: &Error) -> i32 {
    // OpenCL statuses are negative; pass them through as positive
    // process exit codes where one exists.
    if let Error::Ocl(ocl_err) = err {
        if let Some(status) = ocl_err.api_status() {
            let code = -(status as i32);
            if code > 0 {
                return code;
            }
        }
    }
    2
}

fn run(args: &Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    config.kmeans.clusters = args.clusters;
    if let Some(iterations) = args.iterations {
        config.kmeans.iterations = iterations;
    }
    if let Some(runs) = args.runs {
        config.benchmark.runs = runs;
    }
    if args.verify {
        config.benchmark.verify = true;
    }

    let types = config.kmeans.types;
    match (types.point, types.label, types.mass) {
        (PointType::Float32, IndexType::Uint32, IndexType::Uint32) => {
            run_typed::<f32, u32, u32>(&config, args)
        }
        (PointType::Float64, IndexType::Uint64, IndexType::Uint64) => {
            run_typed::<f64, u64, u64>(&config, args)
        }
        _ => Err(Error::Config(
            "unsupported type combination; use float32/uint32/uint32 or float64/uint64/uint64"
                .to_string(),
        )),
    }
}

fn run_typed<P: ClPoint, L: ClIndex, M: ClIndex>(config: &Config, args: &Args) -> Result<()> {
    let points = io::read_points::<P>(&args.file)?;
    println!(
        "{}: {} points, {} features, {} clusters, {} iterations",
        args.file.display(),
        points.cols(),
        points.rows(),
        config.kmeans.clusters,
        config.kmeans.iterations
    );

    let mut benchmark: ClusteringBenchmark<P, L, M> = ClusteringBenchmark::new(
        config.benchmark.runs,
        config.kmeans.iterations,
        points,
    );
    benchmark.initialize(config.kmeans.clusters, Box::new(initializer::first_x));

    let clustering = make_clustering_fn::<P, L, M>(config)?;
    let mut stats = benchmark.run(clustering)?;
    stats.print_times();

    if config.benchmark.verify {
        benchmark.set_verification_reference(Box::new(|iters, p, c, l, m, _| {
            host_lloyd(iters, p, c, l, m)
        }))?;
        let mismatches = benchmark.verify(make_clustering_fn::<P, L, M>(config)?)?;
        if mismatches == 0 {
            println!("verification passed");
        } else {
            println!("verification FAILED: {} labels differ", mismatches);
        }
    }

    let csv_base = args
        .file
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("experiment"));
    stats.to_csv(Path::new(&csv_base), &args.file)?;

    Ok(())
}

fn make_clustering_fn<P: ClPoint, L: ClIndex, M: ClIndex>(
    config: &Config,
) -> Result<ClusteringFn<P, L, M>> {
    match config.kmeans.pipeline {
        PipelineKind::ThreeStage => {
            let pipeline = Rc::new(RefCell::new(ThreeStagePipeline::<P, L, M>::new(
                &config.kmeans,
            )?));
            Ok(Box::new(move |_iters, p, c, l, m, measurement| {
                pipeline.borrow_mut().run(p, c, l, m, measurement)
            }))
        }
        PipelineKind::Fused => {
            let pipeline = Rc::new(RefCell::new(SingleStagePipeline::<P, L, M>::new(
                &config.kmeans,
            )?));
            Ok(Box::new(move |_iters, p, c, l, m, measurement| {
                pipeline.borrow_mut().run(p, c, l, m, measurement)
            }))
        }
    }
}
