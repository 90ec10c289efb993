use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use commons::config::{
    LogPaths, CHUNK_SIZE, DEFAULT_BOX_SIZE, DEFAULT_DETECTOR_LATENCY_MS, DEFAULT_HOST,
    DEFAULT_IMAGE_HEIGHT, DEFAULT_IMAGE_WIDTH, DEFAULT_ITERATIONS, DEFAULT_NUM_BOXES, DEFAULT_PORT,
    DEFAULT_ROI_SIZE,
};
use commons::rpc::grpc::GrpcTX;
use commons::stages::SyntheticDetector;
use commons::timelog::LogSession;
use commons::utils::{init_logger, FileUtility};
use commons::vision::{load_raw_rgb, synthetic_image};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

mod cltctx;
use cltctx::{ProducerService, RoiConfig};

/// Producer stage of the tensor streaming benchmark
#[derive(Parser, Debug)]
#[command(name = "tensorstream-client")]
#[command(about = "Crops ROIs from an image and streams them to the consumer over gRPC")]
#[command(version)]
struct Cli {
    /// Consumer host
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Consumer port; also selects the timestamp log file names
    #[arg(short, long, env = "TENSORSTREAM_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Number of sequential requests
    #[arg(short = 'n', long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: usize,

    /// Frame size for the request stream, in bytes
    #[arg(long, default_value_t = CHUNK_SIZE)]
    chunk_size: usize,

    /// Raw interleaved RGB image; a synthetic gradient is used when absent
    #[arg(long)]
    image: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_IMAGE_WIDTH)]
    width: usize,

    #[arg(long, default_value_t = DEFAULT_IMAGE_HEIGHT)]
    height: usize,

    /// Regions cropped per request
    #[arg(long, default_value_t = DEFAULT_NUM_BOXES)]
    boxes: usize,

    /// Side of each square region, in input pixels
    #[arg(long, default_value_t = DEFAULT_BOX_SIZE)]
    box_size: usize,

    /// Side of each resized crop
    #[arg(long, default_value_t = DEFAULT_ROI_SIZE)]
    roi_size: usize,

    /// Directory for the timestamp logs (defaults to $TENSORSTREAM_LOG_DIR or the working directory)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Simulated detector latency per request
    #[arg(long, default_value_t = DEFAULT_DETECTOR_LATENCY_MS)]
    detector_latency_ms: u64,

    /// zstd-compress the request stream
    #[arg(long)]
    compress: bool,

    /// Seed for the synthetic box placement
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse();

    let image = match &cli.image {
        Some(path) => load_raw_rgb(path, cli.width, cli.height)?,
        None => {
            warn!(
                "No --image given, using a synthetic {}x{} image",
                cli.width, cli.height
            );
            synthetic_image(cli.width, cli.height)
        }
    };

    let log_dir = cli.log_dir.unwrap_or_else(FileUtility::get_log_dir);
    let paths = LogPaths::for_port(&log_dir, cli.port);
    let session = LogSession::create(&paths.producer_start, &paths.producer_end)?;
    let (start_log, sent_log) = session.paths();
    info!(
        "Logging starts to {} and sends to {}",
        start_log.display(),
        sent_log.display()
    );

    let tx = GrpcTX::new(&cli.host, cli.port, cli.chunk_size).with_compression(cli.compress);
    info!(
        "Sending {} request(s) to {} in {}-byte frames",
        cli.iterations,
        tx.endpoint(),
        cli.chunk_size
    );

    let rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let detector = Arc::new(SyntheticDetector::new(
        Duration::from_millis(cli.detector_latency_ms),
        cli.boxes,
    ));
    let roi = RoiConfig {
        num_boxes: cli.boxes,
        box_size: cli.box_size,
        roi_size: cli.roi_size,
    };

    let mut producer = ProducerService::new(tx, session, detector, image, roi, rng);
    let stats = producer.benchmark(cli.iterations).await;
    stats.print_stats();

    if cli.iterations > 0 && stats.successful_requests == 0 {
        bail!("none of the {} request(s) succeeded", cli.iterations);
    }
    Ok(())
}
