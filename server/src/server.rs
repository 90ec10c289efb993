use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use commons::config::{
    LogPaths, CHUNK_SIZE, DEFAULT_CLASSIFIER_LATENCY_MS, DEFAULT_NUM_CLASSES, DEFAULT_PORT,
    DEFAULT_WORKERS,
};
use commons::rpc::grpc::GrpcRX;
use commons::stages::SyntheticClassifier;
use commons::timelog::{LogSession, SharedLogSession};
use commons::utils::{init_logger, FileUtility};
use log::{error, info};

mod srvctx;
use srvctx::ConsumerService;

/// Consumer stage of the tensor streaming benchmark
#[derive(Parser, Debug)]
#[command(name = "tensorstream-server")]
#[command(about = "Receives ROI tensors over gRPC, acks them and runs the classifier")]
#[command(version)]
struct Cli {
    /// Port to listen on; also selects the timestamp log file names
    #[arg(value_name = "PORT")]
    port_arg: Option<u16>,

    /// Same as the positional PORT, which wins when both are given
    #[arg(long, env = "TENSORSTREAM_PORT")]
    port: Option<u16>,

    /// Number of requests handled concurrently
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Frame size for the response stream, in bytes
    #[arg(long, default_value_t = CHUNK_SIZE)]
    chunk_size: usize,

    /// Directory for the timestamp logs (defaults to $TENSORSTREAM_LOG_DIR or the working directory)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Simulated classifier latency per request
    #[arg(long, default_value_t = DEFAULT_CLASSIFIER_LATENCY_MS)]
    classifier_latency_ms: u64,

    /// Number of classes the classifier scores
    #[arg(long, default_value_t = DEFAULT_NUM_CLASSES)]
    classes: usize,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse();

    let port = cli.port_arg.or(cli.port).unwrap_or(DEFAULT_PORT);
    let log_dir = cli.log_dir.unwrap_or_else(FileUtility::get_log_dir);
    let paths = LogPaths::for_port(&log_dir, port);
    let session = SharedLogSession::new(LogSession::create(
        &paths.consumer_start,
        &paths.consumer_end,
    )?);
    info!(
        "Logging receipts to {} and completions to {}",
        paths.consumer_start.display(),
        paths.consumer_end.display()
    );

    let classifier = Arc::new(SyntheticClassifier::new(
        Duration::from_millis(cli.classifier_latency_ms),
        cli.classes,
    ));
    let service = ConsumerService::new(session, classifier, cli.workers, cli.chunk_size);

    let rx = GrpcRX::bind(port, cli.chunk_size).await?;
    info!(
        "Consumer ready on {} with {} worker(s)",
        rx.local_addr(),
        cli.workers
    );
    rx.serve(service, shutdown_signal()).await
}
