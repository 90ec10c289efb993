use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use commons::config::{LogPaths, DEFAULT_PAYLOAD_BYTES, DEFAULT_PORT};
use commons::utils::{init_logger, FileUtility};
use log::{debug, warn};

mod report;
use report::{join_logs, rows, LineOutcome, Summary};

/// Joins the four timestamp logs of a benchmark run and prints the latency breakdown
#[derive(Parser, Debug)]
#[command(name = "tensorstream-analyze")]
#[command(version)]
struct Cli {
    /// producer-start, producer-end, consumer-start and consumer-end logs, in that order
    #[arg(value_names = ["PRODUCER_START", "PRODUCER_END", "CONSUMER_START", "CONSUMER_END"])]
    files: Vec<PathBuf>,

    /// Derive the log names from this port when no files are given
    #[arg(short, long, env = "TENSORSTREAM_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding the derived logs (defaults to $TENSORSTREAM_LOG_DIR or the working directory)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Payload bytes per request used for the bandwidth figure
    #[arg(long, default_value_t = DEFAULT_PAYLOAD_BYTES)]
    bytes: u64,
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("cannot open log {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse();

    let paths: [PathBuf; 4] = match cli.files.len() {
        0 => {
            let dir = cli.log_dir.unwrap_or_else(FileUtility::get_log_dir);
            let derived = LogPaths::for_port(dir, cli.port);
            derived.in_join_order().map(|p| p.to_path_buf())
        }
        4 => [
            cli.files[0].clone(),
            cli.files[1].clone(),
            cli.files[2].clone(),
            cli.files[3].clone(),
        ],
        n => bail!("expected 4 log files or none, got {}", n),
    };
    debug!("Joining {:?}", paths);

    let readers = [
        open(&paths[0])?,
        open(&paths[1])?,
        open(&paths[2])?,
        open(&paths[3])?,
    ];
    let outcomes = join_logs(readers)?;
    for outcome in &outcomes {
        println!("{}", outcome.render());
    }

    let malformed = outcomes
        .iter()
        .filter(|o| matches!(o, LineOutcome::Malformed { .. }))
        .count();
    if malformed > 0 {
        warn!("Skipped {} malformed line(s)", malformed);
    }

    match Summary::from_rows(&rows(&outcomes), cli.bytes) {
        Some(summary) => {
            for line in summary.render() {
                println!("{}", line);
            }
        }
        None => println!("No well-formed rows to summarize."),
    }
    Ok(())
}
