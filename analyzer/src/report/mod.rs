//! Positional join of the four timestamp logs and the latency/throughput
//! summary computed from it.
//!
//! Line `k` of every file is taken to describe the same request. Nothing
//! cross-checks the ordinals, and the join ends silently with the shortest file.

use std::io::{self, BufRead};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LineError {
    #[error("Error parsing line as float.")]
    NotAFloat,
    #[error("Unexpected error - missing timestamp field in log {log}")]
    MissingField { log: usize },
    #[error("Unexpected error - log {log} is not valid UTF-8")]
    Unreadable { log: usize },
}

/// The four timestamps of one request, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyRow {
    pub t_start: f64,
    pub t_sent: f64,
    pub t_recv: f64,
    pub t_done: f64,
}

impl LatencyRow {
    pub fn producer_compute(&self) -> f64 {
        self.t_sent - self.t_start
    }

    pub fn transfer(&self) -> f64 {
        self.t_recv - self.t_sent
    }

    pub fn consumer_compute(&self) -> f64 {
        self.t_done - self.t_recv
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Row { line: usize, row: LatencyRow },
    Malformed { line: usize, error: LineError },
}

impl LineOutcome {
    pub fn render(&self) -> String {
        match self {
            LineOutcome::Row { line, row } => format!(
                "Line {}: Diff1 (1-2) = {}, Diff2 (2-3) = {}, Diff3 (3-4) = {}",
                line,
                row.producer_compute(),
                row.transfer(),
                row.consumer_compute()
            ),
            LineOutcome::Malformed { line, error } => format!("Line {}: {}", line, error),
        }
    }
}

/// Second whitespace-separated field, as seconds.
fn parse_timestamp(line: &str, log: usize) -> Result<f64, LineError> {
    let field = line
        .split_whitespace()
        .nth(1)
        .ok_or(LineError::MissingField { log })?;
    field.parse().map_err(|_| LineError::NotAFloat)
}

fn parse_row(lines: &[Vec<u8>; 4]) -> Result<LatencyRow, LineError> {
    let mut times = [0.0; 4];
    for (idx, raw) in lines.iter().enumerate() {
        let log = idx + 1;
        let line = std::str::from_utf8(raw).map_err(|_| LineError::Unreadable { log })?;
        times[idx] = parse_timestamp(line, log)?;
    }
    let [t_start, t_sent, t_recv, t_done] = times;
    Ok(LatencyRow {
        t_start,
        t_sent,
        t_recv,
        t_done,
    })
}

/// Next line without its terminator, or `None` at end of input. Bytes are
/// returned undecoded so a torn line costs one row, not the whole join.
fn read_raw_line<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(buf))
}

/// Reads the producer-start, producer-end, consumer-start and consumer-end
/// logs in lockstep. Lines are numbered from 1. Only a failing read is an
/// error; a line that does not parse becomes a `Malformed` outcome.
pub fn join_logs<R: BufRead>(mut logs: [R; 4]) -> io::Result<Vec<LineOutcome>> {
    let mut outcomes = Vec::new();
    let mut line = 0;
    loop {
        let mut raw: [Vec<u8>; 4] = Default::default();
        for (reader, slot) in logs.iter_mut().zip(raw.iter_mut()) {
            match read_raw_line(reader)? {
                Some(bytes) => *slot = bytes,
                None => return Ok(outcomes),
            }
        }
        line += 1;
        let outcome = match parse_row(&raw) {
            Ok(row) => LineOutcome::Row { line, row },
            Err(error) => LineOutcome::Malformed { line, error },
        };
        outcomes.push(outcome);
    }
}

pub fn rows(outcomes: &[LineOutcome]) -> Vec<LatencyRow> {
    outcomes
        .iter()
        .filter_map(|o| match o {
            LineOutcome::Row { row, .. } => Some(*row),
            LineOutcome::Malformed { .. } => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub requests: usize,
    pub avg_producer_compute: f64,
    pub avg_transfer: f64,
    pub avg_consumer_compute: f64,
    /// Requests per second between the first and last start; `None` when that span is zero.
    pub throughput: Option<f64>,
    /// MB/s over the summed transfer times; `None` when they sum to zero.
    pub bandwidth_mb_s: Option<f64>,
}

fn mean(values: impl Iterator<Item = f64>, n: usize) -> f64 {
    values.sum::<f64>() / n as f64
}

impl Summary {
    /// `None` when there is no well-formed row to summarize.
    pub fn from_rows(rows: &[LatencyRow], bytes_per_request: u64) -> Option<Self> {
        let (first, last) = (rows.first()?, rows.last()?);
        let n = rows.len();

        let span = last.t_start - first.t_start;
        let throughput = (span > 0.0).then(|| n as f64 / span);

        let total_transfer: f64 = rows.iter().map(LatencyRow::transfer).sum();
        let bandwidth_mb_s = (total_transfer > 0.0)
            .then(|| bytes_per_request as f64 * n as f64 / total_transfer / 1e6);

        Some(Self {
            requests: n,
            avg_producer_compute: mean(rows.iter().map(LatencyRow::producer_compute), n),
            avg_transfer: mean(rows.iter().map(LatencyRow::transfer), n),
            avg_consumer_compute: mean(rows.iter().map(LatencyRow::consumer_compute), n),
            throughput,
            bandwidth_mb_s,
        })
    }

    pub fn avg_total(&self) -> f64 {
        self.avg_producer_compute + self.avg_transfer + self.avg_consumer_compute
    }

    pub fn render(&self) -> Vec<String> {
        let or_na = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |v| v.to_string());
        vec![
            format!("Average total for each request: {}", self.avg_total()),
            format!("Average producer compute: {}", self.avg_producer_compute),
            format!("Average transfer time: {}", self.avg_transfer),
            format!("Average consumer compute: {}", self.avg_consumer_compute),
            format!("Throughput (req/s): {}", or_na(self.throughput)),
            format!("Bandwidth (MB/s): {}", or_na(self.bandwidth_mb_s)),
        ]
    }
}
