//! Append-only per-event timestamp logs and the per-role session that owns them.
//!
//! Each line is `<ordinal> <seconds>`. The analyzer joins the four logs of a
//! run by line position, so a session must never write a line out of order or
//! twice for the same ordinal.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::err::{PipelineError, PipelineResult};
use crate::utils::TimeUtility;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stamp {
    pub ordinal: u64,
    pub time: f64,
}

pub struct TimestampLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TimestampLog {
    /// Creates the file, truncating whatever a previous run left behind.
    pub fn create(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        debug!("Opened timestamp log {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, stamp: Stamp) -> PipelineResult<()> {
        writeln!(self.writer, "{} {:.6}", stamp.ordinal, stamp.time)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Ordinal counter plus the start/end logs of one role (producer or consumer).
pub struct LogSession {
    next_ordinal: u64,
    start: TimestampLog,
    end: TimestampLog,
}

impl LogSession {
    pub fn create(start: impl AsRef<Path>, end: impl AsRef<Path>) -> PipelineResult<Self> {
        let session = Self {
            next_ordinal: 1,
            start: TimestampLog::create(start)?,
            end: TimestampLog::create(end)?,
        };
        debug!(
            "Log session writing {} and {}",
            session.start.path().display(),
            session.end.path().display()
        );
        Ok(session)
    }

    pub fn paths(&self) -> (&Path, &Path) {
        (self.start.path(), self.end.path())
    }

    /// Ordinal the next request will be given.
    pub fn peek_ordinal(&self) -> u64 {
        self.next_ordinal
    }

    /// Assigns the next ordinal, stamps now and appends it to the start log.
    pub fn begin(&mut self) -> PipelineResult<Stamp> {
        let stamp = Stamp {
            ordinal: self.next_ordinal,
            time: TimeUtility::now_secs(),
        };
        self.start.append(stamp)?;
        self.next_ordinal += 1;
        Ok(stamp)
    }

    /// Stamps now and appends it to the end log under an ordinal from `begin`.
    pub fn finish(&mut self, ordinal: u64) -> PipelineResult<Stamp> {
        if ordinal == 0 || ordinal >= self.next_ordinal {
            return Err(PipelineError::Internal(format!(
                "ordinal {} was never begun",
                ordinal
            )));
        }
        let stamp = Stamp {
            ordinal,
            time: TimeUtility::now_secs(),
        };
        self.end.append(stamp)?;
        Ok(stamp)
    }

    /// Writes a start/end pair captured earlier and advances the counter.
    /// `start.ordinal` must be the ordinal `peek_ordinal` returned.
    pub fn commit(&mut self, start: Stamp, end: Stamp) -> PipelineResult<()> {
        if start.ordinal != self.next_ordinal || end.ordinal != start.ordinal {
            return Err(PipelineError::Internal(format!(
                "out-of-order commit: expected ordinal {}, got {}/{}",
                self.next_ordinal, start.ordinal, end.ordinal
            )));
        }
        self.start.append(start)?;
        self.end.append(end)?;
        self.next_ordinal += 1;
        Ok(())
    }
}

/// Session shared by concurrent consumer workers. Every increment-and-append
/// runs inside one short critical section; the lock is never held across an await.
#[derive(Clone)]
pub struct SharedLogSession {
    inner: Arc<Mutex<LogSession>>,
}

impl SharedLogSession {
    pub fn new(session: LogSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    fn lock(&self) -> PipelineResult<MutexGuard<'_, LogSession>> {
        self.inner
            .lock()
            .map_err(|_| PipelineError::Internal("log session lock poisoned".to_string()))
    }

    pub fn begin(&self) -> PipelineResult<Stamp> {
        self.lock()?.begin()
    }

    pub fn finish(&self, ordinal: u64) -> PipelineResult<Stamp> {
        self.lock()?.finish(ordinal)
    }
}
