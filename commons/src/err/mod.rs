use std::fmt;
use thiserror::Error;

/// Coarse failure classes, used to tag log lines so failed requests stand out
/// from completed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportFailure,
    ConnectionFailure,
    TruncatedStream,
    TensorFormat,
    StageFailure,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransportFailure => "TRANSPORT_FAILURE",
            ErrorKind::ConnectionFailure => "CONNECTION_FAILURE",
            ErrorKind::TruncatedStream => "TRUNCATED_STREAM",
            ErrorKind::TensorFormat => "TENSOR_FORMAT",
            ErrorKind::StageFailure => "STAGE_FAILURE",
            ErrorKind::Io => "IO",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    /// The peer reset or refused the call, or the stream carried an error status.
    #[error("transport failure: {0}")]
    Transport(#[from] tonic::Status),
    #[error("stream closed after {frames} frame(s) / {bytes} byte(s) without a final chunk")]
    TruncatedStream { frames: usize, bytes: usize },
    #[error("tensor format mismatch: {0}")]
    TensorFormat(String),
    #[error("inference stage {stage} failed: {reason}")]
    Stage { stage: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Channels connect lazily, so a refused or dropped connection
            // arrives as an Unavailable status on the call itself.
            PipelineError::Transport(status) if status.code() == tonic::Code::Unavailable => {
                ErrorKind::ConnectionFailure
            }
            PipelineError::Transport(_) => ErrorKind::TransportFailure,
            PipelineError::TruncatedStream { .. } => ErrorKind::TruncatedStream,
            PipelineError::TensorFormat(_) => ErrorKind::TensorFormat,
            PipelineError::Stage { .. } => ErrorKind::StageFailure,
            PipelineError::Io(_) => ErrorKind::Io,
            PipelineError::Join(_) | PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn stage(stage: &str, err: anyhow::Error) -> Self {
        PipelineError::Stage {
            stage: stage.to_string(),
            reason: format!("{:#}", err),
        }
    }
}

impl From<rmp_serde::decode::Error> for PipelineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PipelineError::TensorFormat(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for PipelineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PipelineError::TensorFormat(e.to_string())
    }
}

impl From<ndarray::ShapeError> for PipelineError {
    fn from(e: ndarray::ShapeError) -> Self {
        PipelineError::TensorFormat(e.to_string())
    }
}

impl From<PipelineError> for tonic::Status {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Transport(status) => status,
            PipelineError::TruncatedStream { .. } => tonic::Status::data_loss(err.to_string()),
            PipelineError::TensorFormat(_) => tonic::Status::invalid_argument(err.to_string()),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
