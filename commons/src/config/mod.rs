//! Reference values shared by producer, consumer and analyzer.

use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 50051;
pub const DEFAULT_HOST: &str = "localhost";

/// Upper bound on a single chunk frame's payload (1 MiB).
pub const CHUNK_SIZE: usize = 1024 * 1024;
/// Headroom on top of the chunk size for protobuf framing when sizing gRPC message limits.
pub const FRAME_OVERHEAD: usize = 64 * 1024;

pub const DEFAULT_ITERATIONS: usize = 100;
pub const DEFAULT_WORKERS: usize = 10;

/// Bytes shipped per request by the reference workload: 10 x 3 x 224 x 224 f32 values.
pub const DEFAULT_PAYLOAD_BYTES: u64 = 6_021_120;

pub const DEFAULT_IMAGE_WIDTH: usize = 640;
pub const DEFAULT_IMAGE_HEIGHT: usize = 480;
pub const DEFAULT_NUM_BOXES: usize = 10;
pub const DEFAULT_BOX_SIZE: usize = 100;
pub const DEFAULT_ROI_SIZE: usize = 224;

pub const DEFAULT_DETECTOR_LATENCY_MS: u64 = 5;
pub const DEFAULT_CLASSIFIER_LATENCY_MS: u64 = 10;
pub const DEFAULT_NUM_CLASSES: usize = 1000;

/// ImageNet channel statistics applied after cropping.
pub const NORM_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const NORM_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Largest gRPC message either side must accept for a given chunk size.
pub fn max_message_size(chunk_size: usize) -> usize {
    chunk_size.max(1).saturating_add(FRAME_OVERHEAD)
}

/// The four timestamp logs of one benchmark run. File names carry the server
/// port so concurrent runs on different ports do not collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub producer_start: PathBuf,
    pub producer_end: PathBuf,
    pub consumer_start: PathBuf,
    pub consumer_end: PathBuf,
}

impl LogPaths {
    pub fn for_port(dir: impl AsRef<Path>, port: u16) -> Self {
        let dir = dir.as_ref();
        Self {
            producer_start: dir.join(format!("producer_start_{}.txt", port)),
            producer_end: dir.join(format!("producer_end_{}.txt", port)),
            consumer_start: dir.join(format!("consumer_start_{}.txt", port)),
            consumer_end: dir.join(format!("consumer_end_{}.txt", port)),
        }
    }

    /// Paths in join order: start, sent, received, done.
    pub fn in_join_order(&self) -> [&Path; 4] {
        [
            &self.producer_start,
            &self.producer_end,
            &self.consumer_start,
            &self.consumer_end,
        ]
    }
}
