use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use commons::config::{NORM_MEAN, NORM_STD};
use commons::err::{PipelineError, PipelineResult};
use commons::rpc::grpc::GrpcTX;
use commons::stages::InferenceStage;
use commons::tensor::encode_tensor;
use commons::timelog::{LogSession, Stamp};
use commons::utils::TimeUtility;
use commons::vision::{generate_synthetic_boxes, normalize, roi_align, RoiBox};
use log::{debug, error, info};
use ndarray::Array4;
use rand::rngs::StdRng;
mod resphandler;

/// How the producer cuts regions out of its input image.
#[derive(Debug, Clone, Copy)]
pub struct RoiConfig {
    pub num_boxes: usize,
    pub box_size: usize,
    pub roi_size: usize,
}

/// Timing of one completed request, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct RequestOutcome {
    pub ordinal: u64,
    pub compute_secs: f64,
    pub round_trip_secs: f64,
}

/// Producer side of the pipeline: one image, one connection, one log session,
/// requests issued strictly one after another.
pub struct ProducerService {
    tx: GrpcTX,
    session: LogSession,
    detector: Arc<dyn InferenceStage>,
    image: Arc<Array4<f32>>,
    roi: RoiConfig,
    rng: StdRng,
}

#[derive(Debug)]
pub struct BenchmarkStats {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub total_duration_ms: u128,
    pub min_latency_ms: u128,
    pub max_latency_ms: u128,
    pub avg_latency_ms: f64,
    pub avg_compute_ms: f64,
}

impl ProducerService {
    pub fn new(
        tx: GrpcTX,
        session: LogSession,
        detector: Arc<dyn InferenceStage>,
        image: Array4<f32>,
        roi: RoiConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            tx,
            session,
            detector,
            image: Arc::new(image),
            roi,
            rng,
        }
    }

    /// Ordinal the next successful request will be logged under.
    pub fn next_ordinal(&self) -> u64 {
        self.session.peek_ordinal()
    }

    /// Runs one request: detect, crop, normalize, serialize, stream, await the ack.
    /// Both producer log lines are written only once the ack has been decoded, so
    /// a failed request leaves no trace and its ordinal goes to the next one.
    pub async fn run_request(&mut self) -> PipelineResult<RequestOutcome> {
        match self.exchange().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.tx.observe_failure(&e);
                Err(e)
            }
        }
    }

    async fn exchange(&mut self) -> PipelineResult<RequestOutcome> {
        let ordinal = self.session.peek_ordinal();
        let t_start = Stamp {
            ordinal,
            time: TimeUtility::now_secs(),
        };

        let payload = self.prepare_payload().await?;
        let pending = self.tx.open_exchange(ordinal, Bytes::from(payload)).await?;
        // Handed to the transport, not necessarily on the wire yet.
        let t_sent = Stamp {
            ordinal,
            time: TimeUtility::now_secs(),
        };

        let response = pending.complete().await?;
        resphandler::process_ack(ordinal, &response)?;
        self.session.commit(t_start, t_sent)?;

        Ok(RequestOutcome {
            ordinal,
            compute_secs: t_sent.time - t_start.time,
            round_trip_secs: TimeUtility::now_secs() - t_start.time,
        })
    }

    async fn prepare_payload(&mut self) -> PipelineResult<Vec<u8>> {
        let (_, _, height, width) = self.image.dim();
        let boxes: Vec<RoiBox> = generate_synthetic_boxes(
            &mut self.rng,
            self.roi.num_boxes,
            height,
            width,
            self.roi.box_size,
            self.roi.box_size,
        )
        .map_err(|e| PipelineError::stage("roi", e))?;

        let detector = self.detector.clone();
        let image = self.image.clone();
        let roi_size = self.roi.roi_size;
        tokio::task::spawn_blocking(move || -> PipelineResult<Vec<u8>> {
            let detections = detector
                .infer(image.view().into_dyn())
                .map_err(|e| PipelineError::stage(detector.name(), e))?;
            debug!(
                "{} returned {:?}, cropping {} synthetic box(es) instead",
                detector.name(),
                detections.shape(),
                boxes.len()
            );

            let mut crops =
                roi_align(&image, &boxes, roi_size).map_err(|e| PipelineError::stage("roi", e))?;
            normalize(&mut crops, &NORM_MEAN, &NORM_STD)
                .map_err(|e| PipelineError::stage("roi", e))?;
            encode_tensor(&crops.into_dyn())
        })
        .await?
    }

    /// Issues `iterations` requests back to back. Failed requests are counted
    /// and logged, and the run carries on with the next one.
    pub async fn benchmark(&mut self, iterations: usize) -> BenchmarkStats {
        let mut stats = BenchmarkStats::new(iterations);
        let start_time = Instant::now();

        for i in 0..iterations {
            let request_start = Instant::now();
            match self.run_request().await {
                Ok(outcome) => {
                    stats.record_success(request_start.elapsed(), outcome.compute_secs);
                    info!(
                        "Request {} ok: compute {:.6}s, round trip {:.6}s",
                        outcome.ordinal, outcome.compute_secs, outcome.round_trip_secs
                    );
                }
                Err(e) => {
                    stats.failed_requests += 1;
                    error!(
                        "[{}] Iteration {} failed, not logged: {}",
                        e.kind(),
                        i + 1,
                        e
                    );
                }
            }
        }

        stats.finish(start_time.elapsed());
        stats
    }
}

impl BenchmarkStats {
    fn new(total_requests: usize) -> Self {
        Self {
            total_requests,
            successful_requests: 0,
            failed_requests: 0,
            total_duration_ms: 0,
            min_latency_ms: u128::MAX,
            max_latency_ms: 0,
            avg_latency_ms: 0.0,
            avg_compute_ms: 0.0,
        }
    }

    fn record_success(&mut self, latency: Duration, compute_secs: f64) {
        let latency = latency.as_millis();
        self.successful_requests += 1;
        self.min_latency_ms = self.min_latency_ms.min(latency);
        self.max_latency_ms = self.max_latency_ms.max(latency);
        // running sums until finish() turns them into means
        self.avg_latency_ms += latency as f64;
        self.avg_compute_ms += compute_secs * 1000.0;
    }

    fn finish(&mut self, wall: Duration) {
        if self.successful_requests > 0 {
            self.avg_latency_ms /= self.successful_requests as f64;
            self.avg_compute_ms /= self.successful_requests as f64;
        } else {
            self.min_latency_ms = 0;
        }
        self.total_duration_ms = wall.as_millis();
    }

    pub fn requests_per_second(&self) -> f64 {
        if self.total_duration_ms > 0 {
            (self.successful_requests as f64 * 1000.0) / self.total_duration_ms as f64
        } else {
            0.0
        }
    }

    pub fn print_stats(&self) {
        println!(
            "total={} success={} failed={} duration={} min={} max={} avg={:.2} compute={:.2} tps={:.2}",
            self.total_requests,
            self.successful_requests,
            self.failed_requests,
            self.total_duration_ms,
            self.min_latency_ms,
            self.max_latency_ms,
            self.avg_latency_ms,
            self.avg_compute_ms,
            self.requests_per_second()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use commons::config::LogPaths;
    use commons::rpc::chunk;
    use commons::rpc::grpc::GrpcRX;
    use commons::rpc::{TensorChunk, TensorService};
    use commons::stages::SyntheticDetector;
    use commons::tensor::decode_tensor;
    use commons::vision::synthetic_image;
    use ndarray::{ArrayD, IxDyn};
    use rand::SeedableRng;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tonic::{Request, Response, Status, Streaming};

    const TEST_CHUNK: usize = 8192;
    const ROI: RoiConfig = RoiConfig {
        num_boxes: 3,
        box_size: 16,
        roi_size: 8,
    };

    /// Acks every well-formed ROI batch with a single 1.0.
    struct AckService;

    #[tonic::async_trait]
    impl TensorService for AckService {
        type StreamTensorStream =
            tokio_stream::Iter<std::vec::IntoIter<Result<TensorChunk, Status>>>;

        async fn stream_tensor(
            &self,
            request: Request<Streaming<TensorChunk>>,
        ) -> Result<Response<Self::StreamTensorStream>, Status> {
            let payload = chunk::decode(request.into_inner()).await?;
            let rois: ArrayD<f32> = decode_tensor(&payload)?;
            if rois.shape() != [ROI.num_boxes, 3, ROI.roi_size, ROI.roi_size] {
                return Err(Status::invalid_argument("unexpected roi shape"));
            }
            let ack = encode_tensor(&ArrayD::<f32>::ones(IxDyn(&[1])))?;
            let frames: Vec<_> = chunk::encode(ack, TEST_CHUNK).map(Ok).collect();
            Ok(Response::new(tokio_stream::iter(frames)))
        }
    }

    fn producer(port: u16, paths: &LogPaths) -> ProducerService {
        ProducerService::new(
            GrpcTX::new("127.0.0.1", port, TEST_CHUNK),
            LogSession::create(&paths.producer_start, &paths.producer_end).unwrap(),
            Arc::new(SyntheticDetector::new(Duration::from_millis(1), 4)),
            synthetic_image(64, 48),
            ROI,
            StdRng::seed_from_u64(7),
        )
    }

    fn read_log(path: &Path) -> Vec<(u64, f64)> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| {
                let mut fields = line.split_whitespace();
                (
                    fields.next().unwrap().parse().unwrap(),
                    fields.next().unwrap().parse().unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_benchmark_logs_every_successful_request() {
        let dir = TempDir::new().unwrap();
        let rx = GrpcRX::bind(0, TEST_CHUNK).await.unwrap();
        let port = rx.local_addr().port();
        let (shutdown, signal) = oneshot::channel::<()>();
        let server = tokio::spawn(rx.serve(AckService, async {
            let _ = signal.await;
        }));

        let paths = LogPaths::for_port(dir.path(), port);
        let mut service = producer(port, &paths);
        let stats = service.benchmark(3).await;
        assert_eq!(stats.successful_requests, 3);
        assert_eq!(stats.failed_requests, 0);
        assert!(stats.min_latency_ms <= stats.max_latency_ms);
        assert_eq!(service.next_ordinal(), 4);

        let starts = read_log(&paths.producer_start);
        let sents = read_log(&paths.producer_end);
        assert_eq!(
            starts.iter().map(|(o, _)| *o).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            sents.iter().map(|(o, _)| *o).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for (start, sent) in starts.iter().zip(&sents) {
            assert!(sent.1 >= start.1);
        }

        shutdown.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_request_is_not_logged() {
        let dir = TempDir::new().unwrap();
        // Grab a free port and release it so nothing is listening there.
        let port = {
            let rx = GrpcRX::bind(0, TEST_CHUNK).await.unwrap();
            rx.local_addr().port()
        };
        let paths = LogPaths::for_port(dir.path(), port);
        let mut service = producer(port, &paths);

        let err = service.run_request().await.unwrap_err();
        assert_eq!(err.kind(), commons::err::ErrorKind::ConnectionFailure);
        assert_eq!(service.next_ordinal(), 1);

        let stats = service.benchmark(2).await;
        assert_eq!(stats.failed_requests, 2);
        assert_eq!(stats.min_latency_ms, 0);
        assert!(read_log(&paths.producer_start).is_empty());
        assert!(read_log(&paths.producer_end).is_empty());
    }

    #[test]
    fn test_stats_without_successes() {
        let mut stats = BenchmarkStats::new(5);
        stats.failed_requests = 5;
        stats.finish(Duration::from_millis(0));
        assert_eq!(stats.requests_per_second(), 0.0);
        assert_eq!(stats.avg_latency_ms, 0.0);
    }
}
