use std::sync::Arc;

use commons::rpc::{request_ordinal, TensorChunk, TensorService};
use commons::stages::InferenceStage;
use commons::timelog::SharedLogSession;
use log::{debug, error};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

mod reqhandler;

/// Consumer side of the pipeline. Cloned into every worker; all clones share
/// the log session, the classifier and the worker pool.
#[derive(Clone)]
pub struct ConsumerService {
    session: SharedLogSession,
    classifier: Arc<dyn InferenceStage>,
    workers: Arc<Semaphore>,
    chunk_size: usize,
}

impl ConsumerService {
    pub fn new(
        session: SharedLogSession,
        classifier: Arc<dyn InferenceStage>,
        workers: usize,
        chunk_size: usize,
    ) -> Self {
        Self {
            session,
            classifier,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            chunk_size,
        }
    }
}

#[tonic::async_trait]
impl TensorService for ConsumerService {
    type StreamTensorStream = ReceiverStream<Result<TensorChunk, Status>>;

    async fn stream_tensor(
        &self,
        request: Request<Streaming<TensorChunk>>,
    ) -> Result<Response<Self::StreamTensorStream>, Status> {
        let producer_ordinal = request_ordinal(request.metadata());
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);

        let ctx = self.clone();
        tokio::spawn(async move {
            let _permit = match ctx.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Worker pool closed: {}", e);
                    let _ = tx.send(Err(Status::unavailable("consumer shutting down"))).await;
                    return;
                }
            };
            debug!("Worker picked up request tagged {:?}", producer_ordinal);
            reqhandler::handle_request(ctx, inbound, producer_ordinal, tx).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
