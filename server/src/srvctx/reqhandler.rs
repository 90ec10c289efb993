use commons::err::{PipelineError, PipelineResult};
use commons::rpc::chunk;
use commons::rpc::TensorChunk;
use commons::tensor::{decode_tensor, encode_tensor, raw_size_bytes};
use commons::timelog::Stamp;
use log::{debug, error, info, warn};
use ndarray::{ArrayD, IxDyn};
use tokio::sync::mpsc;
use tonic::{Status, Streaming};

use super::ConsumerService;

pub type ResponseSender = mpsc::Sender<Result<TensorChunk, Status>>;

/// Runs one request end to end on the calling worker:
/// decode, log receipt, deserialize, stream the ack back, classify, log completion.
pub async fn handle_request(
    ctx: ConsumerService,
    inbound: Streaming<TensorChunk>,
    producer_ordinal: Option<u64>,
    tx: ResponseSender,
) {
    let (received, tensor) = match receive(&ctx, inbound, producer_ordinal).await {
        Ok(v) => v,
        Err(e) => {
            error!("[{}] Rejected request: {}", e.kind(), e);
            let _ = tx.send(Err(e.into())).await;
            return;
        }
    };
    let ordinal = received.ordinal;

    // Closing the sender ends the response stream before classification starts.
    if let Err(e) = respond(&ctx, tx).await {
        error!("[{}] Request {}: failed to send ack: {}", e.kind(), ordinal, e);
        return;
    }

    // Runs inside the timed window: t_done is stamped after classification.
    if let Err(e) = classify(&ctx, tensor).await {
        error!("[{}] Request {}: {}", e.kind(), ordinal, e);
        return;
    }

    match ctx.session.finish(ordinal) {
        Ok(done) => info!(
            "Request {} done in {:.6}s after receipt",
            ordinal,
            done.time - received.time
        ),
        Err(e) => error!("[{}] Request {}: {}", e.kind(), ordinal, e),
    }
}

async fn receive(
    ctx: &ConsumerService,
    inbound: Streaming<TensorChunk>,
    producer_ordinal: Option<u64>,
) -> PipelineResult<(Stamp, ArrayD<f32>)> {
    let payload = chunk::decode(inbound).await?;
    let received = ctx.session.begin()?;

    match producer_ordinal {
        Some(theirs) if theirs != received.ordinal => warn!(
            "Request {}: producer tagged it as request {}, logs will not line up",
            received.ordinal, theirs
        ),
        _ => {}
    }

    let tensor: ArrayD<f32> = decode_tensor(&payload)?;
    info!(
        "Request {}: received tensor with shape {:?} at {:.6}",
        received.ordinal,
        tensor.shape(),
        received.time
    );
    debug!(
        "Request {}: {} bytes transferred ({} on the wire)",
        received.ordinal,
        raw_size_bytes(&tensor),
        payload.len()
    );
    Ok((received, tensor))
}

/// Small fixed placeholder result, so the response stays tiny whatever the request carried.
pub fn ack_tensor() -> ArrayD<f32> {
    ArrayD::ones(IxDyn(&[1]))
}

async fn respond(ctx: &ConsumerService, tx: ResponseSender) -> PipelineResult<()> {
    let payload = encode_tensor(&ack_tensor())?;
    for frame in chunk::encode(payload, ctx.chunk_size) {
        tx.send(Ok(frame)).await.map_err(|_| {
            PipelineError::Transport(Status::cancelled("producer closed the response stream"))
        })?;
    }
    Ok(())
}

async fn classify(ctx: &ConsumerService, tensor: ArrayD<f32>) -> PipelineResult<()> {
    let classifier = ctx.classifier.clone();
    let name = classifier.name().to_string();
    let logits = tokio::task::spawn_blocking(move || classifier.infer(tensor.view()))
        .await?
        .map_err(|e| PipelineError::stage(&name, e))?;
    debug!("{} produced logits with shape {:?}", name, logits.shape());
    Ok(())
}
