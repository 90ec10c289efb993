use commons::err::{PipelineError, PipelineResult};
use commons::tensor::decode_tensor;
use log::debug;
use ndarray::ArrayD;

/// Decodes the consumer's acknowledgment. Its values carry no meaning; only
/// the encoding and a non-empty shape are checked.
pub fn process_ack(ordinal: u64, payload: &[u8]) -> PipelineResult<ArrayD<f32>> {
    let ack: ArrayD<f32> = decode_tensor(payload)?;
    if ack.is_empty() {
        return Err(PipelineError::TensorFormat(format!(
            "request {}: empty acknowledgment tensor",
            ordinal
        )));
    }
    debug!("Request {}: ack with shape {:?}", ordinal, ack.shape());
    Ok(ack)
}
