use ndarray::{Array, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::err::{PipelineError, PipelineResult};

/// Element types the wire format can carry, tagged by name so the receiver can
/// reject a buffer encoded with a different element type.
pub trait WireElement: Serialize + for<'d> Deserialize<'d> + Clone + Send + Sync {
    const DTYPE: &'static str;
}

impl WireElement for f32 {
    const DTYPE: &'static str = "f32";
}

impl WireElement for f64 {
    const DTYPE: &'static str = "f64";
}

#[derive(Serialize, Deserialize)]
struct SerializableNDArray<T> {
    dtype: String,
    shape: Vec<usize>,
    data: Vec<T>,
}

/// Serializes an array as a MessagePack `{dtype, shape, data}` map, data in row-major order.
pub fn encode_tensor<T: WireElement>(array: &ArrayD<T>) -> PipelineResult<Vec<u8>> {
    let wire = SerializableNDArray {
        dtype: T::DTYPE.to_string(),
        shape: array.shape().to_vec(),
        data: array.iter().cloned().collect(),
    };
    Ok(rmp_serde::to_vec_named(&wire)?)
}

pub fn decode_tensor<T: WireElement>(bytes: &[u8]) -> PipelineResult<ArrayD<T>> {
    let wire: SerializableNDArray<T> = rmp_serde::from_slice(bytes)?;
    if wire.dtype != T::DTYPE {
        return Err(PipelineError::TensorFormat(format!(
            "expected dtype {}, got {}",
            T::DTYPE,
            wire.dtype
        )));
    }
    Ok(Array::from_shape_vec(IxDyn(&wire.shape), wire.data)?)
}

/// In-memory size of the array's elements, as reported in diagnostics.
pub fn raw_size_bytes<T>(array: &ArrayD<T>) -> usize {
    array.len() * std::mem::size_of::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_keeps_shape_and_values() {
        let array = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4]), |ix| {
            (ix[0] * 100 + ix[1] * 10 + ix[2]) as f32 * 0.5
        });
        let bytes = encode_tensor(&array).unwrap();
        let decoded: ArrayD<f32> = decode_tensor(&bytes).unwrap();
        assert_eq!(decoded, array);
    }

    #[test]
    fn test_dtype_mismatch_is_rejected() {
        let array = ArrayD::<f64>::zeros(IxDyn(&[3]));
        let bytes = encode_tensor(&array).unwrap();
        let err = decode_tensor::<f32>(&bytes).unwrap_err();
        assert!(matches!(err, PipelineError::TensorFormat(_)));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = decode_tensor::<f32>(b"not a tensor").unwrap_err();
        assert!(matches!(err, PipelineError::TensorFormat(_)));
    }

    #[test]
    fn test_shape_data_mismatch_is_rejected() {
        let wire = SerializableNDArray {
            dtype: "f32".to_string(),
            shape: vec![2, 2],
            data: vec![1.0f32, 2.0, 3.0],
        };
        let bytes = rmp_serde::to_vec(&wire).unwrap();
        let err = decode_tensor::<f32>(&bytes).unwrap_err();
        assert!(matches!(err, PipelineError::TensorFormat(_)));
    }

    #[test]
    fn test_raw_size() {
        let array = ArrayD::<f32>::zeros(IxDyn(&[10, 3, 224, 224]));
        assert_eq!(raw_size_bytes(&array), 6_021_120);
    }
}
