pub mod chunk;
pub mod grpc; // Expose the grpc submodule

/// One fragment of a streamed payload. Exactly one frame per direction of a
/// call has `is_last` set, and it is the final frame of that direction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorChunk {
    #[prost(bytes = "bytes", tag = "1")]
    pub chunk_data: ::prost::bytes::Bytes,
    #[prost(bool, tag = "2")]
    pub is_last: bool,
}

// Include the generated service stubs
pub mod tensorstream {
    include!(concat!(env!("OUT_DIR"), "/tensorstream.TensorService.rs"));
}

pub use tensorstream::tensor_service_client::TensorServiceClient;
pub use tensorstream::tensor_service_server::{TensorService, TensorServiceServer};

/// Request metadata key carrying the producer's ordinal alongside the call.
pub const ORDINAL_METADATA_KEY: &str = "x-request-ordinal";

/// Reads the producer ordinal attached to a request, if present and well formed.
pub fn request_ordinal(metadata: &tonic::metadata::MetadataMap) -> Option<u64> {
    metadata
        .get(ORDINAL_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
