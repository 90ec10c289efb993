fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=build.rs");

    // StreamTensor: one bidirectional stream of chunk frames per request.
    let stream_tensor = tonic_build::manual::Method::builder()
        .name("stream_tensor")
        .route_name("StreamTensor")
        .input_type("crate::rpc::TensorChunk")
        .output_type("crate::rpc::TensorChunk")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("TensorService")
        .package("tensorstream")
        .method(stream_tensor)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
    Ok(())
}
