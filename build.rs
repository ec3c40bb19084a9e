fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Envelopes are declared with prost derives in src/grpc/proto.rs, so the
    // service glue is generated without invoking protoc. proto/proximo.proto
    // documents the same wire contract for non-Rust clients.
    let source = tonic_build::manual::Service::builder()
        .name("MessageSource")
        .package("proximo")
        .method(
            tonic_build::manual::Method::builder()
                .name("consume")
                .route_name("Consume")
                .input_type("crate::grpc::proto::ConsumerRequest")
                .output_type("crate::grpc::proto::Message")
                .codec_path("tonic::codec::ProstCodec")
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    let sink = tonic_build::manual::Service::builder()
        .name("MessageSink")
        .package("proximo")
        .method(
            tonic_build::manual::Method::builder()
                .name("publish")
                .route_name("Publish")
                .input_type("crate::grpc::proto::PublisherRequest")
                .output_type("crate::grpc::proto::Confirmation")
                .codec_path("tonic::codec::ProstCodec")
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[source, sink]);

    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
