use tonic_build::manual::{Builder, Method, Service};

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::grpc::proto::{}", input))
        .output_type(format!("crate::grpc::proto::{}", output))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Messages are hand-written prost structs in src/grpc/proto.rs, so the
    // stubs are generated without protoc.
    let bucket_store = Service::builder()
        .name("BucketStore")
        .package("tollgate.v1")
        .method(unary("get", "Get", "GetRequest", "GetResponse"))
        .method(unary("set", "Set", "SetRequest", "SetResponse"))
        .method(unary("take", "Take", "TakeRequest", "TakeResponse"))
        .build();

    let gate = Service::builder()
        .name("Gate")
        .package("tollgate.v1")
        .method(unary("check", "Check", "CheckRequest", "CheckResponse"))
        .build();

    Builder::new().compile(&[bucket_store, gate]);
}
