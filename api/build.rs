use tonic_build::manual::{Builder, Method, Service};

const PROST_CODEC: &str = "tonic::codec::ProstCodec";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path(PROST_CODEC)
        .build()
}

fn main() {
    let state_versions = Service::builder()
        .name("StateVersionService")
        .package("wafie.v1")
        .method(unary(
            "get_state_version",
            "GetStateVersion",
            "crate::v1::GetStateVersionRequest",
            "crate::v1::GetStateVersionResponse",
        ))
        .build();

    let protections = Service::builder()
        .name("ProtectionService")
        .package("wafie.v1")
        .method(unary(
            "list_protections",
            "ListProtections",
            "crate::v1::ListProtectionsRequest",
            "crate::v1::ListProtectionsResponse",
        ))
        .build();

    let relay = Service::builder()
        .name("RelayService")
        .package("wafie.v1")
        .method(unary(
            "start_relay",
            "StartRelay",
            "crate::v1::StartRelayRequest",
            "crate::v1::StartRelayResponse",
        ))
        .method(unary(
            "stop_relay",
            "StopRelay",
            "crate::v1::StopRelayRequest",
            "crate::v1::StopRelayResponse",
        ))
        .build();

    let runtime = Service::builder()
        .name("RuntimeService")
        .package("runtime.v1")
        .method(unary(
            "container_status",
            "ContainerStatus",
            "crate::cri::ContainerStatusRequest",
            "crate::cri::ContainerStatusResponse",
        ))
        .build();

    Builder::new().compile(&[state_versions, protections, relay, runtime]);

    println!("cargo:rerun-if-changed=build.rs");
}
