// Foreman worker library: job registry, executor, dispatch bridge and transport bindings

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod errors;
pub mod executor;
pub mod models;
pub mod registry;
pub mod shutdown;
pub mod telemetry;
pub mod transport;

/// Generated protobuf types and gRPC stubs for the dispatcher protocol
pub mod proto {
    tonic::include_proto!("yggdrasil");
}
