// Generated protobuf modules via tonic's include_proto! macro.
// The open inference protocol lives in package `inference`.
// Usage example:
//   use dataplane_proto::inference::grpc_inference_service_server::GrpcInferenceServiceServer;
//   use dataplane_proto::inference::{ModelInferRequest, ModelInferResponse};

pub mod inference { tonic::include_proto!("inference"); }

/// SHA-256 of the compiled .proto sources, for build provenance.
pub const PROTO_SCHEMA_VERSION: &str = env!("PROTO_SCHEMA_VERSION");

// Re-export the message types at crate root (optional convenience)
pub use inference::*;
