//! Core of the inference dataplane: typed tensors, the model capability
//! interface, the model repository and the protocol engine shared by the REST
//! and gRPC front ends.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub mod cloudevent;
pub mod codec;
pub mod dataplane;
pub mod error;
pub mod infer_type;
pub mod metrics;
pub mod model;
pub mod remote;
pub mod repository;
pub mod repository_extension;

pub use dataplane::{DataPlane, DataPlaneConfig, InferenceOutcome, RequestBody, ResponseBody, ServerMetadata};
pub use error::{DataplaneError, Result as DataplaneResult};
pub use infer_type::{Datatype, InferInput, InferOutput, InferParameter, InferRequest, InferResponse, InferTensor, TensorData};
pub use model::{Headers, Model, ModelMetadata, Payload, Protocol, ResponsePayload, TensorMetadata};
pub use remote::{RemoteModel, RemoteModelConfig};
pub use repository::{DirectoryModelFactory, ModelFactory, ModelRepository};
pub use repository_extension::{ModelRepositoryExtension, ModelState, RepositoryIndexEntry};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

fn json_log_enabled() -> bool {
    std::env::var("MODEL_SERVER_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

/// Installs the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `json` (or `MODEL_SERVER_JSON_LOG=1`) switches to JSON lines.
pub fn init_tracing(service: &str, default_level: &str, json: bool) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
        let fmt_layer = if json || json_log_enabled() {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "dataplane", service, "tracing initialized");
    Ok(())
}

/// Forces registration of the dataplane metrics so `/metrics` lists them
/// before the first request.
pub fn init_metrics() {
    once_cell::sync::Lazy::force(&metrics::DATAPLANE_METRICS);
}

pub fn metrics_text() -> String { metrics::gather_text() }
