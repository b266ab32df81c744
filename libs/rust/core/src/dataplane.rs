//! Inference protocol engine shared by the REST and gRPC bindings.
//!
//! `infer` / `explain` run one request through
//! lookup -> readiness gate -> decode -> preprocess -> validate -> predict
//! -> postprocess -> encode. Every failure comes back as a [`DataplaneError`];
//! the transports only map it to a status.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dataplane_proto::inference as pb;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::cloudevent::{self, CloudEventOptions, EventContext};
use crate::codec;
use crate::error::{DataplaneError, Result};
use crate::infer_type::{InferRequest, RequestedOutput};
use crate::metrics::{self, Stage, StageLatencies};
use crate::model::{self, Headers, Model, ModelMetadata, Payload, Protocol, ResponsePayload};
use crate::repository::ModelRepository;
use crate::repository_extension::ModelRepositoryExtension;

pub const REPOSITORY_EXTENSION: &str = "model_repository_extension";

#[derive(Debug, Clone)]
pub struct DataPlaneConfig {
    pub server_name: String,
    /// Load an unready model inline on first request instead of failing.
    pub lazy_load: bool,
    pub enable_latency_logging: bool,
    pub cloudevents: CloudEventOptions,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self { server_name: "model-server".into(), lazy_load: false, enable_latency_logging: false, cloudevents: CloudEventOptions::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerMetadata { pub name: String, pub version: String, pub extensions: Vec<String> }

/// Request body as received by a transport.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Rest(Vec<u8>),
    Grpc(pb::ModelInferRequest),
}

/// Response body in the requesting transport's wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    /// Already encoded; `content-type` is in the outcome headers.
    Bytes(Vec<u8>),
    Grpc(pb::ModelInferResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutcome { pub body: ResponseBody, pub headers: Headers }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb { Predict, Explain }

pub struct DataPlane {
    repository: Arc<ModelRepository>,
    extension: ModelRepositoryExtension,
    cfg: DataPlaneConfig,
}

impl DataPlane {
    pub fn new(repository: Arc<ModelRepository>, cfg: DataPlaneConfig) -> Self {
        let extension = ModelRepositoryExtension::new(repository.clone());
        Self { repository, extension, cfg }
    }

    pub fn repository(&self) -> &Arc<ModelRepository> { &self.repository }

    pub fn repository_extension(&self) -> &ModelRepositoryExtension { &self.extension }

    pub fn config(&self) -> &DataPlaneConfig { &self.cfg }

    pub fn live(&self) -> bool { true }

    /// True when every registered model is ready.
    pub fn ready(&self) -> bool { self.repository.get_models().values().all(|m| m.ready()) }

    pub fn model_ready(&self, name: &str) -> Result<bool> { Ok(self.get_model(name)?.ready()) }

    pub fn metadata(&self) -> ServerMetadata {
        ServerMetadata { name: self.cfg.server_name.clone(), version: env!("CARGO_PKG_VERSION").to_string(), extensions: vec![REPOSITORY_EXTENSION.to_string()] }
    }

    pub fn model_metadata(&self, name: &str) -> Result<ModelMetadata> { Ok(self.get_model(name)?.metadata()) }

    pub fn model_names(&self) -> Vec<String> { self.repository.model_names() }

    pub fn get_model(&self, name: &str) -> Result<Arc<dyn Model>> {
        self.repository.get_model(name).ok_or_else(|| DataplaneError::ModelNotFound(name.to_string()))
    }

    #[instrument(level = "debug", skip(self, body, headers), fields(model = %model_name, protocol = %protocol))]
    pub async fn infer(&self, model_name: &str, body: RequestBody, headers: &Headers, protocol: Protocol) -> Result<InferenceOutcome> {
        self.dispatch(Verb::Predict, model_name, body, headers, protocol).await
    }

    #[instrument(level = "debug", skip(self, body, headers), fields(model = %model_name, protocol = %protocol))]
    pub async fn explain(&self, model_name: &str, body: RequestBody, headers: &Headers, protocol: Protocol) -> Result<InferenceOutcome> {
        self.dispatch(Verb::Explain, model_name, body, headers, protocol).await
    }

    async fn dispatch(&self, verb: Verb, model_name: &str, body: RequestBody, headers: &Headers, protocol: Protocol) -> Result<InferenceOutcome> {
        let res = self.run(verb, model_name, body, headers, protocol).await;
        match &res {
            Ok(_) => metrics::count_request(model_name, "ok"),
            Err(e) => {
                metrics::count_request(model_name, e.kind());
                if e.http_status() >= 500 { warn!(target: "dataplane", model = %model_name, kind = e.kind(), error = %e, "inference failed") }
                else { debug!(target: "dataplane", model = %model_name, kind = e.kind(), error = %e, "request rejected") }
            }
        }
        res
    }

    async fn ensure_ready(&self, model: &Arc<dyn Model>) -> Result<()> {
        if model.ready() { return Ok(()); }
        if !self.cfg.lazy_load { return Err(DataplaneError::not_ready(model.name())); }
        info!(target: "dataplane", model = %model.name(), "lazy loading model on first request");
        self.repository.load(model.name()).await.map_err(|e| DataplaneError::ModelNotReady { name: model.name().to_string(), detail: Some(e.to_string()) })?;
        if model.ready() { Ok(()) } else { Err(DataplaneError::not_ready(model.name())) }
    }

    fn decode(&self, body: RequestBody, headers: &Headers, protocol: Protocol) -> Result<(Payload, Option<EventContext>)> {
        match body {
            RequestBody::Grpc(msg) => Ok((Payload::Infer(InferRequest::from_grpc(msg)?), None)),
            RequestBody::Rest(bytes) => {
                let (payload, ctx) = match cloudevent::detect(headers) {
                    Some(mode) => {
                        let (ctx, payload) = cloudevent::unwrap(mode, headers, &bytes)?;
                        (payload, Some(ctx))
                    }
                    None if is_json(headers) => (Payload::Json(serde_json::from_slice(&bytes)?), None),
                    None => (Payload::Raw(bytes), None),
                };
                let payload = match (protocol, payload) {
                    (Protocol::V2, Payload::Json(v)) if InferRequest::is_rest_tensor_body(&v) => {
                        // model name comes from the route, not the body
                        Payload::Infer(InferRequest::from_rest("", &v)?)
                    }
                    (_, p) => p,
                };
                Ok((payload, ctx))
            }
        }
    }

    async fn run(&self, verb: Verb, model_name: &str, body: RequestBody, headers: &Headers, protocol: Protocol) -> Result<InferenceOutcome> {
        let started = Instant::now();
        let model = self.get_model(model_name)?;
        self.ensure_ready(&model).await?;

        let (mut payload, event) = self.decode(body, headers, protocol)?;
        let mut requested: Vec<RequestedOutput> = Vec::new();
        let mut request_id = headers.get("x-request-id").cloned();
        if let Payload::Infer(req) = &mut payload {
            req.model_name = model_name.to_string();
            requested = req.outputs.clone();
            if req.id.is_some() { request_id = req.id.clone(); }
        }
        let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut lat = StageLatencies::default();
        let t = Instant::now();
        let payload = contain(model_name, "preprocess", model.preprocess(payload, headers)).await?;
        lat.record(model_name, Stage::Preprocess, t.elapsed());
        model::validate(&payload)?;

        let t = Instant::now();
        let response = match verb {
            Verb::Predict => {
                let r = contain(model_name, "predict", model.predict(payload, headers)).await?;
                lat.record(model_name, Stage::Predict, t.elapsed());
                r
            }
            Verb::Explain => {
                let r = contain(model_name, "explain", model.explain(payload, headers)).await?;
                lat.record(model_name, Stage::Explain, t.elapsed());
                r
            }
        };

        let t = Instant::now();
        let mut response = contain(model_name, "postprocess", model.postprocess(response, headers)).await?;
        lat.record(model_name, Stage::Postprocess, t.elapsed());

        if let ResponsePayload::Infer(r) = &mut response {
            if r.id.is_empty() { r.id = request_id.clone(); }
            if r.model_name.is_empty() { r.model_name = model_name.to_string(); }
            r.retain_requested(&requested)?;
        }

        if self.cfg.enable_latency_logging {
            info!(
                target: "dataplane.latency",
                request_id = %request_id, model = %model_name,
                preprocess_ms = lat.preprocess_ms, predict_ms = lat.predict_ms, explain_ms = lat.explain_ms, postprocess_ms = lat.postprocess_ms,
                total_ms = started.elapsed().as_secs_f64() * 1000.0,
                "request latency"
            );
        }
        self.encode(model_name, &request_id, response, event, protocol)
    }

    fn encode(&self, model_name: &str, request_id: &str, response: ResponsePayload, event: Option<EventContext>, protocol: Protocol) -> Result<InferenceOutcome> {
        if let Some(ctx) = event {
            let response = match (protocol, response) {
                (Protocol::V1, ResponsePayload::Infer(r)) => ResponsePayload::Json(codec::infer_response_to_v1(&r)?),
                (_, r) => r,
            };
            let (bytes, headers) = cloudevent::wrap(&ctx, model_name, response, &self.cfg.cloudevents)?;
            return Ok(InferenceOutcome { body: ResponseBody::Bytes(bytes), headers });
        }
        let mut headers = Headers::new();
        let body = match (protocol, response) {
            (Protocol::GrpcV2, r) => ResponseBody::Grpc(r.into_infer_response(model_name, request_id)?.to_grpc()?),
            (Protocol::V1, ResponsePayload::Infer(r)) => ResponseBody::Json(codec::infer_response_to_v1(&r)?),
            (_, ResponsePayload::Infer(r)) => ResponseBody::Json(r.to_rest()),
            (_, ResponsePayload::Json(v)) => ResponseBody::Json(v),
            (_, ResponsePayload::Raw(b)) => {
                headers.insert("content-type".into(), "application/octet-stream".into());
                ResponseBody::Bytes(b)
            }
        };
        Ok(InferenceOutcome { body, headers })
    }
}

/// Turns a panic inside a model hook into `InferenceError`, keeping the
/// panic message.
async fn contain<T>(model_name: &str, stage: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            error!(target: "dataplane", model = %model_name, stage, panic = %msg, "model panicked");
            Err(DataplaneError::InferenceError(msg))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() { return s.to_string(); }
    if let Some(s) = panic.downcast_ref::<String>() { return s.clone(); }
    "model panicked".to_string()
}

fn is_json(headers: &Headers) -> bool {
    match headers.get("content-type") {
        None => true,
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            // curl -d sends form encoding for JSON bodies
            ct.is_empty() || ct.starts_with("application/json") || ct.contains("+json") || ct.starts_with("text/plain") || ct.starts_with("application/x-www-form-urlencoded")
        }
    }
}
