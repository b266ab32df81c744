//! Handle for a model served by another process.
//!
//! `predict` is forwarded to the predictor host over v1 REST, v2 REST or gRPC;
//! `explain` to the explainer host. Every call is bounded by the configured
//! timeout and guarded by a circuit breaker. Readiness is the result of the
//! last liveness probe, which retries with a fixed backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dataplane_proto::inference::{grpc_inference_service_client::GrpcInferenceServiceClient, ModelReadyRequest};
use dataplane_resilience::{retry_async, CircuitBreaker, ResilienceError};
use parking_lot::RwLock;
use serde_json::Value;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{DataplaneError, Result};
use crate::infer_type::InferResponse;
use crate::model::{Headers, Model, Payload, Protocol, ResponsePayload};

/// Headers copied onto forwarded requests.
pub const PROPAGATED_HEADERS: [&str; 2] = ["x-request-id", "x-b3-traceid"];

#[derive(Debug, Clone)]
pub struct RemoteModelConfig {
    pub predictor_host: String,
    pub explainer_host: Option<String>,
    pub protocol: Protocol,
    pub timeout: Duration,
    pub probe_retries: usize,
    pub probe_backoff: Duration,
    pub use_ssl: bool,
}

impl RemoteModelConfig {
    pub fn new(predictor_host: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            predictor_host: predictor_host.into(),
            explainer_host: None,
            protocol,
            timeout: Duration::from_secs(60),
            probe_retries: 5,
            probe_backoff: Duration::from_millis(500),
            use_ssl: false,
        }
    }

    fn base_url(&self, host: &str) -> String {
        if host.starts_with("http://") || host.starts_with("https://") { return host.trim_end_matches('/').to_string(); }
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}", host.trim_end_matches('/'))
    }
}

pub struct RemoteModel {
    name: String,
    cfg: RemoteModelConfig,
    http: reqwest::Client,
    channel: RwLock<Option<Channel>>,
    breaker: CircuitBreaker,
    ready: AtomicBool,
}

impl RemoteModel {
    pub fn new(name: impl Into<String>, cfg: RemoteModelConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| DataplaneError::InferenceError(format!("http client: {e}")))?;
        Ok(Self { name: name.into(), cfg, http, channel: RwLock::new(None), breaker: CircuitBreaker::new(5, Duration::from_secs(10)), ready: AtomicBool::new(false) })
    }

    pub fn config(&self) -> &RemoteModelConfig { &self.cfg }

    fn predictor_url(&self) -> String { self.cfg.base_url(&self.cfg.predictor_host) }

    fn channel(&self) -> Result<Channel> {
        if let Some(ch) = self.channel.read().clone() { return Ok(ch); }
        let endpoint = Endpoint::from_shared(self.predictor_url())
            .map_err(|e| DataplaneError::InferenceError(format!("invalid predictor host {}: {e}", self.cfg.predictor_host)))?
            .timeout(self.cfg.timeout);
        let ch = endpoint.connect_lazy();
        *self.channel.write() = Some(ch.clone());
        Ok(ch)
    }

    async fn probe_once(&self) -> Result<()> {
        match self.cfg.protocol {
            Protocol::V1 | Protocol::V2 => {
                let url = match self.cfg.protocol {
                    Protocol::V1 => format!("{}/v1/models/{}", self.predictor_url(), self.name),
                    _ => format!("{}/v2/models/{}/ready", self.predictor_url(), self.name),
                };
                let resp = self.http.get(&url).send().await.map_err(|e| http_error(&url, e))?;
                if resp.status().is_success() { Ok(()) } else { Err(DataplaneError::not_ready(&self.name)) }
            }
            Protocol::GrpcV2 => {
                let mut client = GrpcInferenceServiceClient::new(self.channel()?);
                let resp = client
                    .model_ready(ModelReadyRequest { name: self.name.clone(), version: String::new() })
                    .await
                    .map_err(status_error)?;
                if resp.into_inner().ready { Ok(()) } else { Err(DataplaneError::not_ready(&self.name)) }
            }
        }
    }

    async fn post_json(&self, url: String, body: &Value, headers: &Headers) -> std::result::Result<Value, Forward> {
        let mut req = self.http.post(&url).json(body);
        for h in PROPAGATED_HEADERS {
            if let Some(v) = headers.get(h) { req = req.header(h, v); }
        }
        let resp = req.send().await.map_err(|e| http_error(&url, e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(upstream_status(status, &text, &url));
        }
        resp.json::<Value>().await.map_err(|e| Forward::trip(DataplaneError::InferenceError(format!("invalid JSON from {url}: {e}"))))
    }

    async fn post_raw(&self, url: String, body: Vec<u8>, headers: &Headers) -> std::result::Result<ResponsePayload, Forward> {
        let mut req = self.http.post(&url).body(body);
        if let Some(ct) = headers.get("content-type") { req = req.header("content-type", ct); }
        for h in PROPAGATED_HEADERS {
            if let Some(v) = headers.get(h) { req = req.header(h, v); }
        }
        let resp = req.send().await.map_err(|e| http_error(&url, e))?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| http_error(&url, e))?;
        if !status.is_success() {
            return Err(upstream_status(status, &String::from_utf8_lossy(&bytes), &url));
        }
        Ok(match serde_json::from_slice::<Value>(&bytes) { Ok(v) => ResponsePayload::Json(v), Err(_) => ResponsePayload::Raw(bytes.to_vec()) })
    }

    async fn forward_predict(&self, payload: Payload, headers: &Headers) -> std::result::Result<ResponsePayload, Forward> {
        let base = self.predictor_url();
        match self.cfg.protocol {
            Protocol::V1 => {
                let url = format!("{base}/v1/models/{}:predict", self.name);
                match payload {
                    Payload::Raw(b) => self.post_raw(url, b, headers).await,
                    Payload::Infer(r) => Ok(ResponsePayload::Json(self.post_json(url, &codec::infer_request_to_v1(&r)?, headers).await?)),
                    Payload::Json(v) => Ok(ResponsePayload::Json(self.post_json(url, &v, headers).await?)),
                }
            }
            Protocol::V2 => {
                let url = format!("{base}/v2/models/{}/infer", self.name);
                let request = payload.into_infer_request(&self.name)?;
                let v = self.post_json(url, &request.to_rest(), headers).await?;
                Ok(ResponsePayload::Infer(InferResponse::from_rest(&v)?))
            }
            Protocol::GrpcV2 => {
                let mut request = payload.into_infer_request(&self.name)?;
                request.model_name = self.name.clone();
                let mut msg = tonic::Request::new(request.to_grpc()?);
                for h in PROPAGATED_HEADERS {
                    if let Some(v) = headers.get(h).and_then(|v| v.parse::<MetadataValue<Ascii>>().ok()) { msg.metadata_mut().insert(h, v); }
                }
                let mut client = GrpcInferenceServiceClient::new(self.channel()?);
                let resp = client.model_infer(msg).await.map_err(status_error)?;
                Ok(ResponsePayload::Infer(InferResponse::from_grpc(resp.into_inner())?))
            }
        }
    }

    async fn forward_explain(&self, payload: Payload, headers: &Headers) -> std::result::Result<ResponsePayload, Forward> {
        let host = self.cfg.explainer_host.as_deref().ok_or_else(|| DataplaneError::NotImplemented(format!("Model {} does not support explain", self.name)))?;
        let base = self.cfg.base_url(host);
        match self.cfg.protocol {
            Protocol::V1 => {
                let body = match payload { Payload::Infer(r) => codec::infer_request_to_v1(&r)?, other => other.into_json()? };
                Ok(ResponsePayload::Json(self.post_json(format!("{base}/v1/models/{}:explain", self.name), &body, headers).await?))
            }
            Protocol::V2 => {
                let request = payload.into_infer_request(&self.name)?;
                Ok(ResponsePayload::Json(self.post_json(format!("{base}/v2/models/{}/explain", self.name), &request.to_rest(), headers).await?))
            }
            Protocol::GrpcV2 => Err(DataplaneError::NotImplemented("explain is not available over gRPC".into()).into()),
        }
    }

    /// Runs a forwarding call under the timeout and the breaker. Only
    /// failures attributed to the predictor count towards opening the circuit.
    async fn guarded<F, Fut>(&self, op: F) -> Result<ResponsePayload>
    where F: FnOnce() -> Fut, Fut: std::future::Future<Output = std::result::Result<ResponsePayload, Forward>> {
        let timeout = self.cfg.timeout;
        let name = self.name.clone();
        self.breaker
            .call_if(
                || async move {
                    tokio::time::timeout(timeout, op())
                        .await
                        .map_err(|_| Forward::trip(DataplaneError::Timeout(format!("request to model {name} timed out after {}s", timeout.as_secs_f64()))))?
                },
                |f: &Forward| f.trips,
            )
            .await
            .map_err(|f| f.error)
    }
}

/// A forwarding failure and whether it is the predictor's fault (transport
/// error, timeout, 5xx) rather than the request's.
#[derive(Debug)]
struct Forward { error: DataplaneError, trips: bool }

impl Forward {
    fn trip(error: DataplaneError) -> Self { Self { error, trips: true } }
}

impl From<DataplaneError> for Forward {
    fn from(error: DataplaneError) -> Self {
        let trips = matches!(error, DataplaneError::Timeout(_));
        Self { error, trips }
    }
}

impl From<ResilienceError> for Forward {
    fn from(e: ResilienceError) -> Self { Self { error: e.into(), trips: false } }
}

impl From<Forward> for DataplaneError {
    fn from(f: Forward) -> Self { f.error }
}

fn http_error(url: &str, e: reqwest::Error) -> Forward {
    if e.is_timeout() { Forward::trip(DataplaneError::Timeout(format!("request to {url} timed out"))) } else { Forward::trip(DataplaneError::InferenceError(format!("request to {url} failed: {e}"))) }
}

/// Non-2xx upstream reply. 4xx means the forwarded request was refused and
/// leaves the breaker alone.
fn upstream_status(status: reqwest::StatusCode, body: &str, url: &str) -> Forward {
    Forward { error: DataplaneError::InferenceError(format!("{status}, '{body}', for url: {url}")), trips: status.is_server_error() }
}

fn status_error(s: tonic::Status) -> Forward {
    use tonic::Code;
    let trips = matches!(s.code(), Code::Unavailable | Code::DeadlineExceeded | Code::Internal | Code::Unknown | Code::DataLoss);
    let error = match s.code() {
        Code::DeadlineExceeded => DataplaneError::Timeout(s.message().to_string()),
        Code::NotFound => DataplaneError::ModelNotFound(s.message().to_string()),
        Code::InvalidArgument => DataplaneError::InvalidInput(s.message().to_string()),
        _ => DataplaneError::InferenceError(format!("{:?}: {}", s.code(), s.message())),
    };
    Forward { error, trips }
}

#[async_trait]
impl Model for RemoteModel {
    fn name(&self) -> &str { &self.name }

    fn ready(&self) -> bool { self.ready.load(Ordering::SeqCst) }

    fn protocol(&self) -> Protocol { self.cfg.protocol }

    async fn load(&self) -> Result<bool> {
        let attempts = self.cfg.probe_retries.max(1);
        let res = retry_async(|| self.probe_once(), attempts, self.cfg.probe_backoff).await;
        let ok = res.is_ok();
        self.ready.store(ok, Ordering::SeqCst);
        match res {
            Ok(()) => info!(target: "dataplane.remote", model = %self.name, host = %self.cfg.predictor_host, protocol = %self.cfg.protocol, "remote predictor live"),
            Err(ref e) => warn!(target: "dataplane.remote", model = %self.name, host = %self.cfg.predictor_host, attempts, error = %e, "remote predictor probe failed"),
        }
        Ok(ok)
    }

    async fn predict(&self, payload: Payload, headers: &Headers) -> Result<ResponsePayload> {
        debug!(model = %self.name, protocol = %self.cfg.protocol, "forwarding predict");
        self.guarded(|| self.forward_predict(payload, headers)).await
    }

    async fn explain(&self, payload: Payload, headers: &Headers) -> Result<ResponsePayload> {
        self.guarded(|| self.forward_explain(payload, headers)).await
    }

    async fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.channel.write().take();
    }
}
