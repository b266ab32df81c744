//! REST binding: v1 and v2 inference routes, health, metadata, repository
//! extension and `/metrics`.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dataplane_core::{DataPlane, DataplaneError, Headers, InferenceOutcome, Protocol, ResponseBody};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState { pub dataplane: Arc<DataPlane> }

/// Error body `{"error": "<message>"}` with the mapped status.
pub struct ApiError(pub DataplaneError);

impl From<DataplaneError> for ApiError {
    fn from(e: DataplaneError) -> Self { Self(e) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct ModelPath { name: String, version: Option<String> }

#[derive(Debug, Default, Deserialize)]
struct IndexFilter { #[serde(default)] ready: bool }

pub fn router(dataplane: Arc<DataPlane>, max_body_bytes: usize) -> Router {
    let v2_model = Router::new()
        .route("/", get(v2_model_metadata))
        .route("/ready", get(v2_model_ready))
        .route("/infer", post(v2_infer))
        .route("/explain", post(v2_explain));
    Router::new()
        .route("/", get(|| async { Json(json!({"status": "alive"})) }))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/models/:model", get(v1_model_ready).post(v1_verb))
        .route("/v2", get(server_metadata))
        .route("/v2/health/live", get(live))
        .route("/v2/health/ready", get(ready))
        .route("/v2/models", get(list_models))
        .nest("/v2/models/:name", v2_model.clone())
        .nest("/v2/models/:name/versions/:version", v2_model)
        .route("/v2/repository/index", get(repository_index_get).post(repository_index_post))
        .route("/v2/repository/models/:name/load", post(repository_load))
        .route("/v2/repository/models/:name/unload", post(repository_unload))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { dataplane })
}

pub async fn serve(listener: TcpListener, app: Router, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    info!(target: "model-server.http", addr = ?listener.local_addr().ok(), "HTTP server listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

/// Lower-cased header map handed to the dataplane.
pub fn to_headers(map: &HeaderMap) -> Headers {
    map.iter().filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))).collect()
}

fn outcome_response(outcome: InferenceOutcome) -> Response {
    let mut resp = match outcome.body {
        ResponseBody::Json(v) => Json(v).into_response(),
        ResponseBody::Bytes(b) => b.into_response(),
        ResponseBody::Grpc(_) => return ApiError(DataplaneError::InferenceError("gRPC response on REST route".into())).into_response(),
    };
    for (k, v) in outcome.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(k), HeaderValue::try_from(v)) {
            resp.headers_mut().insert(name, value);
        }
    }
    resp
}

async fn not_found(uri: Uri) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": format!("Not Found: {}", uri.path())}))).into_response()
}

async fn metrics() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], dataplane_core::metrics_text())
}

async fn list_models(State(st): State<AppState>) -> Json<Value> { Json(json!({"models": st.dataplane.model_names()})) }

async fn server_metadata(State(st): State<AppState>) -> Json<Value> { Json(json!(st.dataplane.metadata())) }

async fn live(State(st): State<AppState>) -> Json<Value> { Json(json!({"live": st.dataplane.live()})) }

async fn ready(State(st): State<AppState>) -> Response {
    let ready = st.dataplane.ready();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({"ready": ready}))).into_response()
}

async fn model_ready_body(st: &AppState, name: &str) -> ApiResult<Json<Value>> {
    if st.dataplane.model_ready(name)? { Ok(Json(json!({"name": name, "ready": true}))) } else { Err(DataplaneError::not_ready(name).into()) }
}

async fn v1_model_ready(State(st): State<AppState>, Path(model): Path<String>) -> ApiResult<Json<Value>> {
    if model.contains(':') { return Err(DataplaneError::InvalidInput(format!("{model} is not a model name")).into()); }
    model_ready_body(&st, &model).await
}

/// `POST /v1/models/{name}:predict` and `:explain`.
async fn v1_verb(State(st): State<AppState>, Path(model): Path<String>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let (name, verb) = model.rsplit_once(':').ok_or_else(|| DataplaneError::InvalidInput(format!("unsupported verb for {model}")))?;
    let h = to_headers(&headers);
    let outcome = match verb {
        "predict" => st.dataplane.infer(name, dataplane_core::RequestBody::Rest(body.to_vec()), &h, Protocol::V1).await?,
        "explain" => st.dataplane.explain(name, dataplane_core::RequestBody::Rest(body.to_vec()), &h, Protocol::V1).await?,
        other => return Err(DataplaneError::InvalidInput(format!("unsupported verb {other}")).into()),
    };
    Ok(outcome_response(outcome))
}

async fn v2_model_metadata(State(st): State<AppState>, Path(p): Path<ModelPath>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(st.dataplane.model_metadata(&p.name)?)))
}

async fn v2_model_ready(State(st): State<AppState>, Path(p): Path<ModelPath>) -> ApiResult<Json<Value>> { model_ready_body(&st, &p.name).await }

async fn v2_infer(State(st): State<AppState>, Path(p): Path<ModelPath>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    debug!(model = %p.name, version = ?p.version, bytes = body.len(), "v2 infer");
    let outcome = st.dataplane.infer(&p.name, dataplane_core::RequestBody::Rest(body.to_vec()), &to_headers(&headers), Protocol::V2).await?;
    Ok(outcome_response(outcome))
}

async fn v2_explain(State(st): State<AppState>, Path(p): Path<ModelPath>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let outcome = st.dataplane.explain(&p.name, dataplane_core::RequestBody::Rest(body.to_vec()), &to_headers(&headers), Protocol::V2).await?;
    Ok(outcome_response(outcome))
}

async fn repository_index_get(State(st): State<AppState>, Query(filter): Query<IndexFilter>) -> Json<Value> {
    Json(json!(st.dataplane.repository_extension().index(filter.ready)))
}

async fn repository_index_post(State(st): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let filter: IndexFilter = if body.is_empty() { IndexFilter::default() } else { serde_json::from_slice(&body).map_err(DataplaneError::from)? };
    Ok(Json(json!(st.dataplane.repository_extension().index(filter.ready))))
}

async fn repository_load(State(st): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    st.dataplane.repository_extension().load(&name).await?;
    Ok(Json(json!({"name": name, "load": true})))
}

async fn repository_unload(State(st): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    st.dataplane.repository_extension().unload(&name).await?;
    Ok(Json(json!({"name": name, "unload": true})))
}
