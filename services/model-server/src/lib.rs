//! Model server: REST and gRPC front ends over one shared dataplane.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dataplane_core::error::Result as DataplaneResult;
use dataplane_core::{DataPlane, DataplaneError, Model, ModelFactory, ModelRepository, RemoteModel, RemoteModelConfig};
use tokio::sync::watch;
use tracing::{info, warn};

pub mod config;
pub mod grpc;
pub mod http;

use config::ServerConfig;

/// Creates a [`RemoteModel`] for any requested name, all pointing at the
/// configured predictor.
pub struct RemoteModelFactory { cfg: RemoteModelConfig }

impl RemoteModelFactory {
    pub fn new(cfg: RemoteModelConfig) -> Self { Self { cfg } }
}

#[async_trait]
impl ModelFactory for RemoteModelFactory {
    async fn create(&self, name: &str, _models_dir: &Path) -> DataplaneResult<Arc<dyn Model>> {
        Ok(Arc::new(RemoteModel::new(name, self.cfg.clone())?))
    }
}

/// Repository for `cfg`; with a predictor host, names are backed by remote
/// handles, otherwise `factory` (if any) builds them.
pub fn build_repository(cfg: &ServerConfig, factory: Option<Arc<dyn ModelFactory>>) -> Result<Arc<ModelRepository>> {
    let mut repo = ModelRepository::new(&cfg.models_dir);
    let factory = match cfg.remote_config()? {
        Some(remote) => Some(Arc::new(RemoteModelFactory::new(remote)) as Arc<dyn ModelFactory>),
        None => factory,
    };
    if let Some(f) = factory {
        repo = repo.with_factory(f);
    }
    Ok(Arc::new(repo))
}

/// Loads every configured model name. Failures are logged and skipped so the
/// server still starts; the model reports not ready until loaded again.
pub async fn load_startup_models(repo: &ModelRepository, names: &[String]) {
    for name in names {
        match repo.load(name).await {
            Ok(true) => info!(target: "model-server", model = %name, "model ready"),
            Ok(false) => warn!(target: "model-server", model = %name, "model loaded but not ready"),
            Err(e @ DataplaneError::ModelMissing(_)) => warn!(target: "model-server", model = %name, error = %e, "model files missing"),
            Err(e) => warn!(target: "model-server", model = %name, kind = e.kind(), error = %e, "model failed to load"),
        }
    }
}

/// Serves HTTP (and gRPC when enabled) until `shutdown` resolves, then stops
/// every model.
pub async fn run(cfg: ServerConfig, dataplane: Arc<DataPlane>, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let (tx, rx) = watch::channel(false);
    let wait = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let listener = tokio::net::TcpListener::bind(cfg.http_addr()).await?;
    let app = http::router(dataplane.clone(), cfg.max_body_bytes);
    let http_task = tokio::spawn(http::serve(listener, app, wait(rx.clone())));

    let grpc_task = if cfg.enable_grpc {
        let svc = grpc::InferenceService::new(dataplane.clone());
        Some(tokio::spawn(grpc::serve(cfg.grpc_addr(), svc, cfg.max_body_bytes, wait(rx.clone()))))
    } else {
        None
    };

    shutdown.await;
    info!(target: "model-server", "shutdown requested");
    let _ = tx.send(true);

    http_task.await??;
    if let Some(t) = grpc_task {
        t.await??;
    }
    dataplane.repository().stop_all().await;
    info!(target: "model-server", "server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn predictor_host_installs_remote_factory() {
        let cfg = ServerConfig { predictor_host: Some("127.0.0.1:1".into()), probe_retries: 1, probe_backoff_ms: 1, request_timeout_secs: 1, ..Default::default() };
        let repo = build_repository(&cfg, None).unwrap();
        // unreachable predictor: registered, probe fails, not ready
        let _ = repo.load("sk").await;
        assert!(repo.get_model("sk").is_some());
        assert!(!repo.is_model_ready("sk"));
    }

    #[tokio::test]
    async fn without_factory_load_is_not_found() {
        let repo = build_repository(&ServerConfig::default(), None).unwrap();
        assert_eq!(repo.load("nope").await.unwrap_err(), DataplaneError::ModelNotFound("nope".into()));
        load_startup_models(&repo, &["nope".to_string()]).await;
        assert!(repo.model_names().is_empty());
    }
}
