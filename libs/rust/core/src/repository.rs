//! Process-wide name -> model map.
//!
//! Reads (lookups, readiness) take a short `parking_lot` read lock and never
//! await. Load and unload of the same name are serialised through a per-name
//! async mutex; different names and in-flight predicts are not.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::error::{DataplaneError, Result};
use crate::model::Model;

pub const DEFAULT_MODELS_DIR: &str = "/mnt/models";

/// Builds a model for a name the repository does not hold yet.
#[async_trait]
pub trait ModelFactory: Send + Sync {
    async fn create(&self, name: &str, models_dir: &Path) -> Result<Arc<dyn Model>>;
}

type BuildFn = dyn Fn(&str, PathBuf) -> Result<Arc<dyn Model>> + Send + Sync;

/// Resolves `models_dir/<name>` and hands the directory to `build`.
/// A missing directory is `ModelMissing`.
pub struct DirectoryModelFactory { build: Box<BuildFn> }

impl DirectoryModelFactory {
    pub fn new<F>(build: F) -> Self where F: Fn(&str, PathBuf) -> Result<Arc<dyn Model>> + Send + Sync + 'static { Self { build: Box::new(build) } }
}

#[async_trait]
impl ModelFactory for DirectoryModelFactory {
    async fn create(&self, name: &str, models_dir: &Path) -> Result<Arc<dyn Model>> {
        let dir = models_dir.join(name);
        match tokio::fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => (self.build)(name, dir),
            _ => Err(DataplaneError::ModelMissing(dir.display().to_string())),
        }
    }
}

type NameLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

struct NameLease<'a> { locks: &'a NameLocks, name: &'a str, lock: Arc<tokio::sync::Mutex<()>> }

impl Drop for NameLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // the map's reference plus ours
        if Arc::strong_count(&self.lock) == 2 && locks.get(self.name).is_some_and(|l| Arc::ptr_eq(l, &self.lock)) { locks.remove(self.name); }
    }
}

pub struct ModelRepository {
    models: RwLock<HashMap<String, Arc<dyn Model>>>,
    models_dir: PathBuf,
    factory: Option<Arc<dyn ModelFactory>>,
    name_locks: NameLocks,
}

impl Default for ModelRepository {
    fn default() -> Self { Self::new(DEFAULT_MODELS_DIR) }
}

impl ModelRepository {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self { models: RwLock::new(HashMap::new()), models_dir: models_dir.into(), factory: None, name_locks: Mutex::new(HashMap::new()) }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ModelFactory>) -> Self { self.factory = Some(factory); self }

    pub fn models_dir(&self) -> &Path { &self.models_dir }

    /// Inserts or replaces by `model.name()`. A replaced model is stopped
    /// after the map lock is released.
    pub async fn update(&self, model: Arc<dyn Model>) {
        let name = model.name().to_string();
        let previous = self.models.write().insert(name.clone(), model.clone());
        if let Some(old) = previous.filter(|old| !Arc::ptr_eq(old, &model)) {
            old.stop().await;
            info!(target: "dataplane.repository", model = %name, "model replaced");
        }
    }

    pub fn get_model(&self, name: &str) -> Option<Arc<dyn Model>> { self.models.read().get(name).cloned() }

    pub fn is_model_ready(&self, name: &str) -> bool { self.get_model(name).map(|m| m.ready()).unwrap_or(false) }

    /// Snapshot of the current map.
    pub fn get_models(&self) -> HashMap<String, Arc<dyn Model>> { self.models.read().clone() }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Per-name lock handle; the map entry goes away with its last holder.
    fn name_lease<'a>(&'a self, name: &'a str) -> NameLease<'a> {
        let lock = self.name_locks.lock().entry(name.to_string()).or_default().clone();
        NameLease { locks: &self.name_locks, name, lock }
    }

    /// Creates the model through the factory when absent, then loads it.
    /// Errors are logged and returned; a model that failed to construct is
    /// not inserted, one that failed to load stays registered but not ready.
    pub async fn load(&self, name: &str) -> Result<bool> {
        let lease = self.name_lease(name);
        let _guard = lease.lock.lock().await;
        let model = match self.get_model(name) {
            Some(m) => m,
            None => {
                let factory = self.factory.as_ref().ok_or_else(|| DataplaneError::ModelNotFound(name.to_string()))?;
                match factory.create(name, &self.models_dir).await {
                    Ok(m) => { self.update(m.clone()).await; m }
                    Err(e) => {
                        error!(target: "dataplane.repository", model = %name, kind = e.kind(), error = %e, "model construction failed");
                        return Err(e);
                    }
                }
            }
        };
        match model.load().await {
            Ok(loaded) => {
                info!(target: "dataplane.repository", model = %name, loaded, ready = model.ready(), "model load finished");
                Ok(loaded)
            }
            Err(e) => {
                warn!(target: "dataplane.repository", model = %name, kind = e.kind(), error = %e, "model load failed");
                Err(e)
            }
        }
    }

    /// Stops then removes the model.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let lease = self.name_lease(name);
        let _guard = lease.lock.lock().await;
        let model = self.get_model(name).ok_or_else(|| DataplaneError::ModelNotFound(name.to_string()))?;
        model.stop().await;
        self.models.write().remove(name);
        info!(target: "dataplane.repository", model = %name, "model unloaded");
        Ok(())
    }

    /// Stops every model. Used on shutdown.
    pub async fn stop_all(&self) {
        for (name, model) in self.get_models() {
            model.stop().await;
            info!(target: "dataplane.repository", model = %name, "model stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Headers, Payload, ResponsePayload};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fixture { name: String, ready: AtomicBool, fail: bool, stops: Arc<AtomicUsize> }

    impl Fixture {
        fn new(name: &str) -> Self { Self { name: name.into(), ready: AtomicBool::new(false), fail: false, stops: Arc::new(AtomicUsize::new(0)) } }
    }

    #[async_trait]
    impl Model for Fixture {
        fn name(&self) -> &str { &self.name }
        fn ready(&self) -> bool { self.ready.load(Ordering::SeqCst) }
        async fn load(&self) -> Result<bool> {
            if self.fail { return Err(DataplaneError::InferenceError("weights corrupt".into())); }
            self.ready.store(true, Ordering::SeqCst);
            Ok(true)
        }
        async fn predict(&self, payload: Payload, _headers: &Headers) -> Result<ResponsePayload> { Ok(ResponsePayload::Json(payload.into_json()?)) }
        async fn stop(&self) { self.stops.fetch_add(1, Ordering::SeqCst); }
    }

    #[tokio::test]
    async fn ready_only_after_load() {
        let repo = ModelRepository::default();
        repo.update(Arc::new(Fixture::new("a"))).await;
        assert!(!repo.is_model_ready("a"));
        assert!(repo.load("a").await.unwrap());
        assert!(repo.is_model_ready("a"));
        assert!(!repo.is_model_ready("missing"));
    }

    #[tokio::test]
    async fn unload_twice_is_not_found() {
        let repo = ModelRepository::default();
        let m = Fixture::new("a");
        let stops = m.stops.clone();
        repo.update(Arc::new(m)).await;
        repo.unload("a").await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(repo.unload("a").await.unwrap_err(), DataplaneError::ModelNotFound("a".into()));
        assert!(repo.get_model("a").is_none());
    }

    #[tokio::test]
    async fn failed_load_keeps_model_not_ready() {
        let repo = ModelRepository::default();
        repo.update(Arc::new(Fixture { fail: true, ..Fixture::new("bad") })).await;
        assert!(repo.load("bad").await.is_err());
        assert!(!repo.is_model_ready("bad"));
    }

    #[tokio::test]
    async fn directory_factory_reports_missing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("present")).unwrap();
        let factory = DirectoryModelFactory::new(|name, _path| Ok(Arc::new(Fixture::new(name)) as Arc<dyn Model>));
        let repo = ModelRepository::new(dir.path()).with_factory(Arc::new(factory));
        assert!(repo.load("present").await.unwrap());
        assert!(repo.is_model_ready("present"));
        let err = repo.load("absent").await.unwrap_err();
        assert!(matches!(err, DataplaneError::ModelMissing(ref p) if p.ends_with("absent")));
        assert!(repo.get_model("absent").is_none());
    }

    #[tokio::test]
    async fn load_without_factory_is_not_found() {
        let repo = ModelRepository::default();
        assert_eq!(repo.load("ghost").await.unwrap_err(), DataplaneError::ModelNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn concurrent_loads_of_same_name_are_serialised() {
        let repo = Arc::new(ModelRepository::default());
        repo.update(Arc::new(Fixture::new("a"))).await;
        let handles: Vec<_> = (0..8).map(|_| { let r = repo.clone(); tokio::spawn(async move { r.load("a").await }) }).collect();
        for h in handles { assert!(h.await.unwrap().unwrap()); }
        assert_eq!(repo.model_names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn replacing_model_stops_previous() {
        let repo = ModelRepository::default();
        let first = Fixture::new("a");
        let first_stops = first.stops.clone();
        let second = Arc::new(Fixture::new("a"));
        let second_stops = second.stops.clone();
        repo.update(Arc::new(first)).await;
        repo.update(second.clone()).await;
        assert_eq!(first_stops.load(Ordering::SeqCst), 1);
        // same handle again is not a replacement
        repo.update(second).await;
        assert_eq!(second_stops.load(Ordering::SeqCst), 0);
        assert_eq!(repo.model_names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn name_locks_released_after_use() {
        let repo = Arc::new(ModelRepository::default());
        for i in 0..1000 {
            assert!(repo.unload(&format!("ghost-{i}")).await.is_err());
            assert!(repo.load(&format!("ghost-{i}")).await.is_err());
        }
        repo.update(Arc::new(Fixture::new("a"))).await;
        let handles: Vec<_> = (0..8).map(|_| { let r = repo.clone(); tokio::spawn(async move { r.load("a").await }) }).collect();
        for h in handles { h.await.unwrap().unwrap(); }
        repo.unload("a").await.unwrap();
        assert!(repo.name_locks.lock().is_empty());
    }
}
