//! Model repository extension: index, load and unload in wire terms.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{DataplaneError, Result};
use crate::repository::ModelRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModelState { Ready, NotReady }

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryIndexEntry { pub name: String, pub state: ModelState, pub reason: String }

#[derive(Clone)]
pub struct ModelRepositoryExtension { repository: Arc<ModelRepository> }

impl ModelRepositoryExtension {
    pub fn new(repository: Arc<ModelRepository>) -> Self { Self { repository } }

    /// Entries sorted by name; `filter_ready` keeps only ready models.
    pub fn index(&self, filter_ready: bool) -> Vec<RepositoryIndexEntry> {
        self.repository
            .model_names()
            .into_iter()
            .filter_map(|name| {
                let ready = self.repository.is_model_ready(&name);
                if filter_ready && !ready { return None; }
                let state = if ready { ModelState::Ready } else { ModelState::NotReady };
                Some(RepositoryIndexEntry { name, state, reason: String::new() })
            })
            .collect()
    }

    pub async fn load(&self, name: &str) -> Result<()> {
        match self.repository.load(name).await {
            Ok(true) => {}
            Ok(false) => return Err(DataplaneError::not_ready(name)),
            Err(e) => {
                return Err(DataplaneError::ModelNotReady { name: name.to_string(), detail: Some(format!("Error type: {} error msg: {}", e.kind(), e)) });
            }
        }
        if !self.repository.is_model_ready(name) { return Err(DataplaneError::not_ready(name)); }
        Ok(())
    }

    pub async fn unload(&self, name: &str) -> Result<()> {
        self.repository.unload(name).await.map_err(|e| match e {
            DataplaneError::ModelNotFound(_) => DataplaneError::ModelNotFound(name.to_string()),
            other => other,
        })
    }
}
