//! Project store
//!
//! Narrow storage capability for projects, looked up by id or by their unique
//! code. Only an in-memory adapter ships with the gateway.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: u64,
    /// Unique, human-facing identifier
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Project {
    pub fn new(id: u64, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            name: name.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("project code '{code}' is already used by project {id}")]
    DuplicateCode { code: String, id: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn find_by_id(&self, id: u64) -> StoreResult<Option<Project>>;

    async fn find_by_code(&self, code: &str) -> StoreResult<Option<Project>>;

    /// Insert or replace the project with the same id
    async fn save(&self, project: Project) -> StoreResult<Project>;

    /// Returns whether a project was removed
    async fn delete(&self, id: u64) -> StoreResult<bool>;
}

/// Projects kept in a map keyed by id
#[derive(Debug, Default)]
pub struct InMemoryProjectStore {
    projects: RwLock<HashMap<u64, Project>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.projects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.projects.read().await.is_empty()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn find_by_id(&self, id: u64) -> StoreResult<Option<Project>> {
        Ok(self.projects.read().await.get(&id).cloned())
    }

    async fn find_by_code(&self, code: &str) -> StoreResult<Option<Project>> {
        let projects = self.projects.read().await;
        Ok(projects.values().find(|p| p.code == code).cloned())
    }

    async fn save(&self, project: Project) -> StoreResult<Project> {
        let mut projects = self.projects.write().await;

        // Codes stay unique across projects
        if let Some(other) = projects
            .values()
            .find(|p| p.code == project.code && p.id != project.id)
        {
            return Err(StoreError::DuplicateCode {
                code: project.code,
                id: other.id,
            });
        }

        debug!(id = project.id, code = %project.code, "Saving project");
        projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn delete(&self, id: u64) -> StoreResult<bool> {
        Ok(self.projects.write().await.remove(&id).is_some())
    }
}
