//! The image registry seam. Implementations are expected to return image
//! streams newest-first; everything downstream leans on that.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ImageId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescription {
    pub id: ImageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Images available for the repository key, newest first.
    async fn image_history(&self, repository: &str) -> Result<Vec<ImageDescription>>;
}

/// In-memory registry. Used by tests, and by the daemon when no registry
/// backend is wired up (lookups then find nothing, so latest-image planning
/// leaves containers unchanged).
#[derive(Debug, Default)]
pub struct MemRegistry {
    images: Mutex<HashMap<String, Vec<ImageDescription>>>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the history for a repository, newest first.
    pub fn insert(&self, repository: &str, images: Vec<ImageDescription>) {
        self.images.lock().unwrap().insert(repository.to_string(), images);
    }
}

#[async_trait]
impl Registry for MemRegistry {
    async fn image_history(&self, repository: &str) -> Result<Vec<ImageDescription>> {
        Ok(self.images.lock().unwrap().get(repository).cloned().unwrap_or_default())
    }
}
