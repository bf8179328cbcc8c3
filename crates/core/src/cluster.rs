//! The cluster seam: what the release engine and daemon need from a running
//! cluster, independent of which orchestrator backs it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::id::{ImageId, ServiceId};
use crate::service::Service;

/// One entry in a sync batch. `delete` is carried out before `apply` when
/// both are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncAction {
    /// `namespace/name` of the resource the bytes define; keys the error map.
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncDef {
    pub actions: Vec<SyncAction>,
}

/// A sync either fails to run at all, or runs to completion with per-resource
/// errors collected along the way. Per-resource failures never abort the batch.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync could not run: {0}")]
    Aborted(String),
    #[error("{} resource(s) failed to sync", .0.len())]
    Resources(BTreeMap<String, String>),
}

impl SyncError {
    pub fn resource_errors(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            SyncError::Resources(errs) => Some(errs),
            SyncError::Aborted(_) => None,
        }
    }
}

#[async_trait]
pub trait Cluster: Send + Sync {
    /// All services in the namespace, or in every namespace when `None`.
    async fn all_services(&self, namespace: Option<&str>) -> Result<Vec<Service>>;

    /// Just the services named; missing ones are silently omitted, the caller
    /// decides whether absence is an error.
    async fn some_services(&self, ids: &[ServiceId]) -> Result<Vec<Service>>;

    async fn ping(&self) -> Result<()>;

    /// All managed resources as a self-contained manifest bundle.
    async fn export(&self) -> Result<Vec<u8>>;

    /// Apply and delete a batch of resource manifests, serially.
    async fn sync(&self, def: SyncDef) -> Result<(), SyncError>;

    /// Map of service ID to the manifest file(s) defining it under `root`.
    /// More than one path per ID is a planning error for the caller.
    fn find_defined_services(&self, root: &Path) -> Result<BTreeMap<ServiceId, Vec<PathBuf>>>;

    /// Rewrite a manifest's container image references to `image`, for every
    /// container whose current image shares the target's repository.
    fn update_definition(&self, definition: &[u8], image: &ImageId) -> Result<Vec<u8>>;
}
