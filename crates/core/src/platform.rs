//! The Platform capability set: what a connected daemon can be asked to do,
//! whether in-process or across the bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::id::ServiceId;
use crate::release::{ReleaseResult, ReleaseSpec};
use crate::service::{ImageStatus, ServiceStatus};

/// Errors crossing the platform boundary. These survive serialization, so a
/// remote failure reconstitutes as the same kind on the calling side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PlatformError {
    /// Transient: nobody answered in time. Retry is the caller's call.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The daemon's backing connection is dead; the subscription must be
    /// torn down and re-established.
    #[error("{0}")]
    Fatal(String),
    /// The remote handler failed; the connection is fine.
    #[error("{0}")]
    Remote(String),
}

impl PlatformError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlatformError::Fatal(_))
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Scope argument for `list_images`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSpec {
    All,
    Id(ServiceId),
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn ping(&self) -> PlatformResult<()>;
    async fn version(&self) -> PlatformResult<String>;
    async fn export(&self) -> PlatformResult<Vec<u8>>;
    async fn list_services(&self, namespace: Option<String>)
        -> PlatformResult<Vec<ServiceStatus>>;
    async fn list_images(&self, services: ServiceSpec) -> PlatformResult<Vec<ImageStatus>>;
    async fn update_images(&self, spec: ReleaseSpec) -> PlatformResult<ReleaseResult>;
    async fn sync_cluster(&self) -> PlatformResult<()>;
    /// Commit hashes pending application relative to `reference`, newest
    /// first; empty when `reference` is already applied.
    async fn sync_status(&self, reference: String) -> PlatformResult<Vec<String>>;
}
