//! Services as observed in the running cluster, and the shapes the platform
//! API reports them in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::ServiceId;
use crate::registry::ImageDescription;

pub const STATUS_UNKNOWN: &str = "unknown";
pub const STATUS_READY: &str = "ready";
pub const STATUS_UPDATING: &str = "updating";

/// Why a service could not be linked to exactly one pod controller. Reported
/// per service, never failing the enumeration as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,
    #[error("no matching pod controller")]
    NoMatching,
    #[error("multiple matching pod controllers")]
    MultipleMatching,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
}

/// Either the containers from the service's controller, or the reason we
/// could not enumerate them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainersOrExcuse {
    Containers(Vec<Container>),
    Excuse(String),
}

/// A service as observed in the running cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub ip: String,
    pub status: String,
    pub metadata: BTreeMap<String, String>,
    pub containers: ContainersOrExcuse,
}

impl Service {
    /// Containers if we have them, an empty slice otherwise.
    pub fn containers_or_none(&self) -> &[Container] {
        match &self.containers {
            ContainersOrExcuse::Containers(cs) => cs,
            ContainersOrExcuse::Excuse(_) => &[],
        }
    }
}

/// A container together with its current image and, when requested, the
/// images the registry has available for the same repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub current: ImageDescription,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available: Vec<ImageDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub containers: Vec<ContainerStatus>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageStatus {
    pub id: ServiceId,
    pub containers: Vec<ContainerStatus>,
}
