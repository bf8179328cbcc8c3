//! The release data model: what to release, and what happened per service.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{ImageId, ServiceId};

/// Which services a release should consider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSelector {
    All,
    Specific(Vec<ServiceId>),
}

/// Which image to move the selected services to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSelector {
    /// The newest non-`latest` image for each container's repository.
    LatestForAll,
    Specific(ImageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    /// Compute and report, but write nothing.
    PlanOnly,
    Execute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub services: ServiceSelector,
    pub image: ImageSelector,
    pub kind: ReleaseKind,
    #[serde(default)]
    pub excludes: Vec<ServiceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Success,
    Skipped,
    Ignored,
    Failed,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Success => "success",
            ReleaseStatus::Skipped => "skipped",
            ReleaseStatus::Ignored => "ignored",
            ReleaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One container moved from one image to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub container: String,
    pub current: ImageId,
    pub target: ImageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResult {
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<ContainerUpdate>,
}

impl ServiceResult {
    pub fn pending() -> Self {
        ServiceResult { status: ReleaseStatus::Pending, error: String::new(), updates: vec![] }
    }

    pub fn skipped(reason: &str) -> Self {
        ServiceResult {
            status: ReleaseStatus::Skipped,
            error: reason.to_string(),
            updates: vec![],
        }
    }

    pub fn ignored(reason: &str) -> Self {
        ServiceResult {
            status: ReleaseStatus::Ignored,
            error: reason.to_string(),
            updates: vec![],
        }
    }

    pub fn failed(reason: &str) -> Self {
        ServiceResult { status: ReleaseStatus::Failed, error: reason.to_string(), updates: vec![] }
    }
}

/// Per-service outcome of a release.
///
/// Backed by an ordered map keyed by service ID, so iteration (and therefore
/// logs and commit contents) is reproducible across retries. Services are
/// only ever inserted in ID order, which makes the two orders coincide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseResult(BTreeMap<ServiceId, ServiceResult>);

impl ReleaseResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ServiceId, result: ServiceResult) {
        self.0.insert(id, result);
    }

    pub fn get(&self, id: &ServiceId) -> Option<&ServiceResult> {
        self.0.get(id)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ServiceId, ServiceResult> {
        self.0.iter()
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.0.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a ReleaseResult {
    type Item = (&'a ServiceId, &'a ServiceResult);
    type IntoIter = btree_map::Iter<'a, ServiceId, ServiceResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
