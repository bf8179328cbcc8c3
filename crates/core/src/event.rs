//! Release history events and the read/write seams around them.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ServiceId;
use crate::release::{ReleaseResult, ReleaseSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Release,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseEventMetadata {
    pub spec: ReleaseSpec,
    pub result: ReleaseResult,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub service_ids: Vec<ServiceId>,
    pub kind: EventKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub log_level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ReleaseEventMetadata>,
}

#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn log_event(&self, event: Event) -> Result<()>;
}

#[async_trait]
pub trait EventReader: Send + Sync {
    /// Events in timestamp order, ties broken by insertion; at most `limit`
    /// of the most recent when given.
    async fn events(&self, limit: Option<usize>) -> Result<Vec<Event>>;
}
