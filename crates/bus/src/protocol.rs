//! Wire envelopes. Requests are per-method records; responses carry the
//! method's result fields plus a common error trailer.

use serde::{Deserialize, Serialize};

use drover_core::{
    ImageStatus, InstanceId, PlatformError, ReleaseResult, ReleaseSpec, ServiceSpec, ServiceStatus,
};

pub const METHOD_KICK: &str = "Kick";
pub const METHOD_PING: &str = "Ping";
pub const METHOD_VERSION: &str = "Version";
pub const METHOD_EXPORT: &str = "Export";
pub const METHOD_LIST_SERVICES: &str = "ListServices";
pub const METHOD_LIST_IMAGES: &str = "ListImages";
pub const METHOD_UPDATE_IMAGES: &str = "UpdateImages";
pub const METHOD_SYNC_CLUSTER: &str = "SyncCluster";
pub const METHOD_SYNC_STATUS: &str = "SyncStatus";

pub fn subject(instance: &InstanceId, method: &str) -> String {
    format!("{}.Platform.{}", instance, method)
}

/// All methods for one instance, for wildcard subscription.
pub fn wildcard(instance: &InstanceId) -> String {
    format!("{}.Platform.>", instance)
}

/// The method suffix of a subject, if it is a platform subject at all.
pub fn method_of(subject: &str) -> Option<&str> {
    subject.rsplit_once(".Platform.").map(|(_, method)| method)
}

/// Dropped into responses so they all have the same trailer. `error` is
/// empty for success; `fatal` additionally means the daemon's backing
/// connection was torn down and the subscription is dead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub fatal: bool,
}

pub fn make_error_response(err: Option<&PlatformError>) -> ErrorResponse {
    match err {
        None => ErrorResponse::default(),
        Some(e) => ErrorResponse { error: e.to_string(), fatal: e.is_fatal() },
    }
}

pub fn extract_error(resp: &ErrorResponse) -> Option<PlatformError> {
    if resp.error.is_empty() {
        return None;
    }
    if resp.fatal {
        Some(PlatformError::Fatal(resp.error.clone()))
    } else {
        Some(PlatformError::Remote(resp.error.clone()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ping {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(flatten)]
    pub err: ErrorResponse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Version {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionResponse {
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub err: ErrorResponse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Export {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportResponse {
    #[serde(default)]
    pub config: Vec<u8>,
    #[serde(flatten)]
    pub err: ErrorResponse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListServicesRequest {
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListServicesResponse {
    #[serde(default)]
    pub result: Vec<ServiceStatus>,
    #[serde(flatten)]
    pub err: ErrorResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListImagesRequest {
    pub services: ServiceSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListImagesResponse {
    #[serde(default)]
    pub result: Vec<ImageStatus>,
    #[serde(flatten)]
    pub err: ErrorResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateImagesRequest {
    pub spec: ReleaseSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateImagesResponse {
    #[serde(default)]
    pub result: ReleaseResult,
    #[serde(flatten)]
    pub err: ErrorResponse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncCluster {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncClusterResponse {
    #[serde(flatten)]
    pub err: ErrorResponse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatusRequest {
    #[serde(default)]
    pub reference: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    #[serde(default)]
    pub result: Vec<String>,
    #[serde(flatten)]
    pub err: ErrorResponse,
}
