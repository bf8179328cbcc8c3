//! Decoding an incoming request, invoking the backing platform, and encoding
//! the reply. Kept transport-free so it can be exercised directly.

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use drover_core::{Platform, PlatformError};

use crate::protocol::*;

/// What handling one message amounts to: maybe a reply to publish, and maybe
/// a fatal error that must end the subscription.
#[derive(Debug, Default)]
pub struct Outcome {
    pub reply: Option<Vec<u8>>,
    pub fatal: Option<PlatformError>,
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, PlatformError> {
    let bytes: &[u8] = if payload.is_empty() { b"{}" } else { payload };
    serde_json::from_slice(bytes)
        .map_err(|e| PlatformError::Remote(format!("decoding request: {}", e)))
}

fn encode<T: Serialize>(resp: &T) -> Option<Vec<u8>> {
    serde_json::to_vec(resp).ok()
}

fn fatal_of<T>(result: &Result<T, PlatformError>) -> Option<PlatformError> {
    match result {
        Err(e) if e.is_fatal() => Some(e.clone()),
        _ => None,
    }
}

/// Handle one inbound message addressed to `my_id`'s subscription.
pub async fn dispatch(
    platform: &dyn Platform,
    my_id: &str,
    subject: &str,
    payload: &[u8],
) -> Outcome {
    let method = match method_of(subject) {
        Some(m) => m,
        None => {
            warn!(subject, "message outside the platform subject space");
            return Outcome::default();
        }
    };

    match method {
        METHOD_KICK => {
            // Another subscriber announced itself. Our own kick is the one
            // carrying our id; any other id means we lost the arbitration.
            let id = String::from_utf8_lossy(payload).to_string();
            if id != my_id {
                counter!("bus_kicks_total", 1u64);
                return Outcome {
                    reply: None,
                    fatal: Some(PlatformError::Fatal(format!(
                        "Kicked by new subscriber {}",
                        id
                    ))),
                };
            }
            Outcome::default()
        }

        METHOD_PING => {
            let result = match decode::<Ping>(payload) {
                Ok(_) => platform.ping().await,
                Err(e) => Err(e),
            };
            Outcome {
                fatal: fatal_of(&result),
                reply: encode(&PingResponse { err: make_error_response(result.err().as_ref()) }),
            }
        }

        METHOD_VERSION => {
            let result = match decode::<Version>(payload) {
                Ok(_) => platform.version().await,
                Err(e) => Err(e),
            };
            let (version, err) = split(result);
            Outcome {
                fatal: fatal_of_ref(&err),
                reply: encode(&VersionResponse {
                    version: version.unwrap_or_default(),
                    err: make_error_response(err.as_ref()),
                }),
            }
        }

        METHOD_EXPORT => {
            let result = match decode::<Export>(payload) {
                Ok(_) => platform.export().await,
                Err(e) => Err(e),
            };
            let (config, err) = split(result);
            Outcome {
                fatal: fatal_of_ref(&err),
                reply: encode(&ExportResponse {
                    config: config.unwrap_or_default(),
                    err: make_error_response(err.as_ref()),
                }),
            }
        }

        METHOD_LIST_SERVICES => {
            let result = match decode::<ListServicesRequest>(payload) {
                Ok(req) => platform.list_services(req.namespace).await,
                Err(e) => Err(e),
            };
            let (services, err) = split(result);
            Outcome {
                fatal: fatal_of_ref(&err),
                reply: encode(&ListServicesResponse {
                    result: services.unwrap_or_default(),
                    err: make_error_response(err.as_ref()),
                }),
            }
        }

        METHOD_LIST_IMAGES => {
            let result = match decode::<ListImagesRequest>(payload) {
                Ok(req) => platform.list_images(req.services).await,
                Err(e) => Err(e),
            };
            let (images, err) = split(result);
            Outcome {
                fatal: fatal_of_ref(&err),
                reply: encode(&ListImagesResponse {
                    result: images.unwrap_or_default(),
                    err: make_error_response(err.as_ref()),
                }),
            }
        }

        METHOD_UPDATE_IMAGES => {
            let result = match decode::<UpdateImagesRequest>(payload) {
                Ok(req) => platform.update_images(req.spec).await,
                Err(e) => Err(e),
            };
            let (release, err) = split(result);
            Outcome {
                fatal: fatal_of_ref(&err),
                reply: encode(&UpdateImagesResponse {
                    result: release.unwrap_or_default(),
                    err: make_error_response(err.as_ref()),
                }),
            }
        }

        METHOD_SYNC_CLUSTER => {
            let result = match decode::<SyncCluster>(payload) {
                Ok(_) => platform.sync_cluster().await,
                Err(e) => Err(e),
            };
            Outcome {
                fatal: fatal_of(&result),
                reply: encode(&SyncClusterResponse {
                    err: make_error_response(result.err().as_ref()),
                }),
            }
        }

        METHOD_SYNC_STATUS => {
            let result = match decode::<SyncStatusRequest>(payload) {
                Ok(req) => platform.sync_status(req.reference).await,
                Err(e) => Err(e),
            };
            let (commits, err) = split(result);
            Outcome {
                fatal: fatal_of_ref(&err),
                reply: encode(&SyncStatusResponse {
                    result: commits.unwrap_or_default(),
                    err: make_error_response(err.as_ref()),
                }),
            }
        }

        other => {
            warn!(method = other, "unknown platform method");
            Outcome::default()
        }
    }
}

fn split<T>(result: Result<T, PlatformError>) -> (Option<T>, Option<PlatformError>) {
    match result {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e)),
    }
}

fn fatal_of_ref(err: &Option<PlatformError>) -> Option<PlatformError> {
    err.as_ref().filter(|e| e.is_fatal()).cloned()
}
