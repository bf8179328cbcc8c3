//! Linking services to the pod controller that owns their pods, and deriving
//! a rollout status from it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ReplicationController;

use drover_core::{Container, SelectorError, STATUS_READY, STATUS_UNKNOWN, STATUS_UPDATING};

/// Either a deployment or a replication controller.
#[derive(Debug, Clone)]
pub enum PodController {
    Deployment(Deployment),
    ReplicationController(ReplicationController),
}

impl PodController {
    pub fn template_containers(&self) -> Vec<Container> {
        let api_containers = match self {
            PodController::Deployment(d) => d
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .map(|ps| ps.containers.as_slice())
                .unwrap_or(&[]),
            PodController::ReplicationController(rc) => rc
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .and_then(|t| t.spec.as_ref())
                .map(|ps| ps.containers.as_slice())
                .unwrap_or(&[]),
        };
        api_containers
            .iter()
            .map(|c| Container { name: c.name.clone(), image: c.image.clone().unwrap_or_default() })
            .collect()
    }

    pub fn template_labels(&self) -> BTreeMap<String, String> {
        let labels = match self {
            PodController::Deployment(d) => d
                .spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.labels.clone()),
            PodController::ReplicationController(rc) => rc
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .and_then(|t| t.metadata.as_ref())
                .and_then(|m| m.labels.clone()),
        };
        labels.unwrap_or_default()
    }

    /// A controller matches when it labels its pod template with every
    /// key=value pair of the service's selector.
    pub fn matched_by(&self, selector: &BTreeMap<String, String>) -> bool {
        let labels = self.template_labels();
        selector.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Rollout status derived from the controller's observed state.
    pub fn status(&self) -> String {
        match self {
            PodController::Deployment(d) => {
                let generation = d.metadata.generation.unwrap_or(0);
                let status = d.status.as_ref();
                let observed = status.and_then(|s| s.observed_generation).unwrap_or(0);
                if observed >= generation {
                    // Definition taken up; now check the replicas.
                    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
                    let wanted = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    if updated == wanted {
                        STATUS_READY.to_string()
                    } else {
                        format!("{} out of {} updated", updated, wanted)
                    }
                } else {
                    STATUS_UPDATING.to_string()
                }
            }
            PodController::ReplicationController(rc) => {
                // Updating an RC really means standing up a replacement and
                // draining the old one, so this is an approximation.
                let generation = rc.metadata.generation.unwrap_or(0);
                match rc.status.as_ref() {
                    Some(status) if status.observed_generation.unwrap_or(0) >= generation => {
                        let ready = status.ready_replicas.unwrap_or(0);
                        let total = status.replicas;
                        if ready == total {
                            STATUS_READY.to_string()
                        } else {
                            format!("{} out of {} ready", ready, total)
                        }
                    }
                    Some(_) => STATUS_UPDATING.to_string(),
                    None => STATUS_UNKNOWN.to_string(),
                }
            }
        }
    }
}

/// The unique controller whose pod-template labels cover the selector.
pub fn match_controller<'c>(
    selector: &BTreeMap<String, String>,
    controllers: &'c [PodController],
) -> Result<&'c PodController, SelectorError> {
    if selector.is_empty() {
        return Err(SelectorError::Empty);
    }
    let matching: Vec<&PodController> =
        controllers.iter().filter(|c| c.matched_by(selector)).collect();
    match matching.as_slice() {
        [one] => Ok(one),
        [] => Err(SelectorError::NoMatching),
        _ => Err(SelectorError::MultipleMatching),
    }
}
