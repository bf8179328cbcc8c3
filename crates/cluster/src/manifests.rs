//! Reading manifest files: locating the files that define services, parsing
//! enough of a definition to address it, and rewriting container images.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use drover_core::{ImageId, ServiceId};

/// The minimum we need to know about a definition to apply or delete it.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiObject {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ApiObjectMeta,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ApiObject {
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }
}

/// Parse a definition into a minimal addressable object.
pub fn definition_obj(bytes: &[u8]) -> Result<ApiObject> {
    let mut obj: ApiObject = serde_yaml::from_slice(bytes).context("parsing definition YAML")?;
    if obj.metadata.name.is_empty() {
        bail!("definition has no metadata.name");
    }
    obj.bytes = bytes.to_vec();
    Ok(obj)
}

const CONTROLLER_KINDS: [&str; 2] = ["Deployment", "ReplicationController"];

/// Walk `root` for YAML files defining pod controllers, and map each service
/// ID to the file(s) claiming it. A well-formed repository has exactly one
/// file per ID; the caller treats more as a planning error.
pub fn find_defined_services(root: &Path) -> Result<BTreeMap<ServiceId, Vec<PathBuf>>> {
    let mut res: BTreeMap<ServiceId, Vec<PathBuf>> = BTreeMap::new();
    walk(root, &mut |path| {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let obj = match definition_obj(&bytes) {
            Ok(obj) => obj,
            Err(err) => {
                // Manifest directories hold other YAML too; skip quietly.
                debug!(path = %path.display(), error = %err, "skipping unparseable file");
                return Ok(());
            }
        };
        if CONTROLLER_KINDS.contains(&obj.kind.as_str()) {
            let id = ServiceId::new(obj.namespace(), &obj.metadata.name)?;
            res.entry(id).or_default().push(path.to_path_buf());
        }
        Ok(())
    })?;
    Ok(res)
}

fn walk(dir: &Path, visit: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries.map(|e| e.map(|e| e.path())).collect::<Result<_, _>>()?;
    paths.sort();
    for path in paths {
        if path.is_dir() {
            walk(&path, visit)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            visit(&path)?;
        }
    }
    Ok(())
}

/// Rewrite the pod template's container images: every container whose image
/// shares `image`'s repository is pointed at `image`. The result is exactly
/// what the caller must write back; no further mutation happens downstream.
pub fn update_definition(definition: &[u8], image: &ImageId) -> Result<Vec<u8>> {
    let mut doc: serde_yaml::Value =
        serde_yaml::from_slice(definition).context("parsing definition YAML")?;

    let containers = doc
        .get_mut("spec")
        .and_then(|s| s.get_mut("template"))
        .and_then(|t| t.get_mut("spec"))
        .and_then(|s| s.get_mut("containers"))
        .and_then(|c| c.as_sequence_mut())
        .ok_or_else(|| anyhow!("definition has no pod template containers"))?;

    for container in containers.iter_mut() {
        let current = match container.get("image").and_then(|i| i.as_str()) {
            Some(s) => s,
            None => continue,
        };
        let current_id = match ImageId::from_str(current) {
            Ok(id) => id,
            Err(_) => continue,
        };
        if current_id.same_repository(image) {
            container["image"] = serde_yaml::Value::String(image.to_string());
        }
    }

    let out = serde_yaml::to_string(&doc).context("serialising rewritten definition")?;
    Ok(out.into_bytes())
}
