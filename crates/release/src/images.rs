//! Keeping track of which images are available for a set of services.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};

use drover_core::{ImageDescription, ImageId, Registry, Service};

/// Available images per repository key, newest first as the registry
/// reports them.
#[derive(Debug, Default)]
pub struct ImageMap(BTreeMap<String, Vec<ImageDescription>>);

impl ImageMap {
    pub fn available(&self, repository: &str) -> &[ImageDescription] {
        self.0.get(repository).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The latest releasable image for a repository: the newest one whose tag
    /// is not `latest` (in any casing). None means the caller decides whether
    /// that is an error.
    pub fn latest_image(&self, repository: &str) -> Option<&ImageDescription> {
        self.available(repository).iter().find(|image| !image.id.tag.eq_ignore_ascii_case("latest"))
    }
}

/// Fetch the image history for every repository mentioned by the services'
/// containers. A repository mentioned more than once is fetched once.
pub async fn collect_available_images(
    registry: &dyn Registry,
    services: &[Service],
) -> Result<ImageMap> {
    let mut map = ImageMap::default();
    for service in services {
        for container in service.containers_or_none() {
            let id = ImageId::from_str(&container.image)
                .with_context(|| format!("container {} runs an invalid image id", container.name))?;
            if let Entry::Vacant(entry) = map.0.entry(id.repository_key()) {
                entry.insert(vec![]);
            }
        }
    }
    for (repository, images) in map.0.iter_mut() {
        *images = registry
            .image_history(repository)
            .await
            .with_context(|| format!("fetching image metadata for {}", repository))?;
    }
    Ok(map)
}
