//! Service and image identifiers.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("malformed service ID: {0:?}")]
    MalformedServiceId(String),
    #[error("malformed image ID: {0:?}")]
    MalformedImageId(String),
}

/// A service in the cluster, addressed as `namespace/name`.
///
/// Stored as the joined string, so the derived ordering is the lexicographic
/// order of `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(namespace: &str, name: &str) -> Result<Self, IdError> {
        if namespace.is_empty() || name.is_empty() || namespace.contains('/') || name.contains('/')
        {
            return Err(IdError::MalformedServiceId(format!("{}/{}", namespace, name)));
        }
        Ok(ServiceId(format!("{}/{}", namespace, name)))
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once('/').map(|(ns, _)| ns).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }
}

impl FromStr for ServiceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) => ServiceId::new(ns, name),
            None => Err(IdError::MalformedServiceId(s.to_string())),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServiceId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> String {
        id.0
    }
}

/// A set of service IDs with the handful of operations selection needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceIdSet(BTreeSet<ServiceId>);

impl ServiceIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<I: IntoIterator<Item = ServiceId>>(&mut self, ids: I) {
        self.0.extend(ids);
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.0.contains(id)
    }

    /// Members of `self` that are not in `other`.
    pub fn without(&self, other: &ServiceIdSet) -> ServiceIdSet {
        ServiceIdSet(self.0.difference(&other.0).cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ServiceId> for ServiceIdSet {
    fn from_iter<I: IntoIterator<Item = ServiceId>>(iter: I) -> Self {
        ServiceIdSet(iter.into_iter().collect())
    }
}

/// A container image reference.
///
/// `registry` may be empty (default public registry) and `tag` may be empty
/// (unspecified). `registry/repository` identifies the image stream; the full
/// triple identifies one image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageId {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageId {
    /// The repository-qualified key identifying the image stream.
    pub fn repository_key(&self) -> String {
        if self.registry.is_empty() {
            self.repository.clone()
        } else {
            format!("{}/{}", self.registry, self.repository)
        }
    }

    /// Repository equality is case-sensitive on the full key.
    pub fn same_repository(&self, other: &ImageId) -> bool {
        self.repository_key() == other.repository_key()
    }
}

impl FromStr for ImageId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::MalformedImageId(s.to_string()));
        }
        let (rest, tag) = match s.split_once(':') {
            Some((rest, tag)) if !rest.is_empty() && !tag.contains(':') => (rest, tag.to_string()),
            Some(_) => return Err(IdError::MalformedImageId(s.to_string())),
            None => (s, String::new()),
        };
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(IdError::MalformedImageId(s.to_string()));
        }
        let (registry, repository) = match parts.as_slice() {
            [repo] => (String::new(), (*repo).to_string()),
            [org, repo] => (String::new(), format!("{}/{}", org, repo)),
            [registry, org, repo] => ((*registry).to_string(), format!("{}/{}", org, repo)),
            _ => return Err(IdError::MalformedImageId(s.to_string())),
        };
        Ok(ImageId { registry, repository, tag })
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository_key())?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ImageId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ImageId> for String {
    fn from(id: ImageId) -> String {
        id.to_string()
    }
}
