use std::fmt;

use serde::Deserialize;

use crate::{ImageRegistryClient, LaunchError, Result};

/// A digest-pinned image. The digest is the identity used for presence
/// checks, the tag is only used for pulling and display.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageReference {
    #[serde(rename = "registry")]
    registry_path: String,
    tag: String,
    digest: String,
}

impl ImageReference {
    /// Returns a `ConfigError` if any part is empty or if the digest is not
    /// of the form `algorithm:hex`
    pub fn new(
        registry_path: impl Into<String>,
        tag: impl Into<String>,
        digest: impl Into<String>,
    ) -> Result<Self> {
        let image = Self {
            registry_path: registry_path.into(),
            tag: tag.into(),
            digest: digest.into(),
        };
        image.validate()?;
        Ok(image)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.registry_path.is_empty() || self.tag.is_empty() {
            return Err(LaunchError::config(format!(
                "image reference needs a registry path and tag, got {self}"
            )))
        }
        match self.digest.split_once(':') {
            Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => Ok(()),
            _ => Err(LaunchError::config(format!(
                "image digest \"{}\" is not of the form <algorithm>:<hex>",
                self.digest
            ))),
        }
    }

    pub fn registry_path(&self) -> &str {
        &self.registry_path
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The `name@digest` form used to create containers
    pub fn pinned(&self) -> String {
        format!("{}@{}", self.registry_path, self.digest)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.registry_path, self.tag)
    }
}

/// Strips the `name@` part of a repo digest
fn digest_of(repo_digest: &str) -> &str {
    repo_digest
        .rsplit_once('@')
        .map_or(repo_digest, |(_, digest)| digest)
}

/// Returns if any locally present image records `target_digest` among its
/// repo digests. Images without digests never match.
#[tracing::instrument(skip_all, fields(digest = %target_digest))]
pub async fn image_exists<I: ImageRegistryClient>(client: &I, target_digest: &str) -> Result<bool> {
    let images = client.list_images().await?;
    tracing::debug!(count = images.len(), "inspecting local images");
    for image_id in images {
        let repo_digests = client.inspect_digests(&image_id).await?;
        if repo_digests
            .iter()
            .any(|repo_digest| digest_of(repo_digest) == target_digest)
        {
            tracing::debug!(image.id = %image_id, "found image by digest");
            return Ok(true)
        }
    }
    Ok(false)
}

/// Pulls `image` by its registry path and tag
#[tracing::instrument(skip_all, fields(image = %image))]
pub async fn fetch_image<I: ImageRegistryClient>(client: &I, image: &ImageReference) -> Result<()> {
    tracing::info!("Image {image} is not present locally, pulling it from the registry");
    client.pull(image.registry_path(), image.tag()).await?;
    tracing::info!("Image pull complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_parts() {
        assert_eq!(digest_of("nvcr.io/nvidia/x@sha256:abc"), "sha256:abc");
        assert_eq!(digest_of("sha256:abc"), "sha256:abc");
    }

    #[test]
    fn reference_forms() {
        let image = ImageReference::new("registry.example/tools", "v1", "sha256:00ff").unwrap();
        assert_eq!(image.pinned(), "registry.example/tools@sha256:00ff");
        assert_eq!(image.to_string(), "registry.example/tools:v1");
    }

    #[test]
    fn invalid_references() {
        assert!(ImageReference::new("", "v1", "sha256:00").is_err());
        assert!(ImageReference::new("r", "", "sha256:00").is_err());
        assert!(ImageReference::new("r", "v1", "00ff").is_err());
        assert!(ImageReference::new("r", "v1", "sha256:").is_err());
    }
}
