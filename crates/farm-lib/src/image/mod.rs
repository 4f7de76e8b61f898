//! Container image publication
//!
//! This module provides:
//! - Image reference parsing
//! - The publisher that checks the local build, authenticates, pushes and
//!   verifies the pushed reference resolves before declaring success
//! - A docker CLI image source, a registry v2 HTTP client and an in-memory
//!   registry for tests and dry runs

mod docker;
mod http;
mod memory;
mod publisher;

pub use docker::DockerCli;
pub use http::{HttpRegistry, RegistryCredentials};
pub use memory::InMemoryRegistry;
pub use publisher::ImagePublisher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Parsed `[registry/]repository[:tag]` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl FromStr for ImageRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.contains(char::is_whitespace) || s.contains('@') {
            return Err(format!("invalid image reference: {:?}", s));
        }

        let (registry, rest) = match s.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest)
            }
            _ => (DEFAULT_REGISTRY.to_string(), s),
        };

        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (rest, DEFAULT_TAG),
        };

        if repository.is_empty() || tag.is_empty() || repository.ends_with('/') {
            return Err(format!("invalid image reference: {:?}", s));
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// Result of the local build/tag step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    pub image: ImageRef,
    /// Content digest of the locally built image
    pub digest: String,
}

/// A published image the cluster can pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressable {
    pub image: String,
    /// Digest the registry resolves the tag to
    pub digest: String,
    /// Local digest the publication was made from
    pub local_digest: String,
}

impl Addressable {
    /// Pinned `repository@digest` form
    pub fn pinned(&self) -> String {
        let base = self
            .image
            .rsplit_once(':')
            .filter(|(_, tag)| !tag.contains('/'))
            .map(|(base, _)| base)
            .unwrap_or(&self.image);
        format!("{}@{}", base, self.digest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Credentials rejected; retrying cannot help
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("transient registry failure: {0}")]
    Transient(String),
    #[error("image not found: {0}")]
    NotFound(String),
}

/// Local build/tag step plus the push that ships its result
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn local_image(&self, image: &ImageRef) -> Result<LocalImage, RegistryError>;

    /// Push and return the digest the registry acknowledged
    async fn push(&self, image: &ImageRef) -> Result<String, RegistryError>;
}

/// Remote registry operations
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn authenticate(&self, registry: &str) -> Result<(), RegistryError>;

    /// Digest the tag currently resolves to, if any
    async fn resolve(&self, image: &ImageRef) -> Result<Option<String>, RegistryError>;
}
