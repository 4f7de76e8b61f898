//! In-memory image source and registry

use super::{ImageRef, ImageSource, LocalImage, RegistryApi, RegistryError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct RegistryState {
    local: HashMap<String, String>,
    remote: HashMap<String, String>,
    reject_credentials: bool,
    failing_pushes: u32,
    stale_reads: u32,
    pushes: u32,
}

/// Local image store and remote registry in one process
///
/// Digests are the sha256 of the content registered with `add_local`.
/// Failures can be injected to exercise the publisher's retry paths.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a locally built image
    pub fn add_local(&self, image: &str, content: &[u8]) {
        let key = normalize(image);
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(content)));
        self.lock().local.insert(key, digest);
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.lock().reject_credentials = reject;
    }

    /// Fail the next `count` pushes with a transient error
    pub fn fail_next_pushes(&self, count: u32) {
        self.lock().failing_pushes = count;
    }

    /// Resolve the next `count` lookups to a stale digest
    pub fn stale_reads(&self, count: u32) {
        self.lock().stale_reads = count;
    }

    pub fn push_count(&self) -> u32 {
        self.lock().pushes
    }

    pub fn remote_digest(&self, image: &str) -> Option<String> {
        self.lock().remote.get(&normalize(image)).cloned()
    }
}

fn normalize(image: &str) -> String {
    image
        .parse::<ImageRef>()
        .map(|r| r.to_string())
        .unwrap_or_else(|_| image.to_string())
}

#[async_trait]
impl ImageSource for InMemoryRegistry {
    async fn local_image(&self, image: &ImageRef) -> Result<LocalImage, RegistryError> {
        let digest = self
            .lock()
            .local
            .get(&image.to_string())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(image.to_string()))?;
        Ok(LocalImage {
            image: image.clone(),
            digest,
        })
    }

    async fn push(&self, image: &ImageRef) -> Result<String, RegistryError> {
        let mut state = self.lock();
        if state.reject_credentials {
            return Err(RegistryError::Authentication(format!(
                "push to {} denied",
                image.registry
            )));
        }
        state.pushes += 1;
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(RegistryError::Transient("connection reset by peer".to_string()));
        }

        let key = image.to_string();
        let digest = state
            .local
            .get(&key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;
        state.remote.insert(key, digest.clone());
        Ok(digest)
    }
}

#[async_trait]
impl RegistryApi for InMemoryRegistry {
    async fn authenticate(&self, registry: &str) -> Result<(), RegistryError> {
        if self.lock().reject_credentials {
            return Err(RegistryError::Authentication(format!(
                "credentials rejected by {}",
                registry
            )));
        }
        Ok(())
    }

    async fn resolve(&self, image: &ImageRef) -> Result<Option<String>, RegistryError> {
        let mut state = self.lock();
        if state.stale_reads > 0 {
            state.stale_reads -= 1;
            return Ok(Some("sha256:stale".to_string()));
        }
        Ok(state.remote.get(&image.to_string()).cloned())
    }
}
