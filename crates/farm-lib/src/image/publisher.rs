//! Publish-and-verify with bounded retries

use super::{Addressable, ImageRef, ImageSource, LocalImage, RegistryApi, RegistryError};
use crate::error::{PublishError, PublishErrorKind};
use crate::observability::{FarmMetrics, StructuredLogger};
use crate::retry::BackoffPolicy;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a single publication attempt failed
enum AttemptError {
    Registry(RegistryError),
    Verification(String),
}

impl AttemptError {
    fn kind(&self) -> PublishErrorKind {
        match self {
            AttemptError::Registry(RegistryError::Authentication(_)) => {
                PublishErrorKind::Authentication
            }
            AttemptError::Registry(RegistryError::NotFound(_)) => PublishErrorKind::LocalImage,
            AttemptError::Registry(RegistryError::Transient(_)) => PublishErrorKind::Transient,
            AttemptError::Verification(_) => PublishErrorKind::Verification,
        }
    }

    fn message(&self) -> String {
        match self {
            AttemptError::Registry(e) => e.to_string(),
            AttemptError::Verification(msg) => msg.clone(),
        }
    }
}

pub struct ImagePublisher {
    source: Arc<dyn ImageSource>,
    registry: Arc<dyn RegistryApi>,
    backoff: BackoffPolicy,
    published: DashMap<String, Addressable>,
    metrics: FarmMetrics,
    logger: StructuredLogger,
}

impl ImagePublisher {
    pub fn new(
        source: Arc<dyn ImageSource>,
        registry: Arc<dyn RegistryApi>,
        backoff: BackoffPolicy,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            source,
            registry,
            backoff,
            published: DashMap::new(),
            metrics: FarmMetrics::new(),
            logger,
        }
    }

    /// Last verified publication of an image reference
    pub fn published(&self, image: &str) -> Option<Addressable> {
        self.published.get(image).map(|r| r.clone())
    }

    /// Make sure `image` is pushed and resolvable
    ///
    /// Authentication failures surface on the first attempt; transient
    /// failures and read-after-write mismatches are retried with backoff.
    pub async fn ensure_published(&self, image: &str) -> Result<Addressable, PublishError> {
        let reference: ImageRef = image.parse().map_err(|message| PublishError {
            image: image.to_string(),
            kind: PublishErrorKind::InvalidReference,
            attempts: 0,
            message,
        })?;

        let local = self
            .source
            .local_image(&reference)
            .await
            .map_err(|e| self.fail(image, AttemptError::Registry(e), 1))?;

        if let Some(cached) = self.published(image) {
            if cached.local_digest == local.digest {
                return Ok(cached);
            }
            debug!(image = %image, "Local image changed since last publication");
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.publish_once(&reference, &local).await {
                Ok(digest) => {
                    let addressable = Addressable {
                        image: image.to_string(),
                        digest,
                        local_digest: local.digest.clone(),
                    };
                    self.logger
                        .log_image_published(image, &addressable.digest, attempt);
                    self.published.insert(image.to_string(), addressable.clone());
                    return Ok(addressable);
                }
                Err(e) => {
                    let retryable = matches!(
                        e.kind(),
                        PublishErrorKind::Transient | PublishErrorKind::Verification
                    );
                    if !retryable || !self.backoff.should_retry(attempt) {
                        return Err(self.fail(image, e, attempt));
                    }

                    let delay = self.backoff.delay_after(attempt);
                    warn!(
                        image = %image,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e.message(),
                        "Publication attempt failed, retrying"
                    );
                    self.metrics.inc_publish_retries();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn publish_once(
        &self,
        reference: &ImageRef,
        local: &LocalImage,
    ) -> Result<String, AttemptError> {
        self.registry
            .authenticate(&reference.registry)
            .await
            .map_err(AttemptError::Registry)?;

        let pushed = self
            .source
            .push(reference)
            .await
            .map_err(AttemptError::Registry)?;
        debug!(image = %reference, local_digest = %local.digest, pushed_digest = %pushed, "Image pushed");

        match self
            .registry
            .resolve(reference)
            .await
            .map_err(AttemptError::Registry)?
        {
            Some(resolved) if resolved == pushed => Ok(pushed),
            Some(resolved) => Err(AttemptError::Verification(format!(
                "{} resolves to {}, expected {}",
                reference, resolved, pushed
            ))),
            None => Err(AttemptError::Verification(format!(
                "{} does not resolve after push",
                reference
            ))),
        }
    }

    fn fail(&self, image: &str, error: AttemptError, attempts: u32) -> PublishError {
        PublishError {
            image: image.to_string(),
            kind: error.kind(),
            attempts,
            message: error.message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::InMemoryRegistry;
    use std::time::Duration;
    use tokio::time::Instant;

    const IMAGE: &str = "gcr.io/acme/jenkins:lts";

    fn publisher(registry: Arc<InMemoryRegistry>) -> ImagePublisher {
        ImagePublisher::new(
            registry.clone(),
            registry,
            BackoffPolicy::new(4, Duration::from_secs(1), Duration::from_secs(10)),
            StructuredLogger::new("test"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_and_verify() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_local(IMAGE, b"jenkins lts layers");
        let publisher = publisher(registry.clone());

        let addressable = publisher.ensure_published(IMAGE).await.unwrap();
        assert!(addressable.digest.starts_with("sha256:"));
        assert_eq!(registry.push_count(), 1);

        // Cached while the local image is unchanged
        publisher.ensure_published(IMAGE).await.unwrap();
        assert_eq!(registry.push_count(), 1);

        registry.add_local(IMAGE, b"jenkins lts layers, rebuilt");
        publisher.ensure_published(IMAGE).await.unwrap();
        assert_eq!(registry.push_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_immediate() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_local(IMAGE, b"layers");
        registry.reject_credentials(true);
        let publisher = publisher(registry.clone());

        let started = Instant::now();
        let err = publisher.ensure_published(IMAGE).await.unwrap_err();

        assert_eq!(err.kind, PublishErrorKind::Authentication);
        assert_eq!(err.attempts, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(registry.push_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_with_backoff() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_local(IMAGE, b"layers");
        registry.fail_next_pushes(2);
        let publisher = publisher(registry.clone());

        let started = Instant::now();
        publisher.ensure_published(IMAGE).await.unwrap();

        // 1s after the first failure, 2s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(registry.push_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_local(IMAGE, b"layers");
        registry.fail_next_pushes(10);
        let publisher = publisher(registry);

        let err = publisher.ensure_published(IMAGE).await.unwrap_err();
        assert_eq!(err.kind, PublishErrorKind::Transient);
        assert_eq!(err.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_read_after_write_is_retried() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_local(IMAGE, b"layers");
        registry.stale_reads(1);
        let publisher = publisher(registry.clone());

        publisher.ensure_published(IMAGE).await.unwrap();
        assert_eq!(registry.push_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_local_image() {
        let registry = Arc::new(InMemoryRegistry::new());
        let publisher = publisher(registry);

        let err = publisher.ensure_published(IMAGE).await.unwrap_err();
        assert_eq!(err.kind, PublishErrorKind::LocalImage);
    }

    #[tokio::test]
    async fn test_invalid_reference() {
        let registry = Arc::new(InMemoryRegistry::new());
        let publisher = publisher(registry);

        let err = publisher.ensure_published("not an image").await.unwrap_err();
        assert_eq!(err.kind, PublishErrorKind::InvalidReference);
        assert_eq!(err.attempts, 0);
    }
}
