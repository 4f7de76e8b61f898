//! Image source backed by the local docker CLI

use super::{ImageRef, ImageSource, LocalImage, RegistryError};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RegistryError> {
        debug!(program = %self.program, args = ?args, "Running image command");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| RegistryError::Transient(format!("failed to run {}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(&stderr))
    }
}

/// Map docker CLI stderr onto registry error classes
fn classify_failure(stderr: &str) -> RegistryError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if lower.contains("unauthorized")
        || lower.contains("denied")
        || lower.contains("authentication required")
    {
        RegistryError::Authentication(message)
    } else if lower.contains("no such image") || lower.contains("does not exist") {
        RegistryError::NotFound(message)
    } else {
        RegistryError::Transient(message)
    }
}

/// Extract the manifest digest from `docker push` output
fn parse_push_digest(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let (_, rest) = line.split_once("digest: ")?;
        rest.split_whitespace()
            .next()
            .filter(|d| d.starts_with("sha256:"))
            .map(str::to_string)
    })
}

#[async_trait]
impl ImageSource for DockerCli {
    async fn local_image(&self, image: &ImageRef) -> Result<LocalImage, RegistryError> {
        let reference = image.to_string();
        let stdout = self
            .run(&["image", "inspect", "--format", "{{.Id}}", &reference])
            .await?;
        let digest = stdout.trim();
        if digest.is_empty() {
            return Err(RegistryError::NotFound(reference));
        }
        Ok(LocalImage {
            image: image.clone(),
            digest: digest.to_string(),
        })
    }

    async fn push(&self, image: &ImageRef) -> Result<String, RegistryError> {
        let reference = image.to_string();
        let stdout = self.run(&["push", &reference]).await?;
        parse_push_digest(&stdout).ok_or_else(|| {
            RegistryError::Transient(format!("push of {} reported no digest", reference))
        })
    }
}
