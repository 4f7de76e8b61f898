//! Registry v2 HTTP client
//!
//! Requests go out with basic credentials first. A registry that answers
//! with a bearer challenge gets a token from its realm, and the token is
//! cached per registry and scope until the registry rejects it.

use super::{ImageRef, RegistryApi, RegistryError};
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
                               application/vnd.oci.image.manifest.v1+json, \
                               application/vnd.oci.image.index.v1+json";

/// Docker Hub serves the registry API from a different host than its name
const DOCKER_HUB_ALIASES: [&str; 2] = ["docker.io", "index.docker.io"];
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Host serving the v2 API for `registry`
fn api_host(registry: &str) -> &str {
    if DOCKER_HUB_ALIASES.contains(&registry) {
        DOCKER_HUB_API_HOST
    } else {
        registry
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for param in split_params(params) {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm.filter(|r| !r.is_empty())?,
            service,
            scope,
        })
    }
}

/// Split on commas outside quoted values; scopes carry commas of their own
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in params.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

pub struct HttpRegistry {
    client: Client,
    base_url: Option<String>,
    credentials: Option<RegistryCredentials>,
    /// Bearer tokens keyed by registry and scope
    tokens: DashMap<String, String>,
}

impl HttpRegistry {
    pub fn new(
        credentials: Option<RegistryCredentials>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create registry HTTP client")?;
        Ok(Self {
            client,
            base_url: None,
            credentials,
            tokens: DashMap::new(),
        })
    }

    /// Send every request to `base_url` instead of `https://<registry>`
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn url(&self, registry: &str, path: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}{}", base, path),
            None => format!("https://{}{}", api_host(registry), path),
        }
    }

    fn basic(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(c) => builder.basic_auth(&c.username, Some(&c.password)),
            None => builder,
        }
    }

    /// Send a request, answering a bearer challenge once if the registry raises one
    async fn send(
        &self,
        registry: &str,
        scope: Option<&str>,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, RegistryError> {
        let key = format!("{}|{}", registry, scope.unwrap_or_default());
        let cached = self.tokens.get(&key).map(|t| t.value().clone());
        let first = match &cached {
            Some(token) => build().bearer_auth(token),
            None => self.basic(build()),
        };
        let response = first.send().await.map_err(transport_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse);
        let Some(challenge) = challenge else {
            self.tokens.remove(&key);
            return Ok(response);
        };

        let token = self.fetch_token(&challenge, scope).await?;
        self.tokens.insert(key, token.clone());
        build()
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        scope: Option<&str>,
    ) -> Result<String, RegistryError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = challenge.scope.as_deref().or(scope) {
            query.push(("scope", scope));
        }
        debug!(realm = %challenge.realm, query = ?query, "Requesting registry token");

        let response = self
            .basic(self.client.get(&challenge.realm).query(&query))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "token exchange"));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Transient(format!("malformed token response: {}", e)))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Authentication("token exchange returned no token".to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> RegistryError {
    RegistryError::Transient(e.to_string())
}

fn status_error(status: StatusCode, what: &str) -> RegistryError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RegistryError::Authentication(format!("{} returned {}", what, status))
        }
        _ => RegistryError::Transient(format!("{} returned {}", what, status)),
    }
}

#[async_trait]
impl RegistryApi for HttpRegistry {
    async fn authenticate(&self, registry: &str) -> Result<(), RegistryError> {
        let url = self.url(registry, "/v2/");
        let response = self
            .send(registry, None, || self.client.get(&url))
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response.status(), "registry login"))
        }
    }

    async fn resolve(&self, image: &ImageRef) -> Result<Option<String>, RegistryError> {
        let path = format!("/v2/{}/manifests/{}", image.repository, image.tag);
        let url = self.url(&image.registry, &path);
        let scope = format!("repository:{}:pull", image.repository);
        let response = self
            .send(&image.registry, Some(&scope), || {
                self.client.head(&url).header(ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, "manifest lookup"));
        }

        Ok(response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}
