//! API client for the farm controller HTTP API

use anyhow::{Context, Result};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// API client for the farm controller
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send::<T, ()>(Method::GET, path, None).await
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send(Method::POST, path, Some(body)).await
    }

    /// Make a PUT request with JSON body
    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send(Method::PUT, path, Some(body)).await
    }

    /// GET that also accepts 503, which health endpoints use for "not ok"
    pub async fn probe<T: DeserializeOwned>(&self, path: &str) -> Result<(StatusCode, T)> {
        let url = self.base_url.join(path).context("Invalid path")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::SERVICE_UNAVAILABLE {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, error_message(&body));
        }

        let parsed = response.json().await.context("Failed to parse response")?;
        Ok((status, parsed))
    }

    async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, error_message(&body));
        }

        response.json().await.context("Failed to parse response")
    }
}

/// Pull `error` out of an API error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| body.to_string())
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub id: String,
    pub revision: String,
    pub address: String,
    pub ready: bool,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub workload_id: String,
    pub instance_id: String,
    pub epoch: u64,
    pub last_probe_time: Option<String>,
    pub consecutive_failures: u32,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostDecision {
    pub timestamp: String,
    pub target_node_count: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub pool: String,
    pub workload: String,
    pub phase: String,
    pub node_count: u32,
    pub pool_phase: Option<String>,
    pub in_flight_target: Option<u32>,
    pub last_decision: Option<CostDecision>,
    pub health_phase: Option<String>,
    #[serde(default)]
    pub instances: Vec<HealthRecord>,
    pub volume_state: String,
    pub image_digest: Option<String>,
    pub revision: String,
    pub workload_state: String,
    #[serde(default)]
    pub replicas: Vec<Replica>,
    pub last_error: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveHours {
    pub weekdays: Vec<String>,
    pub start_hour: u32,
    pub end_hour: u32,
}

/// CPU and memory footprint of one replica
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    pub cpu_millicores: u32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredState {
    pub workload: String,
    pub image: String,
    pub replicas: u32,
    #[serde(default)]
    pub requests: Option<ResourceQuantities>,
    #[serde(default)]
    pub limits: Option<ResourceQuantities>,
    pub min_nodes: Option<u32>,
    pub max_nodes: u32,
    pub active_hours: ActiveHours,
    pub volume: VolumeDesired,
    pub budget: BudgetPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDesired {
    pub name: String,
    pub size_gb: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub monthly_budget: Option<f64>,
    #[serde(default)]
    pub hourly_node_cost: Option<f64>,
}

/// Partial desired state; unset fields are left untouched by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_nodes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_hours: Option<ActiveHours>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_budget: Option<f64>,
}

impl DesiredPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityResponse {
    pub recorded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: std::collections::BTreeMap<String, ComponentHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_body() -> serde_json::Value {
        serde_json::json!({
            "pool": "us-central1-a/ci-pool",
            "workload": "jenkins",
            "phase": "available",
            "node_count": 1,
            "pool_phase": "steady",
            "in_flight_target": null,
            "last_decision": {
                "timestamp": "2024-01-06T10:00:00Z",
                "target_node_count": 1,
                "reason": "recent activity signal"
            },
            "health_phase": "ready",
            "instances": [],
            "volume_state": "bound",
            "image_digest": "sha256:abc",
            "revision": "r1",
            "workload_state": "available",
            "replicas": [{
                "id": "jenkins-1",
                "revision": "r1",
                "address": "10.0.0.4",
                "ready": true,
                "started_at": "2024-01-06T10:01:00Z"
            }],
            "last_error": null,
            "updated_at": "2024-01-06T10:02:00Z"
        })
    }

    #[tokio::test]
    async fn test_get_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/status")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(status_body().to_string())
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let status: ControllerStatus = client.get("api/v1/status").await.unwrap();

        mock.assert_async().await;
        assert_eq!(status.phase, "available");
        assert_eq!(status.replicas.len(), 1);
        assert_eq!(status.last_decision.unwrap().target_node_count, 1);
    }

    #[tokio::test]
    async fn test_put_sends_only_set_fields() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/api/v1/desired")
            .match_body(mockito::Matcher::Json(serde_json::json!({"replicas": 2})))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "workload": "jenkins",
                    "image": "jenkins/jenkins:lts",
                    "replicas": 2,
                    "min_nodes": null,
                    "max_nodes": 3,
                    "active_hours": {"weekdays": ["Mon"], "start_hour": 8, "end_hour": 18},
                    "volume": {"name": "jenkins-home", "size_gb": 50, "storage_class": null},
                    "budget": {"monthly_budget": null, "hourly_node_cost": null}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let patch = DesiredPatch {
            replicas: Some(2),
            ..Default::default()
        };
        let desired: DesiredState = client.put("api/v1/desired", &patch).await.unwrap();

        mock.assert_async().await;
        assert_eq!(desired.replicas, 2);
    }

    #[test]
    fn test_patch_emptiness_covers_every_field() {
        assert!(DesiredPatch::default().is_empty());

        let hours_only = DesiredPatch {
            active_hours: Some(ActiveHours {
                weekdays: vec!["Sat".to_string()],
                start_hour: 9,
                end_hour: 17,
            }),
            ..Default::default()
        };
        assert!(!hours_only.is_empty());
        assert_eq!(hours_only, hours_only.clone());

        let limits_only = DesiredPatch {
            limits: Some(ResourceQuantities {
                cpu_millicores: 1000,
                memory_bytes: 2 << 30,
            }),
            ..Default::default()
        };
        assert!(!limits_only.is_empty());
    }

    #[tokio::test]
    async fn test_put_sends_resource_quantities() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/api/v1/desired")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "requests": {"cpu_millicores": 500, "memory_bytes": 1073741824u64}
            })))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "workload": "jenkins",
                    "image": "jenkins/jenkins:lts",
                    "replicas": 1,
                    "requests": {"cpu_millicores": 500, "memory_bytes": 1073741824u64},
                    "limits": null,
                    "min_nodes": null,
                    "max_nodes": 3,
                    "active_hours": {"weekdays": [], "start_hour": 0, "end_hour": 0},
                    "volume": {"name": "jenkins-home", "size_gb": 50, "storage_class": null},
                    "budget": {"monthly_budget": null, "hourly_node_cost": null}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let patch = DesiredPatch {
            requests: Some(ResourceQuantities {
                cpu_millicores: 500,
                memory_bytes: 1 << 30,
            }),
            ..Default::default()
        };
        let desired: DesiredState = client.put("api/v1/desired", &patch).await.unwrap();

        mock.assert_async().await;
        assert_eq!(desired.requests, patch.requests);
        assert!(desired.limits.is_none());
    }

    #[tokio::test]
    async fn test_api_error_surfaces_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/api/v1/desired")
            .with_status(422)
            .with_body(r#"{"error":"invalid configuration: min_nodes exceeds max_nodes"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let patch = DesiredPatch {
            min_nodes: Some(4),
            ..Default::default()
        };
        let err = client
            .put::<DesiredState, _>("api/v1/desired", &patch)
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("422"));
        assert!(message.contains("min_nodes exceeds max_nodes"));
    }

    #[tokio::test]
    async fn test_probe_accepts_service_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/healthz")
            .with_status(503)
            .with_body(
                r#"{"status":"unhealthy","components":{"image":{"status":"unhealthy","message":"auth"}}}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let (status, health): (_, HealthResponse) = client.probe("healthz").await.unwrap();

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(health.status, "unhealthy");
        assert_eq!(health.components["image"].message.as_deref(), Some("auth"));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
