//! HTTP health probe

use super::{HealthProbe, ProbeOutcome, ProbeTarget};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Probes `GET http://<address>:<port><path>`; any 2xx is healthy
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn url_for(target: &ProbeTarget) -> String {
        let path = if target.path.starts_with('/') {
            target.path.clone()
        } else {
            format!("/{}", target.path)
        };
        format!("http://{}:{}{}", target.address, target.port, path)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, target: &ProbeTarget) -> ProbeOutcome {
        match self.client.get(Self::url_for(target)).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => ProbeOutcome::Failed(format!("status {}", response.status())),
            Err(e) if e.is_timeout() => ProbeOutcome::Failed("timeout".to_string()),
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_for(server: &mockito::ServerGuard, path: &str) -> ProbeTarget {
        let host = server.host_with_port();
        let (address, port) = host.rsplit_once(':').unwrap();
        ProbeTarget {
            workload_id: "jenkins".to_string(),
            instance_id: "jenkins-1".to_string(),
            address: address.to_string(),
            port: port.parse().unwrap(),
            path: path.to_string(),
        }
    }

    #[test]
    fn test_url_for_normalizes_path() {
        let target = ProbeTarget {
            workload_id: "jenkins".to_string(),
            instance_id: "jenkins-1".to_string(),
            address: "10.8.0.2".to_string(),
            port: 8080,
            path: "login".to_string(),
        };
        assert_eq!(HttpProbe::url_for(&target), "http://10.8.0.2:8080/login");
    }

    #[tokio::test]
    async fn test_probe_healthy_on_2xx() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/login")
            .with_status(200)
            .create_async()
            .await;

        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let outcome = probe.probe(&target_for(&server, "/login")).await;

        assert_eq!(outcome, ProbeOutcome::Healthy);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_probe_fails_on_503() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/login")
            .with_status(503)
            .create_async()
            .await;

        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let outcome = probe.probe(&target_for(&server, "/login")).await;

        assert!(!outcome.is_healthy());
    }
}
