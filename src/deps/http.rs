use crate::config::HttpEndpointConfig;
use anyhow::{Context, Result};
use std::time::{Duration, Instant};

/// Header carrying the provider's remaining request quota.
pub const QUOTA_HEADER: &str = "x-ratelimit-remaining";

/// An HTTP dependency: client plus the endpoint it talks to.
pub struct HttpEndpoint {
    config: HttpEndpointConfig,
    client: reqwest::Client,
    substitute: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub status: u16,
    pub latency: Duration,
    pub remaining_quota: Option<u64>,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn quota_exhausted(&self) -> bool {
        self.status == 429 || self.remaining_quota == Some(0)
    }
}

impl HttpEndpoint {
    /// Build a client with its own fresh connection pool.
    pub fn build(config: &HttpEndpointConfig, timeout: Duration, substitute: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            config: config.clone(),
            client,
            substitute,
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn is_substitute(&self) -> bool {
        self.substitute
    }

    pub fn probe_url(&self) -> String {
        let base = self.config.url.trim_end_matches('/');
        let path = self.config.probe_path.trim_start_matches('/');
        if path.is_empty() {
            format!("{}/", base)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// Name of the API key variable when it is configured but not set.
    pub fn missing_api_key(&self) -> Option<&str> {
        let var = self.config.api_key_env.as_deref()?;
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => None,
            _ => Some(var),
        }
    }

    /// Lightweight functional probe.
    pub async fn probe(&self) -> Result<ProbeResult> {
        let start = Instant::now();
        let mut request = self.client.get(self.probe_url());
        if let Some(var) = &self.config.api_key_env
            && let Ok(key) = std::env::var(var)
        {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.probe_url()))?;
        let remaining_quota = response
            .headers()
            .get(QUOTA_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        Ok(ProbeResult {
            status: response.status().as_u16(),
            latency: start.elapsed(),
            remaining_quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str, probe_path: &str) -> HttpEndpoint {
        HttpEndpoint::build(
            &HttpEndpointConfig {
                url: url.into(),
                probe_path: probe_path.into(),
                api_key_env: Some("SOAK_TEST_KEY_THAT_IS_NEVER_SET".into()),
            },
            Duration::from_millis(200),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_probe_url_joins_cleanly() {
        assert_eq!(endpoint("http://a/", "/health").probe_url(), "http://a/health");
        assert_eq!(endpoint("http://a", "health").probe_url(), "http://a/health");
        assert_eq!(endpoint("http://a", "/").probe_url(), "http://a/");
    }

    #[test]
    fn test_missing_api_key_is_reported() {
        assert_eq!(
            endpoint("http://a", "/").missing_api_key(),
            Some("SOAK_TEST_KEY_THAT_IS_NEVER_SET")
        );
    }

    #[test]
    fn test_probe_result_classification() {
        let ok = ProbeResult {
            status: 204,
            latency: Duration::ZERO,
            remaining_quota: Some(10),
        };
        assert!(ok.is_success());
        assert!(!ok.quota_exhausted());

        let limited = ProbeResult {
            status: 429,
            latency: Duration::ZERO,
            remaining_quota: None,
        };
        assert!(limited.quota_exhausted());
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_error() {
        // Port 9 (discard) on localhost is essentially never listening.
        let err = endpoint("http://127.0.0.1:9", "/").probe().await;
        assert!(err.is_err());
    }
}
