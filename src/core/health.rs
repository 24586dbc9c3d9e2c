/// Post-restore health probe
///
/// After a restore the application is polled once over HTTP. The result is
/// informational: a restored stack that is still warming up is not a failed
/// restore.

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::{Duration, Instant};

use crate::utils::{HEALTH_PATH, HEALTH_TIMEOUT};

pub struct HealthChecker {
    client: Client,
}

#[derive(Debug)]
pub struct HealthReport {
    pub url: String,
    pub healthy: bool,
    pub status: Option<u16>,
    pub response_time_ms: u128,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new() -> Result<Self> {
        Self::with_timeout(HEALTH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Health endpoint for an application base URL
    pub fn health_url(access_url: &str) -> String {
        format!("{}{}", access_url.trim_end_matches('/'), HEALTH_PATH)
    }

    /// Probe `<access_url>/web/health` once
    pub async fn check(&self, access_url: &str) -> HealthReport {
        let url = Self::health_url(access_url);
        let start = Instant::now();

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                return HealthReport {
                    url,
                    healthy: false,
                    status: None,
                    response_time_ms: start.elapsed().as_millis(),
                    error: Some(format!("Request failed: {}", e)),
                };
            }
        };

        let elapsed = start.elapsed().as_millis();
        let status = response.status();

        HealthReport {
            url,
            healthy: status.is_success(),
            status: Some(status.as_u16()),
            response_time_ms: elapsed,
            error: (!status.is_success()).then(|| format!("HTTP {}", status)),
        }
    }
}
