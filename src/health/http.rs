//! HTTP health probe

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;

use super::{HealthProbe, ProbeOutcome};
use crate::config::HttpProbeConfig;
use crate::{Error, Result};

/// GETs a URL; 2xx is up, anything else is down.
///
/// A successful response slower than `degraded_latency` is reported as
/// degraded.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    degraded_latency: Option<Duration>,
}

impl HttpProbe {
    /// Build a probe from its configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid header, or [`Error::Http`] if
    /// the client cannot be built.
    pub fn new(config: &HttpProbeConfig, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::Config(format!("Invalid probe header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("Invalid probe header value for '{key}': {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            headers,
            degraded_latency: config.degraded_latency,
        })
    }

    /// Probed URL
    pub fn url(&self) -> &str {
        &self.url
    }

    fn classify(&self, status: reqwest::StatusCode, latency: Duration) -> ProbeOutcome {
        if !status.is_success() {
            return ProbeOutcome::Down(format!("HTTP {status}"));
        }
        match self.degraded_latency {
            Some(limit) if latency > limit => ProbeOutcome::Degraded(format!(
                "slow response: {}ms (limit {}ms)",
                latency.as_millis(),
                limit.as_millis()
            )),
            _ => ProbeOutcome::Up,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self) -> Result<ProbeOutcome> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .send()
            .await?;
        Ok(self.classify(response.status(), started.elapsed()))
    }
}
