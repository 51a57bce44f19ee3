use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::TransportConfig;
use crate::transport::{BatchRequest, Delivery, Transport, TransportError};

/// Optional acknowledgement body returned with a 2xx
#[derive(Debug, Default, Deserialize)]
struct CollectorAck {
    #[serde(default)]
    rejected: Vec<usize>,
}

/// Posts batches to the collector with reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    host: String,
    path: String,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(config.user_agent.clone())
            .build()?;

        let path = if config.batch_path.starts_with('/') {
            config.batch_path.clone()
        } else {
            format!("/{}", config.batch_path)
        };

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            path,
        })
    }

    pub fn endpoint(&self, use_https: bool) -> String {
        let scheme = if use_https { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.host, self.path)
    }
}

fn is_retriable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, batch: &BatchRequest) -> Result<Delivery, TransportError> {
        let url = self.endpoint(batch.use_https);
        debug!("Submitting {} hits to {}", batch.len(), url);

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .body(batch.body())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let ack = serde_json::from_str::<CollectorAck>(&body).unwrap_or_default();
            let mut rejected: Vec<usize> = ack
                .rejected
                .into_iter()
                .filter(|i| *i < batch.len())
                .collect();
            rejected.sort_unstable();
            rejected.dedup();

            return Ok(if rejected.is_empty() {
                Delivery::Accepted
            } else {
                Delivery::PartiallyRejected(rejected)
            });
        }

        if is_retriable(status) {
            return Err(TransportError::Status(status.as_u16()));
        }

        Ok(Delivery::Rejected {
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_scheme() {
        let config = TransportConfig {
            host: "collector.local:8080/".to_string(),
            batch_path: "batch".to_string(),
            ..TransportConfig::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.endpoint(true), "https://collector.local:8080/batch");
        assert_eq!(transport.endpoint(false), "http://collector.local:8080/batch");
    }

    #[test]
    fn test_retriable_statuses() {
        assert!(is_retriable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retriable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retriable(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retriable(StatusCode::BAD_REQUEST));
        assert!(!is_retriable(StatusCode::PAYLOAD_TOO_LARGE));
    }
}
