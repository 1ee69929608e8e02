use std::time::Duration;

use async_trait::async_trait;

use crate::config::ApiConfig;
use crate::error::NetworkError;
use crate::models::EntityKind;

use super::payload::decode_page;
use super::{ListRequest, Page, RemoteFetcher};

/// REST client for the backend's list endpoints.
pub struct HttpFetcher {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &ApiConfig) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn endpoint(&self, kind: EntityKind) -> String {
        let path = match kind {
            EntityKind::User => "users",
            EntityKind::Channel => "channels",
            EntityKind::Message => "search",
        };
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, request: &ListRequest) -> Result<Page, NetworkError> {
        let url = self.endpoint(request.kind);
        let payload = request.to_payload().to_string();
        let request_id = uuid::Uuid::new_v4().to_string();

        let mut builder = self
            .client
            .get(&url)
            .header("x-request-id", &request_id)
            .query(&[("payload", payload.as_str())]);
        if let Some(api_key) = &self.api_key {
            builder = builder.query(&[("api_key", api_key.as_str())]);
        }

        tracing::debug!(%url, %request_id, kind = %request.kind, "Sending list request");
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(NetworkError::Server {
                code: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        let page = decode_page(request.kind, &body)?;
        tracing::debug!(
            %request_id,
            count = page.entities.len(),
            has_next = page.next_cursor.is_some(),
            "List request completed"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_per_kind() {
        let fetcher = HttpFetcher::new(&ApiConfig {
            base_url: "http://localhost:3030/".to_string(),
            ..ApiConfig::default()
        })
        .unwrap();
        assert_eq!(fetcher.endpoint(EntityKind::User), "http://localhost:3030/users");
        assert_eq!(fetcher.endpoint(EntityKind::Channel), "http://localhost:3030/channels");
        assert_eq!(fetcher.endpoint(EntityKind::Message), "http://localhost:3030/search");
    }
}
