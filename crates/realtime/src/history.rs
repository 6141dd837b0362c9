//! HTTP client for the conversation event history endpoint.

use async_trait::async_trait;
use parley_core::{
    config::ClientConfig,
    events::MessageEvent,
    history::{EventHistory, EventQuery, HistoryError},
};
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct EventsResponse {
    events: Vec<MessageEvent>,
}

/// Fetches missed events with `POST {base_url}/play/conversation/events`.
#[derive(Debug, Clone)]
pub struct HttpEventHistory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEventHistory {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), &config.base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EventHistory for HttpEventHistory {
    async fn fetch_events(
        &self,
        token: &str,
        query: &EventQuery,
    ) -> Result<Vec<MessageEvent>, HistoryError> {
        let url = format!("{}/play/conversation/events", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(query)
            .send()
            .await
            .map_err(|e| HistoryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let EventsResponse { mut events } = response
            .json()
            .await
            .map_err(|e| HistoryError::Decode(e.to_string()))?;
        events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        debug!(
            conversation_uuid = %query.conversation_uuid,
            count = events.len(),
            "Fetched event history"
        );
        Ok(events)
    }
}
