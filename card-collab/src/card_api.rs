//! [`CardUpdater`] implementations.
//!
//! `HttpCardUpdater` PATCHes `<base>/cards/<cardId>/description` with
//! `{"description": <ProseMirror JSON>}`. `LogOnlyCardUpdater` is used when
//! no API is configured.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use url::Url;

use crate::config::CardApiConfig;
use crate::debounce::CardUpdater;
use crate::error::{CollabError, Result};
use crate::protocol::Actor;

/// Header naming the user whose edit triggered the write.
pub const ACTING_USER_HEADER: &str = "X-Acting-User";

/// Writes descriptions through the card service's REST API.
pub struct HttpCardUpdater {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpCardUpdater {
    pub fn new(config: &CardApiConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| CollabError::Protocol(format!("invalid card API url {}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(CollabError::Protocol(format!(
                "card API url {base_url} cannot be a base"
            )));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| CollabError::Protocol(format!("invalid card API token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| CollabError::Transport(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    /// `<base>/cards/<cardId>/description`, with the card id percent-encoded.
    pub fn endpoint(&self, card_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["cards", card_id, "description"]);
        }
        url
    }
}

#[async_trait]
impl CardUpdater for HttpCardUpdater {
    async fn update_card_description(
        &self,
        card_id: &str,
        content: Value,
        actor: Option<&Actor>,
    ) -> Result<()> {
        let mut request = self
            .client
            .patch(self.endpoint(card_id))
            .json(&json!({ "description": content }));
        if let Some(actor) = actor {
            request = request.header(ACTING_USER_HEADER, &actor.user_id);
        }

        let response = request.send().await.map_err(|e| CollabError::CardUpdate {
            card_id: card_id.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollabError::CardUpdate {
                card_id: card_id.to_string(),
                reason: format!("card API returned {status}"),
            });
        }
        Ok(())
    }
}

/// Logs descriptions instead of writing them.
#[derive(Debug, Default)]
pub struct LogOnlyCardUpdater;

#[async_trait]
impl CardUpdater for LogOnlyCardUpdater {
    async fn update_card_description(
        &self,
        card_id: &str,
        content: Value,
        actor: Option<&Actor>,
    ) -> Result<()> {
        let blocks = content["content"].as_array().map_or(0, Vec::len);
        let by = actor.map_or("unknown", |a| a.user_id.as_str());
        log::info!("Card {card_id} description changed by {by} ({blocks} blocks), no card API configured");
        Ok(())
    }
}
