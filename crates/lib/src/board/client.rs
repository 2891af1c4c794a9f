//! Board REST client: channel list and recent channel history.

use serde::Deserialize;

/// Client for the board's HTTP API.
#[derive(Clone)]
pub struct BoardClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("board request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("board api error: {0}")]
    Api(String),
}

/// One channel from GET /api/channels. Older board builds expose `_id`
/// instead of `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "_id")]
    pub legacy_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ChannelInfo {
    pub fn channel_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.legacy_id.as_deref())
    }
}

/// One message from GET /api/messages (most-recent-first).
#[derive(Debug, Clone, Deserialize)]
pub struct BoardMessage {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_role: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl BoardMessage {
    /// Display name with author-id fallback.
    pub fn display_author(&self) -> &str {
        self.author_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.author)
    }
}

impl BoardClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// GET /api/channels: full channel list.
    pub async fn fetch_channels(&self) -> Result<Vec<ChannelInfo>, BoardError> {
        let url = format!("{}/api/channels", self.base_url);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BoardError::Api(format!("{} {}", status, body)));
        }
        let channels: Vec<ChannelInfo> = res.json().await?;
        Ok(channels)
    }

    /// GET /api/messages?channel=<name>&limit=<n>: recent history for a
    /// channel by name, most recent first.
    pub async fn fetch_messages(
        &self,
        channel_name: &str,
        limit: usize,
    ) -> Result<Vec<BoardMessage>, BoardError> {
        let url = format!(
            "{}/api/messages?channel={}&limit={}",
            self.base_url, channel_name, limit
        );
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BoardError::Api(format!("{} {}", status, body)));
        }
        let messages: Vec<BoardMessage> = res.json().await?;
        Ok(messages)
    }
}
