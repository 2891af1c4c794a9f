//! Judgment service client: single-prompt text completion against an
//! Anthropic-style messages API. The observer treats every failure here as
//! "wake nobody", so errors stay descriptive and non-fatal.

use crate::dispatch::JudgeBackend;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const API_VERSION: &str = "2023-06-01";

/// Client for the text-judgment service.
#[derive(Clone)]
pub struct JudgeClient {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("judge request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("judge api error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    typ: String,
    #[serde(default)]
    text: String,
}

impl JudgeClient {
    pub fn new(
        base_url: Option<String>,
        api_key: String,
        model: Option<String>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            base_url,
            api_key,
            model,
            max_tokens,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// POST /v1/messages: one user prompt, free-text reply (the observer
    /// extracts its JSON object from whatever comes back).
    pub async fn complete(&self, prompt: &str) -> Result<String, JudgeError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let res = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(JudgeError::Api(format!("{} {}", status, body)));
        }
        let data: MessagesResponse = res.json().await?;
        let text: String = data
            .content
            .iter()
            .filter(|b| b.typ == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }
}

#[async_trait]
impl JudgeBackend for JudgeClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        JudgeClient::complete(self, prompt)
            .await
            .map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_for_empty_overrides() {
        let client = JudgeClient::new(
            None,
            "key".to_string(),
            Some("  ".to_string()),
            256,
            Duration::from_secs(10),
        );
        assert_eq!(client.model(), DEFAULT_MODEL);
        assert_eq!(client.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn response_text_concatenates_text_blocks() {
        let data: MessagesResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"{\"wake\""},{"type":"text","text":": []}"}]}"#,
        )
        .unwrap();
        let text: String = data
            .content
            .iter()
            .filter(|b| b.typ == "text")
            .map(|b| b.text.as_str())
            .collect();
        assert_eq!(text, r#"{"wake": []}"#);
    }
}
