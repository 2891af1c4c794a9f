//! Short-TTL cache of recent channel history, shared by both dispatch stages
//! so one broadcast costs at most one history fetch.

use crate::board::{BoardClient, BoardMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_TTL: Duration = Duration::from_secs(15);
/// How many recent messages a wake text embeds.
pub const CONTEXT_MESSAGE_LIMIT: usize = 10;

/// channelName -> (messages, fetchedAt) with TTL expiry.
pub struct ContextCache {
    ttl: Duration,
    limit: usize,
    entries: Mutex<HashMap<String, (Arc<Vec<BoardMessage>>, Instant)>>,
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, CONTEXT_MESSAGE_LIMIT)
    }
}

impl ContextCache {
    pub fn new(ttl: Duration, limit: usize) -> Self {
        Self {
            ttl,
            limit,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Recent history for a channel, served from cache within the TTL.
    /// Fetch failure with nothing cached => None (the caller degrades).
    pub async fn recent(
        &self,
        board: &BoardClient,
        channel_name: &str,
    ) -> Option<Arc<Vec<BoardMessage>>> {
        let mut entries = self.entries.lock().await;
        if let Some((messages, fetched_at)) = entries.get(channel_name) {
            if fetched_at.elapsed() < self.ttl {
                return Some(messages.clone());
            }
        }
        match board.fetch_messages(channel_name, self.limit).await {
            Ok(messages) => {
                let messages = Arc::new(messages);
                entries.insert(
                    channel_name.to_string(),
                    (messages.clone(), Instant::now()),
                );
                Some(messages)
            }
            Err(e) => {
                log::warn!("failed to fetch context for #{}: {}", channel_name, e);
                None
            }
        }
    }

    #[cfg(test)]
    pub async fn insert(&self, channel_name: &str, messages: Vec<BoardMessage>) {
        self.entries.lock().await.insert(
            channel_name.to_string(),
            (Arc::new(messages), Instant::now()),
        );
    }
}

/// Render history (most-recent-first as the board returns it) into a compact
/// chronological block, one `name (role): content` line per message.
pub fn format_context(messages: &[BoardMessage]) -> String {
    let mut lines = Vec::with_capacity(messages.len());
    for msg in messages.iter().rev() {
        let author = msg.display_author();
        match msg.author_role.as_deref().filter(|r| !r.is_empty()) {
            Some(role) => lines.push(format!("{} ({}): {}", author, role, msg.content)),
            None => lines.push(format!("{}: {}", author, msg.content)),
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(author: &str, role: Option<&str>, content: &str) -> BoardMessage {
        serde_json::from_value(serde_json::json!({
            "author": author,
            "author_role": role,
            "content": content,
        }))
        .unwrap()
    }

    #[test]
    fn format_is_chronological_with_roles() {
        // Board order: most recent first.
        let messages = vec![
            msg("qa", Some("tester"), "looks good"),
            msg("dev", None, "pushed a fix"),
        ];
        assert_eq!(
            format_context(&messages),
            "dev: pushed a fix\nqa (tester): looks good"
        );
    }

    #[tokio::test]
    async fn cached_entry_is_served_within_ttl() {
        let cache = ContextCache::new(Duration::from_secs(60), 10);
        cache
            .insert("standup", vec![msg("dev", None, "hello")])
            .await;
        // The board URL points nowhere; a hit proves the cache short-circuits.
        let board = BoardClient::new("http://127.0.0.1:9");
        let messages = cache.recent(&board, "standup").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn miss_with_unreachable_board_degrades_to_none() {
        let cache = ContextCache::new(Duration::from_secs(60), 10);
        let board = BoardClient::new("http://127.0.0.1:9");
        assert!(cache.recent(&board, "standup").await.is_none());
    }
}
