//! Channel watcher: one push connection to the board, one subscription per
//! channel, with periodic channel-list refresh and reconnect on loss.

use crate::board::client::BoardClient;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const CHANNEL_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Normalized broadcast event handed to the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    pub author: String,
    pub content: String,
    pub channel_id: String,
    pub mentions: Vec<String>,
}

/// Raw push frame from the board hub.
#[derive(Debug, Deserialize)]
struct BroadcastWire {
    #[serde(default)]
    author: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    mentions: Option<Vec<String>>,
}

/// Shared channel id -> name map, populated from the channel list fetch.
#[derive(Default)]
pub struct ChannelDirectory {
    names: RwLock<HashMap<String, String>>,
}

impl ChannelDirectory {
    /// Human-readable name for a channel id, falling back to the id itself.
    pub async fn name_for(&self, channel_id: &str) -> String {
        self.names
            .read()
            .await
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| channel_id.to_string())
    }

    async fn record(&self, channel_id: &str, name: &str) {
        self.names
            .write()
            .await
            .insert(channel_id.to_string(), name.to_string());
    }
}

/// Spawn the watcher task: subscribe to every channel and forward normalized
/// broadcasts to `tx`. Reconnects forever; exits only when the receiver side
/// is dropped.
pub fn spawn_watcher(
    board: BoardClient,
    ws_url: String,
    directory: Arc<ChannelDirectory>,
    tx: mpsc::Sender<BroadcastEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match watch_once(&board, &ws_url, &directory, &tx).await {
                WatchExit::ReceiverGone => {
                    log::info!("dispatch receiver gone, stopping board watcher");
                    return;
                }
                WatchExit::TransportLost(reason) => {
                    log::warn!(
                        "board connection lost ({}), reconnecting in {}s",
                        reason,
                        RECONNECT_DELAY.as_secs()
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    })
}

enum WatchExit {
    ReceiverGone,
    TransportLost(String),
}

async fn watch_once(
    board: &BoardClient,
    ws_url: &str,
    directory: &ChannelDirectory,
    tx: &mpsc::Sender<BroadcastEvent>,
) -> WatchExit {
    let mut ws = match tokio_tungstenite::connect_async(ws_url).await {
        Ok((ws, _)) => ws,
        Err(e) => return WatchExit::TransportLost(e.to_string()),
    };
    log::info!("connected to board at {}", ws_url);

    // Fresh connection: resubscribe to everything we know about.
    let mut subscribed = HashSet::new();
    if let Err(e) = subscribe_all(board, &mut ws, directory, &mut subscribed).await {
        return WatchExit::TransportLost(e);
    }

    let mut refresh = tokio::time::interval(CHANNEL_REFRESH_INTERVAL);
    refresh.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            frame = ws.next() => {
                let Some(Ok(msg)) = frame else {
                    return WatchExit::TransportLost("stream ended".to_string());
                };
                let Message::Text(text) = msg else { continue };
                let Some(event) = normalize(&text) else { continue };
                if tx.send(event).await.is_err() {
                    return WatchExit::ReceiverGone;
                }
            }
            _ = refresh.tick() => {
                // Pick up newly created channels without a restart.
                if let Err(e) = subscribe_all(board, &mut ws, directory, &mut subscribed).await {
                    return WatchExit::TransportLost(e);
                }
            }
        }
    }
}

async fn subscribe_all(
    board: &BoardClient,
    ws: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    directory: &ChannelDirectory,
    subscribed: &mut HashSet<String>,
) -> Result<(), String> {
    let channels = match board.fetch_channels().await {
        Ok(channels) => channels,
        Err(e) => {
            // REST hiccups are not transport failures; keep the push
            // connection and try again on the next refresh.
            log::warn!("failed to fetch channels: {}", e);
            return Ok(());
        }
    };
    for ch in channels {
        let Some(id) = ch.channel_id().map(|s| s.to_string()) else {
            continue;
        };
        if let Some(name) = ch.name.as_deref() {
            directory.record(&id, name).await;
        }
        if !subscribed.insert(id.clone()) {
            continue;
        }
        let frame = serde_json::json!({ "action": "subscribe", "channel": id }).to_string();
        ws.send(Message::Text(frame))
            .await
            .map_err(|e| e.to_string())?;
    }
    log::info!("subscribed to {} channel(s)", subscribed.len());
    Ok(())
}

/// Parse a push frame into a broadcast event. Frames that are not channel
/// messages (or do not parse) are ignored.
fn normalize(text: &str) -> Option<BroadcastEvent> {
    let wire: BroadcastWire = serde_json::from_str(text).ok()?;
    if wire.channel_id.is_empty() && wire.content.is_empty() {
        return None;
    }
    Some(BroadcastEvent {
        author: wire.author,
        content: wire.content,
        channel_id: wire.channel_id,
        mentions: wire.mentions.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fills_defaults() {
        let ev = normalize(r#"{"author":"po","content":"hi @dev","channel_id":"c1","mentions":["dev"]}"#)
            .unwrap();
        assert_eq!(ev.author, "po");
        assert_eq!(ev.mentions, vec!["dev"]);

        let ev = normalize(r#"{"author":"po","content":"plain","channel_id":"c1"}"#).unwrap();
        assert!(ev.mentions.is_empty());
    }

    #[test]
    fn normalize_rejects_junk() {
        assert!(normalize("not json").is_none());
        assert!(normalize(r#"{"unrelated":true}"#).is_none());
    }

    #[tokio::test]
    async fn directory_falls_back_to_id() {
        let dir = ChannelDirectory::default();
        assert_eq!(dir.name_for("c1").await, "c1");
        dir.record("c1", "standup").await;
        assert_eq!(dir.name_for("c1").await, "standup");
    }
}
