//! Stage 1: explicit @-mention routing.

use crate::board::{BoardClient, BroadcastEvent, ChannelDirectory};
use crate::config::AgentEndpoint;
use crate::context::{format_context, ContextCache};
use crate::gateway::WakeSink;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Mention token that expands to the whole configured roster.
const EVERYONE: &str = "everyone";
/// Longest excerpt of the triggering message embedded in a wake text.
const EXCERPT_MAX: usize = 300;

pub struct MentionDispatcher {
    roster: Vec<AgentEndpoint>,
    sink: Arc<dyn WakeSink>,
    board: BoardClient,
    cache: Arc<ContextCache>,
    directory: Arc<ChannelDirectory>,
}

impl MentionDispatcher {
    pub fn new(
        roster: Vec<AgentEndpoint>,
        sink: Arc<dyn WakeSink>,
        board: BoardClient,
        cache: Arc<ContextCache>,
        directory: Arc<ChannelDirectory>,
    ) -> Self {
        Self {
            roster,
            sink,
            board,
            cache,
            directory,
        }
    }

    /// Route one broadcast's mentions. Returns the ids that were
    /// mention-woken so the observer stage can skip them.
    pub async fn dispatch(&self, event: &BroadcastEvent) -> HashSet<String> {
        let mut woken = HashSet::new();
        if event.mentions.is_empty() {
            return woken;
        }

        let roster_ids: HashSet<&str> = self.roster.iter().map(|a| a.id.as_str()).collect();
        let targets = expand_mentions(&event.mentions, &roster_ids, &event.author);
        if targets.is_empty() {
            return woken;
        }

        let channel_name = self.directory.name_for(&event.channel_id).await;
        let context_block = self
            .cache
            .recent(&self.board, &channel_name)
            .await
            .map(|messages| format_context(&messages))
            .unwrap_or_default();

        for id in targets {
            log::info!(
                "detected @mention for \"{}\" by \"{}\" in #{}",
                id,
                event.author,
                channel_name
            );
            let text = wake_text(&id, &event.author, &channel_name, &event.content, &context_block);
            self.sink.wake(&id, &text).await;
            woken.insert(id);
        }
        woken
    }
}

/// Expand `everyone`, then drop the author and anything not in the roster.
fn expand_mentions(
    mentions: &[String],
    roster_ids: &HashSet<&str>,
    author: &str,
) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for mention in mentions {
        if mention == EVERYONE {
            for id in roster_ids {
                out.insert(id.to_string());
            }
        } else {
            out.insert(mention.clone());
        }
    }
    out.retain(|id| id != author && roster_ids.contains(id.as_str()));
    out
}

fn wake_text(
    agent_id: &str,
    author: &str,
    channel_name: &str,
    content: &str,
    context_block: &str,
) -> String {
    let mut text = format!(
        "@{} mentioned by {} in #{}: \"{}\"",
        agent_id,
        author,
        channel_name,
        excerpt(content)
    );
    if !context_block.is_empty() {
        text.push_str(&format!(
            "\n\nRecent messages in #{}:\n{}",
            channel_name, context_block
        ));
    }
    text
}

/// First EXCERPT_MAX chars, respecting char boundaries.
fn excerpt(content: &str) -> &str {
    match content.char_indices().nth(EXCERPT_MAX) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::RecordingSink;

    fn roster(ids: &[&str]) -> Vec<AgentEndpoint> {
        ids.iter()
            .map(|id| AgentEndpoint {
                id: id.to_string(),
                display_name: String::new(),
                role: String::new(),
                url: format!("ws://{}:1", id),
                token: "t".to_string(),
            })
            .collect()
    }

    fn ids(roster: &[AgentEndpoint]) -> HashSet<&str> {
        roster.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn everyone_expands_to_roster_minus_author() {
        let roster = roster(&["po", "dev", "cq", "qa", "ops"]);
        let mentions = vec!["everyone".to_string()];
        let out = expand_mentions(&mentions, &ids(&roster), "dev");
        let out: Vec<_> = out.into_iter().collect();
        assert_eq!(out, vec!["cq", "ops", "po", "qa"]);
    }

    #[test]
    fn self_and_unknown_mentions_are_dropped() {
        let roster = roster(&["dev", "qa"]);
        let mentions = vec![
            "dev".to_string(),
            "qa".to_string(),
            "nobody".to_string(),
        ];
        let out = expand_mentions(&mentions, &ids(&roster), "dev");
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec!["qa"]);
    }

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(400);
        assert_eq!(excerpt(&long).chars().count(), 300);
        assert_eq!(excerpt("short"), "short");
    }

    #[tokio::test]
    async fn dispatch_wakes_each_surviving_mention_once() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = MentionDispatcher::new(
            roster(&["po", "dev", "qa"]),
            sink.clone(),
            BoardClient::new("http://127.0.0.1:9"),
            Arc::new(ContextCache::default()),
            Arc::new(ChannelDirectory::default()),
        );
        let cache = &dispatcher.cache;
        cache.insert("c1", vec![]).await;

        let event = BroadcastEvent {
            author: "po".to_string(),
            content: "please check the failing build @everyone".to_string(),
            channel_id: "c1".to_string(),
            mentions: vec!["everyone".to_string()],
        };
        let woken = dispatcher.dispatch(&event).await;
        assert_eq!(woken.len(), 2);
        assert!(woken.contains("dev") && woken.contains("qa"));

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, text)| text.contains("mentioned by po in #c1")));
    }

    #[tokio::test]
    async fn no_mentions_is_a_no_op() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = MentionDispatcher::new(
            roster(&["dev"]),
            sink.clone(),
            BoardClient::new("http://127.0.0.1:9"),
            Arc::new(ContextCache::default()),
            Arc::new(ChannelDirectory::default()),
        );
        let event = BroadcastEvent {
            author: "po".to_string(),
            content: "nothing to see".to_string(),
            channel_id: "c1".to_string(),
            mentions: vec![],
        };
        assert!(dispatcher.dispatch(&event).await.is_empty());
        assert!(sink.calls.lock().unwrap().is_empty());
    }
}
