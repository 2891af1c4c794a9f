//! Stage 2: relevance observation. A cheap keyword pre-filter gates an
//! external judgment call that decides which unmentioned agents, if any,
//! should also be woken. Every failure path resolves to "wake nobody".

use crate::board::{BoardClient, BroadcastEvent, ChannelDirectory};
use crate::config::AgentEndpoint;
use crate::context::{format_context, ContextCache};
use crate::debounce::WakeDebounce;
use crate::gateway::WakeSink;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Domain keywords spanning the recognized agent roles. A broadcast that
/// contains none of these never reaches the judgment service.
const DOMAIN_KEYWORDS: &[&str] = &[
    // product / planning
    "spec", "requirement", "backlog", "sprint", "feature", "scope", "priorit",
    // development
    "bug", "fix", "merge", "build", "refactor", "implement", "code",
    // review / quality
    "review", "test", "regression", "qa", "coverage", "broken",
    // operations
    "deploy", "release", "incident", "outage", "monitor", "pipeline", "infra",
    "error", "fail",
];

/// External text-judgment call. Implemented by the judge client; tests
/// substitute a scripted fake.
#[async_trait]
pub trait JudgeBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Judge verdict: `{"wake": [ids...], "reason": "..."}`.
#[derive(Debug, Default, Deserialize)]
struct JudgeVerdict {
    #[serde(default)]
    wake: Vec<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub struct RelevanceObserver {
    roster: Vec<AgentEndpoint>,
    judge: Arc<dyn JudgeBackend>,
    sink: Arc<dyn WakeSink>,
    board: BoardClient,
    cache: Arc<ContextCache>,
    directory: Arc<ChannelDirectory>,
    debounce: Arc<WakeDebounce>,
}

impl RelevanceObserver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        roster: Vec<AgentEndpoint>,
        judge: Arc<dyn JudgeBackend>,
        sink: Arc<dyn WakeSink>,
        board: BoardClient,
        cache: Arc<ContextCache>,
        directory: Arc<ChannelDirectory>,
        debounce: Arc<WakeDebounce>,
    ) -> Self {
        Self {
            roster,
            judge,
            sink,
            board,
            cache,
            directory,
            debounce,
        }
    }

    /// Evaluate one broadcast against the agents the mention stage did not
    /// already wake.
    pub async fn observe(&self, event: &BroadcastEvent, mention_woken: &HashSet<String>) {
        if !contains_domain_keyword(&event.content) {
            return;
        }

        let candidates: Vec<&AgentEndpoint> = self
            .roster
            .iter()
            .filter(|a| {
                a.id != event.author
                    && !mention_woken.contains(&a.id)
                    // Peek only: the window is consumed at submission time.
                    && self.debounce.would_wake(&a.id)
            })
            .collect();
        if candidates.is_empty() {
            return;
        }

        let channel_name = self.directory.name_for(&event.channel_id).await;
        let Some(messages) = self.cache.recent(&self.board, &channel_name).await else {
            log::debug!("no context for #{}, skipping observation", channel_name);
            return;
        };
        if messages.is_empty() {
            return;
        }

        let prompt = build_judgment_prompt(&candidates, &channel_name, &format_context(&messages));
        let reply = match self.judge.complete(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("judgment call failed, waking nobody: {}", e);
                return;
            }
        };
        let Some(verdict) = parse_verdict(&reply) else {
            log::warn!("unparseable judgment reply, waking nobody");
            return;
        };

        for id in &verdict.wake {
            if mention_woken.contains(id) {
                continue;
            }
            let Some(agent) = self.roster.iter().find(|a| &a.id == id) else {
                continue;
            };
            // Live re-check: time passed during the judgment call.
            if !self.debounce.would_wake(id) {
                continue;
            }
            log::info!(
                "observer waking \"{}\" for #{} ({})",
                id,
                channel_name,
                verdict.reason.as_deref().unwrap_or("no reason given")
            );
            let text = observer_wake_text(&agent.id, &event.author, &channel_name, &event.content);
            self.sink.wake(&agent.id, &text).await;
        }
    }
}

fn contains_domain_keyword(text: &str) -> bool {
    let lower = text.to_lowercase();
    DOMAIN_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn build_judgment_prompt(
    candidates: &[&AgentEndpoint],
    channel_name: &str,
    context_block: &str,
) -> String {
    let mut roster_lines = String::new();
    for agent in candidates {
        let role = if agent.role.is_empty() {
            "no role description"
        } else {
            &agent.role
        };
        roster_lines.push_str(&format!("- {} ({}, {})\n", agent.id, agent.name(), role));
    }
    format!(
        "You triage a team channel and decide which agents, if any, should be \
         woken to look at new activity. Wake an agent only when the \
         conversation clearly needs their role; when in doubt, wake nobody.\n\n\
         Agents available:\n{roster_lines}\n\
         Recent conversation in #{channel_name}:\n{context_block}\n\n\
         Reply with exactly one JSON object of the form \
         {{\"wake\": [\"agent-id\", ...], \"reason\": \"...\"}} and nothing else."
    )
}

/// Lower-urgency phrasing: the agent is explicitly free to do nothing.
fn observer_wake_text(agent_id: &str, author: &str, channel_name: &str, content: &str) -> String {
    let excerpt: String = content.chars().take(300).collect();
    format!(
        "FYI @{}: recent activity in #{} may be relevant to you. {} wrote: \"{}\". \
         You were not mentioned directly; feel free to ignore this if it does not concern you.",
        agent_id, channel_name, author, excerpt
    )
}

fn parse_verdict(reply: &str) -> Option<JudgeVerdict> {
    let json = extract_json_object(reply)?;
    serde_json::from_str(json).ok()
}

/// First balanced JSON object in the text, tolerating prose around it.
/// String contents are honored so braces inside values do not confuse the scan.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::RecordingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedJudge {
        reply: Result<String, String>,
        calls: AtomicUsize,
    }

    impl ScriptedJudge {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err("service unavailable".to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JudgeBackend for ScriptedJudge {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(r) => Ok(r.clone()),
                Err(e) => Err(anyhow::anyhow!(e.clone())),
            }
        }
    }

    fn roster(ids: &[(&str, &str)]) -> Vec<AgentEndpoint> {
        ids.iter()
            .map(|(id, role)| AgentEndpoint {
                id: id.to_string(),
                display_name: String::new(),
                role: role.to_string(),
                url: format!("ws://{}:1", id),
                token: "t".to_string(),
            })
            .collect()
    }

    async fn observer(
        judge: Arc<ScriptedJudge>,
        sink: Arc<RecordingSink>,
    ) -> RelevanceObserver {
        let cache = Arc::new(ContextCache::default());
        cache
            .insert(
                "c1",
                vec![serde_json::from_value(serde_json::json!({
                    "author": "po",
                    "content": "the deploy pipeline is failing"
                }))
                .unwrap()],
            )
            .await;
        RelevanceObserver::new(
            roster(&[("dev", "developer"), ("qa", "tester"), ("ops", "operations")]),
            judge,
            sink,
            BoardClient::new("http://127.0.0.1:9"),
            cache,
            Arc::new(ChannelDirectory::default()),
            Arc::new(WakeDebounce::new(Duration::from_secs(30))),
        )
    }

    fn event(content: &str) -> BroadcastEvent {
        BroadcastEvent {
            author: "po".to_string(),
            content: content.to_string(),
            channel_id: "c1".to_string(),
            mentions: vec![],
        }
    }

    #[tokio::test]
    async fn no_domain_keyword_means_no_judge_call() {
        let judge = Arc::new(ScriptedJudge::replying(r#"{"wake":["dev"]}"#));
        let sink = Arc::new(RecordingSink::default());
        let obs = observer(judge.clone(), sink.clone()).await;
        obs.observe(&event("good morning everyone, lovely weather"), &HashSet::new())
            .await;
        assert_eq!(judge.call_count(), 0);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mention_woken_agents_are_not_rewoken() {
        let judge = Arc::new(ScriptedJudge::replying(
            r#"Sure! {"wake": ["dev", "qa"], "reason": "deploy broke"}"#,
        ));
        let sink = Arc::new(RecordingSink::default());
        let obs = observer(judge.clone(), sink.clone()).await;
        let woken: HashSet<String> = ["dev".to_string()].into();
        obs.observe(&event("the deploy is failing again"), &woken).await;
        assert_eq!(judge.call_count(), 1);
        assert_eq!(sink.woken_ids(), vec!["qa"]);
    }

    #[tokio::test]
    async fn unknown_ids_in_verdict_are_ignored() {
        let judge = Arc::new(ScriptedJudge::replying(r#"{"wake":["intern","ops"]}"#));
        let sink = Arc::new(RecordingSink::default());
        let obs = observer(judge, sink.clone()).await;
        obs.observe(&event("release build error"), &HashSet::new()).await;
        assert_eq!(sink.woken_ids(), vec!["ops"]);
    }

    #[tokio::test]
    async fn judge_failure_wakes_nobody() {
        let judge = Arc::new(ScriptedJudge::failing());
        let sink = Arc::new(RecordingSink::default());
        let obs = observer(judge.clone(), sink.clone()).await;
        obs.observe(&event("incident in prod"), &HashSet::new()).await;
        assert_eq!(judge.call_count(), 1);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unparseable_reply_wakes_nobody() {
        let judge = Arc::new(ScriptedJudge::replying("I think dev should look at this."));
        let sink = Arc::new(RecordingSink::default());
        let obs = observer(judge, sink.clone()).await;
        obs.observe(&event("test failure on main"), &HashSet::new()).await;
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn extract_json_object_tolerates_surrounding_prose() {
        let text = r#"Here you go: {"wake": ["dev"], "reason": "see {braces} in \"strings\""} hope that helps"#;
        let json = extract_json_object(text).unwrap();
        let verdict: JudgeVerdict = serde_json::from_str(json).unwrap();
        assert_eq!(verdict.wake, vec!["dev"]);

        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{ unbalanced").is_none());
    }

    #[test]
    fn keyword_filter_is_case_insensitive() {
        assert!(contains_domain_keyword("URGENT: Deploy failed"));
        assert!(!contains_domain_keyword("lunch at noon?"));
    }
}
