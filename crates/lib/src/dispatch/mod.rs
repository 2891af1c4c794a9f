//! Two-stage wake dispatch: explicit @-mention routing, then LLM-judged
//! relevance observation for the rest of the roster.

pub mod mention;
pub mod observer;

pub use mention::MentionDispatcher;
pub use observer::{JudgeBackend, RelevanceObserver};

#[cfg(test)]
pub(crate) mod testing {
    use crate::gateway::WakeSink;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every wake submission for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub calls: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSink {
        pub fn woken_ids(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl WakeSink for RecordingSink {
        async fn wake(&self, agent_id: &str, text: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((agent_id.to_string(), text.to_string()));
        }
    }
}
