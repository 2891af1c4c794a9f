//! Wake debounce: minimum spacing between successive wakes to one agent.
//!
//! The stamp is taken when a wake is *requested*, not when it is delivered;
//! a wake queued behind a slow reconnect still closes the window for later
//! requests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-agent wake rate limiter.
pub struct WakeDebounce {
    window: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl WakeDebounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check-and-consume: true when a wake may be issued now, stamping the
    /// agent so the window closes immediately.
    pub fn should_wake(&self, agent_id: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().expect("debounce lock");
        match last.get(agent_id) {
            Some(prev) if now.duration_since(*prev) < self.window => false,
            _ => {
                last.insert(agent_id.to_string(), now);
                true
            }
        }
    }

    /// Non-consuming peek used for observer candidate filtering.
    pub fn would_wake(&self, agent_id: &str) -> bool {
        let last = self.last.lock().expect("debounce lock");
        match last.get(agent_id) {
            Some(prev) => Instant::now().duration_since(*prev) >= self.window,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_wake_inside_window_is_dropped() {
        let d = WakeDebounce::new(Duration::from_millis(40));
        assert!(d.should_wake("dev"));
        assert!(!d.should_wake("dev"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(d.should_wake("dev"));
    }

    #[test]
    fn peek_does_not_consume() {
        let d = WakeDebounce::new(Duration::from_millis(40));
        assert!(d.would_wake("qa"));
        assert!(d.would_wake("qa"));
        assert!(d.should_wake("qa"));
        assert!(!d.would_wake("qa"));
    }

    #[test]
    fn agents_are_independent() {
        let d = WakeDebounce::new(Duration::from_secs(30));
        assert!(d.should_wake("dev"));
        assert!(d.should_wake("qa"));
        assert!(!d.should_wake("dev"));
    }
}
