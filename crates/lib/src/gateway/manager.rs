//! Connection manager: the single place wake requests are submitted.
//!
//! Owns the agent-id -> Connection map, applies the debounce policy before
//! any connection work, and eagerly dials every configured agent at startup
//! so the first real wake pays no connect latency.

use crate::config::AgentEndpoint;
use crate::debounce::WakeDebounce;
use crate::device::DeviceIdentity;
use crate::gateway::connection::Connection;
use crate::tokens::DeviceTokenStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Seam between the dispatch stages and delivery. Both the mention dispatcher
/// and the observer submit through this; tests substitute a recording fake.
#[async_trait]
pub trait WakeSink: Send + Sync {
    async fn wake(&self, agent_id: &str, text: &str);
}

pub struct ConnectionManager {
    roster: HashMap<String, AgentEndpoint>,
    identity: Arc<DeviceIdentity>,
    tokens: Arc<DeviceTokenStore>,
    debounce: Arc<WakeDebounce>,
    connections: Mutex<HashMap<String, Connection>>,
    /// Agents already warned about once (no endpoint configured).
    warned: std::sync::Mutex<HashSet<String>>,
}

impl ConnectionManager {
    pub fn new(
        roster: Vec<AgentEndpoint>,
        identity: Arc<DeviceIdentity>,
        tokens: Arc<DeviceTokenStore>,
        debounce: Arc<WakeDebounce>,
    ) -> Self {
        let roster = roster.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            roster,
            identity,
            tokens,
            debounce,
            connections: Mutex::new(HashMap::new()),
            warned: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn debounce(&self) -> &WakeDebounce {
        &self.debounce
    }

    /// Eagerly spawn a connection per configured agent.
    pub async fn connect_all(&self) {
        let mut conns = self.connections.lock().await;
        for (id, endpoint) in &self.roster {
            conns.entry(id.clone()).or_insert_with(|| {
                Connection::spawn(
                    endpoint.clone(),
                    self.identity.clone(),
                    self.tokens.clone(),
                )
            });
        }
        log::info!("connecting to {} agent gateway(s)", conns.len());
    }

    fn warn_once(&self, agent_id: &str) {
        let mut warned = self.warned.lock().expect("warned lock");
        if warned.insert(agent_id.to_string()) {
            log::warn!(
                "no gateway configured for \"{}\", it will never be woken",
                agent_id
            );
        }
    }
}

#[async_trait]
impl WakeSink for ConnectionManager {
    async fn wake(&self, agent_id: &str, text: &str) {
        let Some(endpoint) = self.roster.get(agent_id) else {
            self.warn_once(agent_id);
            return;
        };

        // Debounce gates wake frequency at request time, before any
        // connection or delivery work.
        if !self.debounce.should_wake(agent_id) {
            log::debug!(
                "debounced wake for \"{}\" (woken <{}s ago)",
                agent_id,
                self.debounce.window().as_secs()
            );
            return;
        }

        let mut conns = self.connections.lock().await;
        let conn = conns.entry(agent_id.to_string()).or_insert_with(|| {
            Connection::spawn(
                endpoint.clone(),
                self.identity.clone(),
                self.tokens.clone(),
            )
        });
        conn.wake(text.to_string()).await;
    }
}
