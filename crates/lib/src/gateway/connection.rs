//! Per-agent gateway connection: handshake orchestration, request/response
//! correlation, keepalive, and reconnect with backoff.
//!
//! One task owns each connection's lifecycle (Disconnected -> Connecting ->
//! Authenticated). A dedicated reader task hands inbound frames to the
//! correlation table and forwards events over a channel, so no callback ever
//! touches the socket from two places. Wakes requested while not authenticated
//! land in a one-slot queue where the most recent text wins.

use crate::config::AgentEndpoint;
use crate::device::{build_auth_payload, DeviceIdentity};
use crate::gateway::protocol::{
    parse_frame, ConnectAck, ConnectAuth, ConnectClient, ConnectDevice, ConnectParams, Frame,
    WakeParams, WsEvent, WsRequest, WsResponse, PROTOCOL_VERSION,
};
use crate::tokens::DeviceTokenStore;
use anyhow::{anyhow, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub(crate) const BACKOFF_MIN: Duration = Duration::from_secs(1);
pub(crate) const BACKOFF_MAX: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// How long to wait for a `connect.challenge` before sending a nonce-less connect.
const CONNECT_GRACE: Duration = Duration::from_millis(750);
const PAIRING_GRACE: Duration = Duration::from_secs(2);
const STALE_TOKEN_GRACE: Duration = Duration::from_secs(1);
/// Bounded replacement for the historically unbounded not-paired retry loop.
const PAIRING_RETRY_LIMIT: u32 = 3;

const CLIENT_ID: &str = "gateway-client";
const CLIENT_MODE: &str = "backend";
const CLIENT_ROLE: &str = "operator";
const CLIENT_SCOPES: &[&str] = &["operator.admin"];

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<WsResponse>>>>;

/// Handle to a per-agent connection task. Dropping it tears the task down.
pub struct Connection {
    agent_id: String,
    cmd_tx: mpsc::Sender<ConnCmd>,
    task: JoinHandle<()>,
}

#[derive(Debug)]
enum ConnCmd {
    Wake(String),
}

impl Connection {
    /// Spawn the connection task for one agent endpoint. It dials immediately
    /// and keeps reconnecting for the life of the handle.
    pub fn spawn(
        endpoint: AgentEndpoint,
        identity: Arc<DeviceIdentity>,
        tokens: Arc<DeviceTokenStore>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let agent_id = endpoint.id.clone();
        let task = tokio::spawn(run(endpoint, identity, tokens, cmd_rx));
        Self {
            agent_id,
            cmd_tx,
            task,
        }
    }

    /// Submit a wake. Fire-and-forget: delivery results are logged by the
    /// connection task, never surfaced to the dispatch pipeline.
    pub async fn wake(&self, text: String) {
        if self.cmd_tx.send(ConnCmd::Wake(text)).await.is_err() {
            log::warn!(
                "connection task for \"{}\" is gone, dropping wake",
                self.agent_id
            );
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Next reconnect delay: doubles per consecutive failure, capped.
pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_MAX)
}

async fn run(
    endpoint: AgentEndpoint,
    identity: Arc<DeviceIdentity>,
    tokens: Arc<DeviceTokenStore>,
    mut cmd_rx: mpsc::Receiver<ConnCmd>,
) {
    let mut backoff = BACKOFF_MIN;
    let mut queued: Option<String> = None;
    loop {
        // Connecting: run the handshake while still absorbing wake requests
        // into the one-slot queue.
        let established = {
            let attempt = establish(&endpoint, &identity, &tokens);
            tokio::pin!(attempt);
            loop {
                tokio::select! {
                    res = &mut attempt => break res,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ConnCmd::Wake(text)) => queued = Some(text),
                        None => return,
                    },
                }
            }
        };

        match established {
            Ok(mut session) => {
                backoff = BACKOFF_MIN;
                log::info!("authenticated with \"{}\" gateway", endpoint.id);
                if let Some(text) = queued.take() {
                    deliver(&mut session, &endpoint.id, &text).await;
                }
                let shutdown = drive(&mut session, &mut cmd_rx, &endpoint.id).await;
                session.close().await;
                if shutdown {
                    return;
                }
            }
            Err(e) => {
                log::warn!("connect to \"{}\" failed: {}", endpoint.id, e);
            }
        }

        // Disconnected: wait out the backoff, still absorbing wake requests.
        let deadline = tokio::time::Instant::now() + backoff;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Wake(text)) => queued = Some(text),
                    None => return,
                },
            }
        }
        backoff = next_backoff(backoff);
    }
}

/// Authenticated steady state. Returns true when the handle was dropped and
/// the task should exit, false when the transport closed.
async fn drive(
    session: &mut Session,
    cmd_rx: &mut mpsc::Receiver<ConnCmd>,
    agent_id: &str,
) -> bool {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Wake(text)) => deliver(session, agent_id, &text).await,
                None => return true,
            },
            ev = session.events_rx.recv() => match ev {
                Some(ev) => log::debug!("\"{}\" event: {}", agent_id, ev.event),
                None => {
                    log::info!("connection to \"{}\" closed", agent_id);
                    return false;
                }
            },
            _ = keepalive.tick() => {
                if session.sink.send(Message::Ping(Vec::new())).await.is_err() {
                    log::info!("connection to \"{}\" closed (keepalive)", agent_id);
                    return false;
                }
            }
        }
    }
}

async fn deliver(session: &mut Session, agent_id: &str, text: &str) {
    match session.wake(text).await {
        Ok(()) => log::info!("wake acknowledged by \"{}\"", agent_id),
        Err(e) => log::warn!("wake delivery to \"{}\" failed: {}", agent_id, e),
    }
}

/// One-shot pairing sweep entry: establish a single authenticated session
/// (running the full not-paired/stale-token ladder) and close it.
pub async fn pair(
    endpoint: &AgentEndpoint,
    identity: &DeviceIdentity,
    tokens: &DeviceTokenStore,
) -> Result<()> {
    let session = establish(endpoint, identity, tokens).await?;
    session.close().await;
    Ok(())
}

enum Handshake {
    Ok(ConnectAck),
    NotPaired,
    StaleToken,
}

/// Dial and authenticate, looping locally on the recoverable handshake
/// outcomes (not-paired approval wait, stale device token fallback), bounded
/// by PAIRING_RETRY_LIMIT.
async fn establish(
    endpoint: &AgentEndpoint,
    identity: &DeviceIdentity,
    tokens: &DeviceTokenStore,
) -> Result<Session> {
    for attempt in 1..=PAIRING_RETRY_LIMIT {
        let mut session = dial(&endpoint.url).await?;
        match handshake(&mut session, endpoint, identity, tokens).await? {
            Handshake::Ok(ack) => {
                if let Some(token) = ack.auth.and_then(|a| a.device_token) {
                    tokens.put(&endpoint.id, &token).await;
                }
                return Ok(session);
            }
            Handshake::NotPaired => {
                log::info!(
                    "pairing requested for \"{}\", waiting for approval (attempt {}/{})",
                    endpoint.id,
                    attempt,
                    PAIRING_RETRY_LIMIT
                );
                session.close().await;
                tokio::time::sleep(PAIRING_GRACE).await;
            }
            Handshake::StaleToken => {
                log::info!(
                    "stale device token for \"{}\", retrying with shared secret",
                    endpoint.id
                );
                tokens.remove(&endpoint.id).await;
                session.close().await;
                tokio::time::sleep(STALE_TOKEN_GRACE).await;
            }
        }
    }
    Err(anyhow!(
        "pairing with \"{}\" not approved after {} attempts",
        endpoint.id,
        PAIRING_RETRY_LIMIT
    ))
}

/// Run the connect exchange on a fresh transport. The gateway may challenge
/// first (nonce goes into the signed payload) or stay silent, in which case a
/// nonce-less connect goes out after the grace delay.
async fn handshake(
    session: &mut Session,
    endpoint: &AgentEndpoint,
    identity: &DeviceIdentity,
    tokens: &DeviceTokenStore,
) -> Result<Handshake> {
    // The gateway may emit unrelated events (hello, presence) ahead of the
    // challenge; keep draining until a nonce arrives or the grace runs out.
    let deadline = tokio::time::Instant::now() + CONNECT_GRACE;
    let nonce = loop {
        match tokio::time::timeout_at(deadline, session.events_rx.recv()).await {
            Ok(Some(ev)) => {
                if let Some(n) = ev.challenge_nonce() {
                    break Some(n);
                }
            }
            Ok(None) => return Err(anyhow!("transport closed before handshake")),
            Err(_) => break None,
        }
    };

    let stored_token = tokens.get(&endpoint.id).await;
    let using_stored = stored_token.is_some();
    let auth_token = stored_token.unwrap_or_else(|| endpoint.token.clone());

    let params = build_connect_params(identity, &auth_token, nonce.as_deref())?;
    let res = session
        .request("connect", serde_json::to_value(params)?)
        .await?;

    if let Some(err) = res.error {
        if err.is_not_paired() {
            return Ok(Handshake::NotPaired);
        }
        if using_stored && err.is_stale_token() {
            return Ok(Handshake::StaleToken);
        }
        return Err(anyhow!(
            "connect rejected for \"{}\": {}",
            endpoint.id,
            err.describe()
        ));
    }

    let ack = res
        .payload
        .and_then(|p| serde_json::from_value(p).ok())
        .unwrap_or_default();
    Ok(Handshake::Ok(ack))
}

fn build_connect_params(
    identity: &DeviceIdentity,
    token: &str,
    nonce: Option<&str>,
) -> Result<ConnectParams> {
    let scopes: Vec<String> = CLIENT_SCOPES.iter().map(|s| s.to_string()).collect();
    let signed_at = chrono::Utc::now().timestamp_millis() as u64;
    let payload = build_auth_payload(
        &identity.device_id,
        CLIENT_ID,
        CLIENT_MODE,
        CLIENT_ROLE,
        &scopes,
        signed_at,
        token,
        nonce,
    );
    let signature = identity.sign(&payload)?;
    Ok(ConnectParams {
        min_protocol: PROTOCOL_VERSION,
        max_protocol: PROTOCOL_VERSION,
        client: ConnectClient {
            id: CLIENT_ID.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: CLIENT_MODE.to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        },
        caps: vec![],
        auth: ConnectAuth {
            token: token.to_string(),
        },
        role: CLIENT_ROLE.to_string(),
        scopes,
        device: ConnectDevice {
            id: identity.device_id.clone(),
            public_key: identity.public_key_wire()?,
            signature,
            signed_at,
            nonce: nonce.map(|n| n.to_string()),
        },
    })
}

/// One live transport: write half, correlation table, and the event stream
/// fed by the reader task.
struct Session {
    sink: WsSink,
    pending: Pending,
    events_rx: mpsc::Receiver<WsEvent>,
    reader: JoinHandle<()>,
}

async fn dial(url: &str) -> Result<Session> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| anyhow!("dial {}: {}", url, e))?;
    let (sink, mut stream) = ws.split();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let (events_tx, events_rx) = mpsc::channel(8);
    let reader_pending = pending.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let Ok(msg) = frame else { break };
            let Message::Text(text) = msg else { continue };
            match parse_frame(&text) {
                Some(Frame::Response(res)) => {
                    let waiter = reader_pending.lock().expect("pending lock").remove(&res.id);
                    if let Some(tx) = waiter {
                        let _ = tx.send(res);
                    }
                }
                Some(Frame::Event(ev)) => {
                    if events_tx.send(ev).await.is_err() {
                        break;
                    }
                }
                None => {}
            }
        }
        // Transport gone: dropping the waiters resolves every pending caller
        // with a closed error.
        reader_pending.lock().expect("pending lock").clear();
    });
    Ok(Session {
        sink,
        pending,
        events_rx,
        reader,
    })
}

impl Session {
    /// Send a request and await its correlated response, bounded by
    /// REQUEST_TIMEOUT. Never leaves the caller hanging: timeouts and closed
    /// transports resolve as errors.
    async fn request(&mut self, method: &str, params: serde_json::Value) -> Result<WsResponse> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(id.clone(), tx);
        let frame = serde_json::to_string(&WsRequest::new(id.clone(), method, params))?;
        if let Err(e) = self.sink.send(Message::Text(frame)).await {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(anyhow!("send {}: {}", method, e));
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(res)) => Ok(res),
            Ok(Err(_)) => Err(anyhow!("connection closed")),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&id);
                Err(anyhow!("{} request timed out", method))
            }
        }
    }

    async fn wake(&mut self, text: &str) -> Result<()> {
        let res = self
            .request("wake", serde_json::to_value(WakeParams::now(text))?)
            .await?;
        if let Some(err) = res.error {
            return Err(anyhow!("wake rejected: {}", err.describe()));
        }
        Ok(())
    }

    async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut d = BACKOFF_MIN;
        let mut seen = vec![d];
        for _ in 0..6 {
            d = next_backoff(d);
            seen.push(d);
        }
        assert_eq!(
            seen.iter().map(|d| d.as_secs()).collect::<Vec<_>>(),
            vec![1, 2, 4, 8, 16, 30, 30]
        );
        // Non-decreasing by construction.
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }
}
