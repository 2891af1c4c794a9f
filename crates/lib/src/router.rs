//! Runtime wiring: load identity and roster, connect the gateways, watch the
//! board, and feed each broadcast through the dispatch pipeline.

use crate::board::{spawn_watcher, BoardClient, ChannelDirectory};
use crate::config::{
    self, identity_dir, load_roster, resolve_board_url, resolve_board_ws_url,
    resolve_judge_api_key, Config,
};
use crate::context::ContextCache;
use crate::debounce::WakeDebounce;
use crate::device::DeviceIdentity;
use crate::dispatch::{MentionDispatcher, RelevanceObserver};
use crate::gateway::{ConnectionManager, WakeSink};
use crate::llm::JudgeClient;
use crate::tokens::DeviceTokenStore;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const BROADCAST_QUEUE: usize = 64;

/// Run the router until ctrl-c.
pub async fn run_router(config: Config, config_path: &Path) -> Result<()> {
    let state_dir = identity_dir(config_path);
    let identity = Arc::new(DeviceIdentity::load_or_generate(
        &state_dir.join("device.json"),
    )?);
    log::info!("device identity {}", identity.device_id);
    let tokens = Arc::new(DeviceTokenStore::load(state_dir.join("device-tokens.json")).await);

    let roster = load_roster(&config, config_path)?;
    if roster.is_empty() {
        log::warn!("no agents configured, nothing will ever be woken");
    }

    let debounce = Arc::new(WakeDebounce::new(Duration::from_millis(
        config.wake.debounce_ms,
    )));
    let manager = Arc::new(ConnectionManager::new(
        roster.clone(),
        identity,
        tokens,
        debounce.clone(),
    ));
    manager.connect_all().await;
    let sink: Arc<dyn WakeSink> = manager;

    let board = BoardClient::new(&resolve_board_url(&config));
    let directory = Arc::new(ChannelDirectory::default());
    let cache = Arc::new(ContextCache::default());

    let (tx, mut rx) = mpsc::channel(BROADCAST_QUEUE);
    let watcher = spawn_watcher(
        board.clone(),
        resolve_board_ws_url(&config),
        directory.clone(),
        tx,
    );

    let mentions = MentionDispatcher::new(
        roster.clone(),
        sink.clone(),
        board.clone(),
        cache.clone(),
        directory.clone(),
    );
    let observer = build_observer(&config, roster, sink, board, cache, directory, debounce);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    // Watcher exits only when this receiver drops, so a
                    // closed channel here means its task died.
                    anyhow::bail!("board watcher stopped unexpectedly");
                };
                let woken = mentions.dispatch(&event).await;
                if let Some(observer) = &observer {
                    observer.observe(&event, &woken).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                watcher.abort();
                return Ok(());
            }
        }
    }
}

/// The observer runs only when enabled and an API key resolves.
fn build_observer(
    config: &Config,
    roster: Vec<config::AgentEndpoint>,
    sink: Arc<dyn WakeSink>,
    board: BoardClient,
    cache: Arc<ContextCache>,
    directory: Arc<ChannelDirectory>,
    debounce: Arc<WakeDebounce>,
) -> Option<RelevanceObserver> {
    if !config.observer.enabled {
        log::info!("relevance observer disabled by config");
        return None;
    }
    let Some(api_key) = resolve_judge_api_key(config) else {
        log::info!("no judge API key configured, relevance observer disabled");
        return None;
    };
    let judge = JudgeClient::new(
        config.observer.base_url.clone(),
        api_key,
        config.observer.model.clone(),
        config.observer.max_tokens,
        Duration::from_millis(config.observer.timeout_ms),
    );
    log::info!("relevance observer enabled (model {})", judge.model());
    Some(RelevanceObserver::new(
        roster,
        Arc::new(judge),
        sink,
        board,
        cache,
        directory,
        debounce,
    ))
}
