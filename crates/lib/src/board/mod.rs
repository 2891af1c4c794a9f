//! Board integration: REST client for channels/messages and the push
//! subscription watcher that normalizes broadcast events.

pub mod client;
pub mod watcher;

pub use client::{BoardClient, BoardError, BoardMessage, ChannelInfo};
pub use watcher::{spawn_watcher, BroadcastEvent, ChannelDirectory};
