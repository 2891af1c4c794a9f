//! Agent gateway client: wire protocol, per-agent connection state machine,
//! and the connection manager behind the wake dispatch pipeline.

pub mod connection;
pub mod manager;
pub mod protocol;

pub use connection::{pair, Connection};
pub use manager::{ConnectionManager, WakeSink};
