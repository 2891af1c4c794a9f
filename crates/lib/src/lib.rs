//! Roust core library: device identity, authenticated agent gateway
//! connections, board watching, and the two-stage wake dispatch pipeline
//! used by the `roust` binary.

pub mod board;
pub mod config;
pub mod context;
pub mod debounce;
pub mod device;
pub mod dispatch;
pub mod gateway;
pub mod llm;
pub mod router;
pub mod tokens;
