//! Judgment service client.

pub mod judge;

pub use judge::{JudgeClient, JudgeError};
