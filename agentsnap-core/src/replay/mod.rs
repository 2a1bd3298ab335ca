//! Replay of recorded snapshot cases
//!
//! During replay the agent's LLM client is swapped for a
//! [`ReplayLlmClient`] that serves recorded responses in loop order, and a
//! [`ReplayHook`] collects the live tool calls for verification.
//!
//! # Architecture
//!
//! Both participants share one [`RunSession`](crate::session::RunSession)
//! holding the loop pointer and the run's single failure slot. The pointer
//! starts at 0 and moves past a loop only once its response has been fully
//! delivered; for streamed responses that is when the chunk stream is
//! exhausted.

mod client;
mod hook;

pub use client::{ReplayChunkStream, ReplayLlmClient};
pub use hook::ReplayHook;

use std::sync::Arc;

use crate::normalize::Normalizer;
use crate::verify::VerificationConfig;

/// Effective configuration of one replay run
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub normalizer: Arc<Normalizer>,
    pub verification: VerificationConfig,
    /// Live artifacts replace diverging records instead of failing
    pub update_snapshots: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            normalizer: Arc::new(Normalizer::default()),
            verification: VerificationConfig::default(),
            update_snapshots: false,
        }
    }
}

#[cfg(test)]
mod tests;
