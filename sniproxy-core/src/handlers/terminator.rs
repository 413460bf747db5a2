//! terminator (C9): contract only.
//!
//! A future terminator would run a local QUIC server and have this handler
//! hand the connection off to it instead of `ctx["backend"]` naming a remote
//! address — `quinn::Endpoint` is already a workspace dependency for exactly
//! that purpose. Styled directly on `quic_handler.rs::QuicHandler`'s
//! "future work" placeholder: same doc density, same
//! not-yet-implemented-`Drop` shape.

use crate::context::Context;
use crate::handler::{ChainResult, ConfigError, Handler};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct Terminator;

#[async_trait]
impl Handler for Terminator {
    fn name(&self) -> &str {
        "terminator"
    }

    async fn on_connect(&self, _ctx: &mut Context) -> ChainResult {
        ChainResult::Drop("terminator not configured in this build".to_string())
    }
}

pub fn build(_config: &Value) -> Result<Arc<dyn Handler>, ConfigError> {
    Ok(Arc::new(Terminator))
}
