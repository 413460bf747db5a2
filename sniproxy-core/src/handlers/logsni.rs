//! logsni (no config): logs the parsed ClientHello and lets the chain
//! continue. Grounded on the `tracing::info!` logging idiom used throughout
//! `connection.rs::process_connection`.

use crate::context::Context;
use crate::handler::{ChainResult, ConfigError, Handler};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub struct LogSni;

#[async_trait]
impl Handler for LogSni {
    fn name(&self) -> &str {
        "logsni"
    }

    async fn on_connect(&self, ctx: &mut Context) -> ChainResult {
        info!(
            client = %ctx.client_addr,
            sni = ?ctx.hello.sni,
            alpn = ?ctx.hello.alpn,
            "admitting connection"
        );
        ChainResult::Continue
    }
}

pub fn build(_config: &Value) -> Result<Arc<dyn Handler>, ConfigError> {
    Ok(Arc::new(LogSni))
}
