//! Rate limiter (C6): rejects new connections once the session table is at
//! capacity (spec.md §4.4).
//!
//! New code, grounded on `connection_pool.rs::PoolMetrics`'s
//! read-a-shared-gauge-and-compare shape — here the gauge is
//! `ctx["_session_count"]`, populated by the proxy loop before chain
//! dispatch, not tracked by this handler itself.

use crate::context::Context;
use crate::error::HandlerError;
use crate::handler::{ChainResult, ConfigError, Handler};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct RateLimitConfig {
    max_parallel_connections: i64,
}

pub struct RateLimiter {
    max_parallel_connections: u64,
}

#[async_trait]
impl Handler for RateLimiter {
    fn name(&self) -> &str {
        "ratelimit-global"
    }

    async fn on_connect(&self, ctx: &mut Context) -> ChainResult {
        let current = ctx.scratch.get_u64("_session_count").unwrap_or(0);
        if current >= self.max_parallel_connections {
            return ChainResult::Drop(
                HandlerError::RateLimited {
                    current,
                    max: self.max_parallel_connections,
                }
                .to_string(),
            );
        }
        ChainResult::Continue
    }
}

pub fn build(config: &Value) -> Result<Arc<dyn Handler>, ConfigError> {
    let cfg: RateLimitConfig = serde_json::from_value(config.clone())
        .map_err(|e| ConfigError(format!("ratelimit-global: {e}")))?;

    if cfg.max_parallel_connections <= 0 {
        return Err(ConfigError(
            "ratelimit-global: max_parallel_connections must be > 0".to_string(),
        ));
    }

    Ok(Arc::new(RateLimiter {
        max_parallel_connections: cfg.max_parallel_connections as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::ClientHelloInfo;

    async fn ctx_with_session_count(n: u64) -> Context {
        let sock = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Context::new(
            "127.0.0.1:9000".parse().unwrap(),
            vec![],
            ClientHelloInfo {
                sni: None,
                alpn: vec![],
                scid: vec![],
                dcid: vec![],
            },
            n as usize,
            sock,
            Arc::new(crate::handler::Chain::new(vec![])),
        )
    }

    #[tokio::test]
    async fn allows_below_limit() {
        let handler = build(&serde_json::json!({ "max_parallel_connections": 10 })).unwrap();
        let mut ctx = ctx_with_session_count(5).await;
        assert!(matches!(handler.on_connect(&mut ctx).await, ChainResult::Continue));
    }

    #[tokio::test]
    async fn drops_at_limit() {
        let handler = build(&serde_json::json!({ "max_parallel_connections": 10 })).unwrap();
        let mut ctx = ctx_with_session_count(10).await;
        assert!(matches!(handler.on_connect(&mut ctx).await, ChainResult::Drop(_)));
    }

    #[test]
    fn rejects_zero_limit() {
        assert!(build(&serde_json::json!({ "max_parallel_connections": 0 })).is_err());
    }
}
