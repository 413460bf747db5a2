//! Router handlers (C5a simple-router, C5b sni-router): pick a backend and
//! write it to `ctx["backend"]` (spec.md §4.4).
//!
//! New code — grounded on `sniproxy_config::matches_allowlist_pattern`'s
//! config-driven string-matching style for the sni-router's route lookup,
//! and on the round-robin selection implicit in `connection_pool.rs`'s
//! pool-of-connections indexing for both routers' backend rotation.

use crate::context::Context;
use crate::error::HandlerError;
use crate::handler::{ChainResult, ConfigError, Handler};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn next_round_robin(counter: &AtomicUsize, len: usize) -> usize {
    counter.fetch_add(1, Ordering::Relaxed) % len
}

#[derive(Debug, Deserialize)]
struct SimpleRouterConfig {
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    backends: Option<Vec<String>>,
}

pub struct SimpleRouter {
    backends: Vec<String>,
    counter: AtomicUsize,
}

#[async_trait]
impl Handler for SimpleRouter {
    fn name(&self) -> &str {
        "simple-router"
    }

    async fn on_connect(&self, ctx: &mut Context) -> ChainResult {
        let idx = next_round_robin(&self.counter, self.backends.len());
        ctx.scratch.set("backend", self.backends[idx].clone());
        ChainResult::Continue
    }
}

pub fn build_simple_router(config: &Value) -> Result<Arc<dyn Handler>, ConfigError> {
    let cfg: SimpleRouterConfig = serde_json::from_value(config.clone())
        .map_err(|e| ConfigError(format!("simple-router: {e}")))?;

    let backends = match (cfg.backend, cfg.backends) {
        (Some(_), Some(_)) => {
            return Err(ConfigError(
                "simple-router: backend and backends are mutually exclusive".to_string(),
            ))
        }
        (Some(b), None) => vec![b],
        (None, Some(bs)) if !bs.is_empty() => bs,
        (None, Some(_)) => return Err(ConfigError("simple-router: backends is empty".to_string())),
        (None, None) => match std::env::var("HYPROXY_BACKEND") {
            Ok(b) if !b.is_empty() => vec![b],
            _ => return Err(ConfigError("simple-router: no backend configured".to_string())),
        },
    };

    Ok(Arc::new(SimpleRouter {
        backends,
        counter: AtomicUsize::new(0),
    }))
}

#[derive(Debug, Deserialize)]
struct SniRouterConfig {
    routes: HashMap<String, BackendsOrBackend>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BackendsOrBackend {
    One(String),
    Many(Vec<String>),
}

impl BackendsOrBackend {
    fn into_vec(self) -> Vec<String> {
        match self {
            BackendsOrBackend::One(s) => vec![s],
            BackendsOrBackend::Many(v) => v,
        }
    }
}

struct Route {
    backends: Vec<String>,
    counter: AtomicUsize,
}

pub struct SniRouter {
    routes: HashMap<String, Route>,
}

#[async_trait]
impl Handler for SniRouter {
    fn name(&self) -> &str {
        "sni-router"
    }

    async fn on_connect(&self, ctx: &mut Context) -> ChainResult {
        let sni = match ctx.hello.sni.as_deref() {
            Some(sni) if !sni.is_empty() => sni,
            _ => return ChainResult::Drop(HandlerError::UnknownSni("<none>".to_string()).to_string()),
        };

        let route = match self.routes.get(sni) {
            Some(route) => route,
            None => return ChainResult::Drop(HandlerError::UnknownSni(sni.to_string()).to_string()),
        };

        let idx = next_round_robin(&route.counter, route.backends.len());
        ctx.scratch.set("backend", route.backends[idx].clone());
        ChainResult::Continue
    }
}

pub fn build_sni_router(config: &Value) -> Result<Arc<dyn Handler>, ConfigError> {
    let cfg: SniRouterConfig = serde_json::from_value(config.clone())
        .map_err(|e| ConfigError(format!("sni-router: {e}")))?;

    if cfg.routes.is_empty() {
        return Err(ConfigError("sni-router: routes must be non-empty".to_string()));
    }

    let mut routes = HashMap::new();
    for (sni, backends) in cfg.routes {
        let backends = backends.into_vec();
        if backends.is_empty() {
            return Err(ConfigError(format!("sni-router: route {sni} has no backends")));
        }
        // The parsed ClientHello's SNI is always lower-cased (spec.md §3);
        // normalize route keys the same way so a config author's casing
        // never silently misses a match.
        routes.insert(
            sni.to_lowercase(),
            Route {
                backends,
                counter: AtomicUsize::new(0),
            },
        );
    }

    Ok(Arc::new(SniRouter { routes }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::ClientHelloInfo;
    use std::sync::Arc as StdArc;

    async fn ctx_with_sni(sni: Option<&str>) -> Context {
        let sock = StdArc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Context::new(
            "127.0.0.1:9000".parse().unwrap(),
            vec![],
            ClientHelloInfo {
                sni: sni.map(str::to_string),
                alpn: vec![],
                scid: vec![],
                dcid: vec![],
            },
            0,
            sock,
            std::sync::Arc::new(crate::handler::Chain::new(vec![])),
        )
    }

    #[tokio::test]
    async fn simple_router_round_robins_across_backends() {
        let config = serde_json::json!({ "backends": ["a:1", "b:1"] });
        let handler = build_simple_router(&config).unwrap();

        let mut picks = Vec::new();
        for _ in 0..4 {
            let mut ctx = ctx_with_sni(None).await;
            handler.on_connect(&mut ctx).await;
            picks.push(ctx.scratch.get_str("backend").unwrap().to_string());
        }
        assert_eq!(picks, vec!["a:1", "b:1", "a:1", "b:1"]);
    }

    #[tokio::test]
    async fn simple_router_rejects_both_backend_and_backends() {
        let config = serde_json::json!({ "backend": "a:1", "backends": ["b:1"] });
        assert!(build_simple_router(&config).is_err());
    }

    #[tokio::test]
    async fn sni_router_drops_on_unknown_sni() {
        let config = serde_json::json!({ "routes": { "known.example": "a:1" } });
        let handler = build_sni_router(&config).unwrap();
        let mut ctx = ctx_with_sni(Some("unknown.example")).await;
        assert!(matches!(handler.on_connect(&mut ctx).await, ChainResult::Drop(_)));
    }

    #[tokio::test]
    async fn sni_router_selects_configured_backend() {
        let config = serde_json::json!({ "routes": { "known.example": "a:1" } });
        let handler = build_sni_router(&config).unwrap();
        let mut ctx = ctx_with_sni(Some("known.example")).await;
        assert!(matches!(handler.on_connect(&mut ctx).await, ChainResult::Continue));
        assert_eq!(ctx.scratch.get_str("backend"), Some("a:1"));
    }

    #[tokio::test]
    async fn sni_router_round_robin_is_per_route() {
        let config = serde_json::json!({
            "routes": {
                "a.example": ["a1:1", "a2:1"],
                "b.example": "b1:1",
            }
        });
        let handler = build_sni_router(&config).unwrap();

        let mut a_picks = Vec::new();
        for _ in 0..2 {
            let mut ctx = ctx_with_sni(Some("a.example")).await;
            handler.on_connect(&mut ctx).await;
            a_picks.push(ctx.scratch.get_str("backend").unwrap().to_string());
        }
        assert_eq!(a_picks, vec!["a1:1", "a2:1"]);

        let mut ctx = ctx_with_sni(Some("b.example")).await;
        handler.on_connect(&mut ctx).await;
        assert_eq!(ctx.scratch.get_str("backend"), Some("b1:1"));
    }

    #[test]
    fn sni_router_rejects_empty_routes() {
        let config = serde_json::json!({ "routes": {} });
        assert!(build_sni_router(&config).is_err());
    }
}
