//! Handler chain (C4): the polymorphic middleware pipeline a connection
//! walks through on admission (spec.md §4.4).
//!
//! New code — the teacher's `ConnectionHandler::handle_connection` hard-codes
//! a single `match Protocol` dispatch. The chain generalizes that single
//! decision point into an ordered list of named steps, kept in the same
//! `tracing`-plus-explicit-error-enum idiom the teacher uses throughout
//! `connection.rs`.

use crate::context::Context;
use crate::session::Session;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Outcome of a chain step (spec.md §4.4).
#[derive(Debug)]
pub enum ChainResult {
    Continue,
    Handled,
    Drop(String),
}

/// A named middleware step. Implementations are looked up by the type string
/// given in config, never by Rust type — see `registry()` below.
///
/// `async_trait` (not native async-fn-in-trait) because handlers are stored
/// and invoked as `Arc<dyn Handler>` — the Forwarder's `on_connect` dials a
/// backend socket and spawns the backend→client pump, both of which need
/// `.await`, so a synchronous trait would force it onto a blocking runtime
/// handle instead.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn on_connect(&self, ctx: &mut Context) -> ChainResult;

    /// Only `Inbound` is dispatched through the chain by the proxy loop
    /// (spec.md §4.4); handlers may still be called with `Outbound` in the
    /// future without changing this signature.
    async fn on_packet(&self, ctx: &mut Context, bytes: &[u8], direction: Direction) -> ChainResult {
        let _ = (ctx, bytes, direction);
        ChainResult::Continue
    }

    /// Called exactly once when a session ends, for any reason (spec.md
    /// §4.4). Takes the `Session` rather than the admission-time `Context`:
    /// the `Context` is scoped to admission (it owns the buffered Initial
    /// packet and the parsed ClientHello) and does not outlive the session,
    /// which may close minutes later from a sweep or pump task that never
    /// had a `Context` to begin with.
    async fn on_disconnect(&self, session: &Session) {
        let _ = session;
    }
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

pub type HandlerFactory = fn(&Value) -> Result<Arc<dyn Handler>, ConfigError>;

/// Process-global registry from handler-type string to factory (spec.md
/// §4.4: "Registration is static; factories fail fast at startup on bad
/// config"). Populated once, in `handlers::register_builtins`.
fn registry() -> &'static RwLock<HashMap<String, HandlerFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, HandlerFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

pub fn register(type_name: &str, factory: HandlerFactory) {
    registry()
        .write()
        .unwrap()
        .insert(type_name.to_string(), factory);
}

pub fn build(type_name: &str, config: &Value) -> Result<Arc<dyn Handler>, ConfigError> {
    let factories = registry().read().unwrap();
    let factory = factories
        .get(type_name)
        .ok_or_else(|| ConfigError(format!("unknown handler type: {type_name}")))?;
    factory(config)
}

/// An ordered, immutable list of handlers a connection is admitted through.
/// Swapped wholesale on hot-reload (spec.md §4.7) rather than mutated in
/// place.
pub struct Chain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Chain {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    /// Walks the chain for a new connection. A chain that reaches its end
    /// without any handler returning `Handled` is a configuration error,
    /// caught at startup by `Config` validation rather than here — at
    /// runtime it is treated as an implicit drop.
    pub async fn on_connect(&self, ctx: &mut Context) -> ChainResult {
        for handler in &self.handlers {
            match handler.on_connect(ctx).await {
                ChainResult::Continue => continue,
                ChainResult::Handled => return ChainResult::Handled,
                ChainResult::Drop(reason) => return ChainResult::Drop(reason),
            }
        }
        ChainResult::Drop("chain exhausted without a terminator".to_string())
    }

    pub async fn on_packet(&self, ctx: &mut Context, bytes: &[u8], direction: Direction) -> ChainResult {
        for handler in &self.handlers {
            match handler.on_packet(ctx, bytes, direction).await {
                ChainResult::Continue => continue,
                other => return other,
            }
        }
        ChainResult::Continue
    }

    pub async fn on_disconnect(&self, session: &Session) {
        for handler in &self.handlers {
            handler.on_disconnect(session).await;
        }
    }
}
