//! Proxy loop (C8): owns the listen socket, dispatches datagrams to the
//! handler chain or an existing session, runs the idle sweeper, and
//! coordinates graceful shutdown and config hot-reload (spec.md §4.7).
//!
//! Grounded on `sniproxy-core::run_proxy`'s `tokio::select!`-over-
//! `ctrl_c()` shutdown pattern and `connection_pool.rs::start_cleanup_task`'s
//! periodic-sweep shape, generalized from a multi-listener TCP accept loop
//! to the single-socket UDP demultiplexer spec.md §4.7 describes.

use crate::buffer::BufferPool;
use crate::context::Context;
use crate::handler::{Chain, ChainResult, Direction, Handler};
use crate::handlers::{self, forwarder::Forwarder};
use crate::metrics::Metrics;
use crate::quic::{self, header};
use crate::session::{Session, SessionTable};
use sniproxy_config::{Config, HandlerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// CID length assumed for short-header packets when no per-connection CID
/// length is negotiated out of band (spec.md §4.7 step 3: "length inferred
/// from the listener's configured CID length, default 8 bytes").
const DEFAULT_CID_LEN: usize = 8;

/// Minimum idle-sweep interval regardless of how small `session_timeout` is
/// configured (spec.md §4.7: "interval ~= session_timeout / 10, minimum 10s").
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline the graceful shutdown path waits for in-flight pumps to drain
/// before giving up and force-closing whatever remains (spec.md §4.7).
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Shared, proxy-owned state the handler chain and background tasks are
/// built against. Outlives any individual `Config`/`Chain` (both are
/// swapped wholesale on hot-reload).
pub struct ProxyState {
    pub sessions: Arc<SessionTable>,
    pub buffers: Arc<BufferPool>,
    pub metrics: Arc<Metrics>,
    pub listen_socket: Arc<UdpSocket>,
    chain: RwLock<Arc<Chain>>,
    session_timeout: AtomicU64,
    /// The last successfully applied `Config`, kept only to validate the
    /// next reload's `listen` field against it (spec.md §6).
    config: RwLock<Config>,
    shutting_down: AtomicBool,
    cid_len: usize,
}

impl ProxyState {
    pub fn chain(&self) -> Arc<Chain> {
        Arc::clone(&self.chain.read().unwrap())
    }

    pub fn set_chain(&self, chain: Arc<Chain>) {
        *self.chain.write().unwrap() = chain;
    }

    pub fn session_timeout(&self) -> u64 {
        self.session_timeout.load(Ordering::Relaxed)
    }

    pub fn set_session_timeout(&self, secs: u64) {
        self.session_timeout.store(secs, Ordering::Relaxed);
    }

    pub fn config_snapshot(&self) -> Config {
        self.config.read().unwrap().clone()
    }

    pub fn set_config_snapshot(&self, config: Config) {
        *self.config.write().unwrap() = config;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}

/// Builds a `Chain` from the configured handler list (spec.md §4.4/§6).
/// `forwarder` is constructed directly against proxy-owned state rather than
/// through the config-driven registry — see `handlers::forwarder::build`'s
/// deliberate `Err`.
fn build_chain(
    handler_configs: &[HandlerConfig],
    state: &ProxyState,
) -> Result<Arc<Chain>, anyhow::Error> {
    let mut handlers: Vec<Arc<dyn Handler>> = Vec::with_capacity(handler_configs.len());
    for entry in handler_configs {
        let handler: Arc<dyn Handler> = if entry.r#type == "forwarder" {
            Arc::new(Forwarder::new(
                Arc::clone(&state.sessions),
                Arc::clone(&state.buffers),
                Arc::clone(&state.listen_socket),
                Arc::clone(&state.metrics),
            ))
        } else {
            crate::handler::build(&entry.r#type, &entry.config)?
        };
        handlers.push(handler);
    }

    match handler_configs.last().map(|h| h.r#type.as_str()) {
        Some("forwarder") | Some("terminator") => {}
        _ => {
            return Err(anyhow::anyhow!(
                "handler chain must end in a terminating handler (forwarder or terminator)"
            ))
        }
    }

    Ok(Arc::new(Chain::new(handlers)))
}

/// Parses spec.md §6's `<host:port>` (or bare `:<port>`) listen address
/// into a bindable `SocketAddr`.
fn parse_listen_addr(spec: &str) -> Result<SocketAddr, anyhow::Error> {
    if let Some(port) = spec.strip_prefix(':') {
        return Ok(format!("0.0.0.0:{port}").parse()?);
    }
    Ok(spec.parse()?)
}

/// Runs the proxy until a shutdown signal (or an unrecoverable listen-socket
/// error) is received. `config_path` is retained only for SIGHUP reload —
/// the already-parsed `config` is what actually governs startup.
pub async fn run_proxy(
    config_path: std::path::PathBuf,
    config: Config,
    registry: Option<prometheus::Registry>,
) -> Result<(), anyhow::Error> {
    handlers::register_builtins();

    let metrics = Arc::new(Metrics::new(registry.as_ref()));
    let listen_addr = parse_listen_addr(&config.resolved_listen())?;
    let listen_socket = Arc::new(UdpSocket::bind(listen_addr).await?);
    info!(addr = %listen_addr, "proxy listening");

    let state = Arc::new(ProxyState {
        sessions: Arc::new(SessionTable::new()),
        buffers: Arc::new(BufferPool::with_capacity(64)),
        metrics,
        listen_socket,
        chain: RwLock::new(Arc::new(Chain::new(vec![]))),
        session_timeout: AtomicU64::new(config.resolved_session_timeout()),
        config: RwLock::new(config.clone()),
        shutting_down: AtomicBool::new(false),
        cid_len: DEFAULT_CID_LEN,
    });

    let chain = build_chain(&config.handlers, &state)?;
    state.set_chain(chain);

    let sweeper = tokio::spawn(idle_sweep_loop(Arc::clone(&state)));

    #[cfg(unix)]
    let reload_task = tokio::spawn(reload_loop(config_path, Arc::clone(&state)));

    let result = main_loop(Arc::clone(&state)).await;

    sweeper.abort();
    #[cfg(unix)]
    reload_task.abort();

    shutdown_all_sessions(&state).await;
    info!("proxy shut down");

    result
}

/// Single listen-read task (spec.md §5: "Exactly one task owns the listen
/// socket read"). Runs until SIGINT.
async fn main_loop(state: Arc<ProxyState>) -> Result<(), anyhow::Error> {
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                state.begin_shutdown();
                return Ok(());
            }
            result = recv_one(&state) => {
                if let Err(e) = result {
                    error!(error = %e, "listen socket read failed");
                    return Err(e.into());
                }
            }
        }
    }
}

/// One iteration of spec.md §4.7's receive loop: acquire a buffer, read one
/// datagram, and dispatch it by 4-tuple hit, CID hit, or fresh admission.
async fn recv_one(state: &Arc<ProxyState>) -> std::io::Result<()> {
    let mut buf = state.buffers.acquire();
    let (len, client_addr) = state.listen_socket.recv_from(&mut buf[..]).await?;
    let datagram = &mut buf[..len];

    if let Some(session) = state.sessions.lookup_by_client(&client_addr) {
        forward_existing(state, session, datagram, client_addr).await;
        state.buffers.release(buf);
        return Ok(());
    }

    if !header::is_long_header(datagram[0]) {
        if let Ok(dcid) = header::parse_short_header_dcid(datagram, state.cid_len) {
            if let Some(session) = state.sessions.lookup_by_cid(dcid) {
                let old_addr = session.client_addr();
                if old_addr != client_addr {
                    // Best-effort migration fast path (spec.md §9 open
                    // question (b)): not a correctness guarantee.
                    state.sessions.reindex_client(old_addr, client_addr, &session);
                    session.set_client_addr(client_addr);
                }
                forward_existing(state, session, datagram, client_addr).await;
            }
        }
        // No long header and no CID hit: nothing this proxy understands how
        // to admit. Drop silently.
        state.buffers.release(buf);
        return Ok(());
    }

    if state.is_shutting_down() {
        // "stop accepting new connections" (spec.md §4.7 graceful shutdown).
        state.buffers.release(buf);
        return Ok(());
    }

    // `parse_client_hello` decrypts the Initial payload in place, so the
    // original wire bytes must be saved before it runs — the Forwarder
    // relays this exact datagram on to the real backend, which expects the
    // genuine encrypted Initial, not our header-unprotected scratch copy.
    let original = datagram.to_vec();
    match quic::parse_client_hello(datagram) {
        Ok(hello) if hello.sni.as_deref().is_some_and(|s| !s.is_empty()) => {
            let chain = state.chain();
            let session_count = state.sessions.len();
            let mut ctx = Context::new(
                client_addr,
                original,
                hello,
                session_count,
                Arc::clone(&state.listen_socket),
                Arc::clone(&chain),
            );
            match chain.on_connect(&mut ctx).await {
                ChainResult::Handled => {}
                ChainResult::Drop(reason) => {
                    debug!(client = %client_addr, reason = %reason, "connection dropped");
                    state
                        .metrics
                        .handler_drops
                        .with_label_values(&[Metrics::drop_reason_label(&reason)])
                        .inc();
                }
                ChainResult::Continue => {
                    warn!(client = %client_addr, "handler chain exhausted without a terminator");
                }
            }
        }
        Ok(_) => {
            // Parsed cleanly but carried no SNI: spec.md §4.1's `NoSNI`
            // edge case, treated the same as any other parse failure.
            debug!(client = %client_addr, "ClientHello carried no SNI");
            state.metrics.sni_parse_errors.inc();
        }
        Err(e) => {
            debug!(client = %client_addr, error = %e, "ClientHello parse failed");
            state.metrics.sni_parse_errors.inc();
        }
    }

    state.buffers.release(buf);
    Ok(())
}

/// Dispatches an Inbound datagram for an already-admitted session through
/// the chain it was admitted under (spec.md §4.4: "only Inbound is
/// dispatched through the chain").
async fn forward_existing(
    state: &Arc<ProxyState>,
    session: Arc<Session>,
    datagram: &[u8],
    client_addr: SocketAddr,
) {
    if session.is_closed() {
        return;
    }
    let mut ctx = Context::for_packet(client_addr, Arc::clone(&session), Arc::clone(&state.listen_socket));
    if let ChainResult::Drop(reason) = session
        .admitted_chain
        .on_packet(&mut ctx, datagram, Direction::Inbound)
        .await
    {
        if !reason.is_empty() {
            debug!(session_id = session.id, reason = %reason, "inbound packet dropped");
        }
    }
}

/// Idle sweeper (spec.md §4.7): periodically closes sessions that have gone
/// quiet for `session_timeout`. Re-reads the timeout and recomputes its own
/// sleep duration every cycle so a hot-reloaded `session_timeout` takes
/// effect without restarting the task.
async fn idle_sweep_loop(state: Arc<ProxyState>) {
    loop {
        let timeout = state.session_timeout();
        let interval = Duration::from_secs(timeout / 10).max(MIN_SWEEP_INTERVAL);
        tokio::time::sleep(interval).await;

        let now = now_secs();
        let timeout = state.session_timeout();
        for session in state.sessions.snapshot() {
            if session.is_closed() {
                continue;
            }
            if now.saturating_sub(session.last_activity()) >= timeout {
                info!(session_id = session.id, "idle timeout, closing session");
                session.mark_closing();
                session.admitted_chain.on_disconnect(&session).await;
            }
        }
    }
}

/// SIGHUP handler (spec.md §6): re-reads the config file and atomically
/// swaps the chain and session timeout. A `listen` change, an unparsable
/// file, or a handler-chain build failure all reject the reload and keep
/// the proxy running on its current configuration.
#[cfg(unix)]
async fn reload_loop(config_path: std::path::PathBuf, state: Arc<ProxyState>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler, config reload disabled");
            return;
        }
    };

    loop {
        if sighup.recv().await.is_none() {
            return;
        }
        info!("SIGHUP received, reloading configuration");

        let previous = state.config_snapshot();
        let new_config = match Config::from_file(&config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "config reload: failed to read/parse config, keeping running config");
                continue;
            }
        };
        if let Err(e) = new_config.validate_reload(&previous) {
            warn!(error = %e, "config reload rejected");
            continue;
        }
        match build_chain(&new_config.handlers, &state) {
            Ok(chain) => {
                state.set_chain(chain);
                state.set_session_timeout(new_config.resolved_session_timeout());
                state.set_config_snapshot(new_config);
                info!("configuration reloaded");
            }
            Err(e) => {
                warn!(error = %e, "config reload: handler chain build failed, keeping running config");
            }
        }
    }
}

/// Graceful shutdown (spec.md §4.7): transitions every live session to
/// Closing, waits up to `SHUTDOWN_DRAIN_DEADLINE` for pumps to drain on
/// their own, then force-closes whatever remains before returning.
async fn shutdown_all_sessions(state: &Arc<ProxyState>) {
    for session in state.sessions.snapshot() {
        session.mark_closing();
    }

    let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_DEADLINE;
    while tokio::time::Instant::now() < deadline && !state.sessions.is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for session in state.sessions.snapshot() {
        session.admitted_chain.on_disconnect(&session).await;
    }
}
