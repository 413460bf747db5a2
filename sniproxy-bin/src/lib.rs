//! Entry point wiring (C13): logging setup, config load, the ambient
//! `/metrics`+`/health` HTTP server, and the proxy's own shutdown.
//!
//! Kept in the teacher's shape — `fmt().json().init()` for logging, a
//! `hyper::service::service_fn` over a raw `TcpListener::accept()` loop for
//! the metrics server, a broadcast channel to tell that loop to stop. The
//! only structural change is that metrics/health are always-on (there's no
//! `config.metrics.enabled` anymore — metrics are ambient per the proxy's
//! own config schema, so the bind address is a CLI flag instead), and the
//! proxy itself now owns its `ctrl_c()` shutdown rather than taking one in
//! via the broadcast channel.

use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use sniproxy_config::Config;
use sniproxy_core::run_proxy;
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

pub async fn run(config_path: &Path, metrics_addr: Option<SocketAddr>) -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("sniproxy=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    let config = Config::from_file(config_path)?;

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let (registry, metrics_handle) = if let Some(metrics_addr) = metrics_addr {
        let registry = Registry::new();
        let metrics_listener = TcpListener::bind(metrics_addr).await?;
        info!(addr = %metrics_addr, "metrics server listening");

        let registry_clone = registry.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("metrics server shutting down");
                        break;
                    }
                    result = metrics_listener.accept() => {
                        if let Ok((stream, _)) = result {
                            let registry = registry_clone.clone();
                            let io = TokioIo::new(stream);

                            tokio::spawn(async move {
                                let service = hyper::service::service_fn(
                                    move |req: Request<hyper::body::Incoming>| {
                                        let registry = registry.clone();
                                        async move {
                                            match req.uri().path() {
                                                "/metrics" => {
                                                    let encoder = TextEncoder::new();
                                                    let metric_families = registry.gather();
                                                    let mut buffer = vec![];
                                                    encoder.encode(&metric_families, &mut buffer).map_err(
                                                        |e| format!("metrics encoding error: {e}"),
                                                    )?;
                                                    Ok::<_, String>(Response::new(Full::new(
                                                        bytes::Bytes::from(buffer),
                                                    )))
                                                }
                                                "/health" => {
                                                    let health_response =
                                                        r#"{"status":"healthy","service":"sniproxy"}"#;
                                                    Ok::<_, String>(Response::new(Full::new(
                                                        bytes::Bytes::from(health_response),
                                                    )))
                                                }
                                                "/" => {
                                                    let index_response =
                                                        r#"{"endpoints":["/health","/metrics"]}"#;
                                                    Ok::<_, String>(Response::new(Full::new(
                                                        bytes::Bytes::from(index_response),
                                                    )))
                                                }
                                                _ => {
                                                    let not_found = r#"{"error":"not_found"}"#;
                                                    Ok::<_, String>(Response::new(Full::new(
                                                        bytes::Bytes::from(not_found),
                                                    )))
                                                }
                                            }
                                        }
                                    },
                                );

                                if let Err(err) = http1::Builder::new().serve_connection(io, service).await
                                {
                                    warn!(error = %err, "metrics server connection error");
                                }
                            });
                        }
                    }
                }
            }
        });

        (Some(registry), Some(handle))
    } else {
        (None, None)
    };

    let proxy_result = run_proxy(config_path.to_path_buf(), config, registry)
        .await
        .map_err(|e| -> Box<dyn Error> { e.to_string().into() });

    let _ = shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        info!("waiting for metrics server to shut down");
        let _ = handle.await;
    }

    proxy_result
}

/// Resolves the metrics listen address: a CLI flag, else the
/// `HYPROXY_METRICS_ADDR` environment variable, else the default
/// `127.0.0.1:9090`. Returns `None` only if the caller explicitly disables
/// the server (`--no-metrics`).
pub fn resolve_metrics_addr(flag: Option<String>, disabled: bool) -> Result<Option<SocketAddr>, Box<dyn Error>> {
    if disabled {
        return Ok(None);
    }
    let spec = match flag {
        Some(s) => s,
        None => std::env::var("HYPROXY_METRICS_ADDR").unwrap_or_else(|_| "127.0.0.1:9090".to_string()),
    };
    Ok(Some(spec.parse()?))
}
