//! UDP/QUIC reverse proxy core: packet demultiplexer and session engine.
//!
//! The teacher repo multiplexes TCP connections by protocol-sniffing a
//! `ConnectionHandler` across HTTP/WebSocket/gRPC/SSH. This crate keeps the
//! same shape — a named handler chain admitting a connection, a shared
//! session table, `tracing` for structured logs, `prometheus` for metrics —
//! retargeted at UDP datagrams carrying QUIC Initial packets, admitted by
//! SNI rather than by protocol sniff.

pub mod buffer;
pub mod context;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod metrics;
pub mod proxy;
pub mod quic;
pub mod session;

pub use context::{Context, Scratch};
pub use error::{HandlerError, ParseError};
pub use handler::{Chain, ChainResult, Direction, Handler};
pub use metrics::Metrics;
pub use proxy::{run_proxy, ProxyState};
pub use quic::ClientHelloInfo;
pub use session::{Session, SessionState, SessionTable};
