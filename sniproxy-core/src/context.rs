//! Per-connection scratch carried through the handler chain (spec.md §3).
//!
//! Lives from the arrival of a first-of-connection Initial packet until the
//! session it produces is torn down. New code: the teacher's
//! `ConnectionHandler` has nothing like it, since a TCP tunnel never needs
//! cross-handler scratch state — one handler does the whole job. This is
//! the direct generalization of that single-handler body into the
//! multi-handler chain spec.md §4.4 describes.

use crate::handler::Chain;
use crate::quic::ClientHelloInfo;
use crate::session::Session;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Cross-handler key-value bag (spec.md §3: "a string/int key-value bag used
/// for cross-handler communication"). `backend` and `_session_count` are the
/// two well-known keys the built-in handlers read/write; anything else is
/// free for a custom handler to use.
#[derive(Debug, Default, Clone)]
pub struct Scratch(HashMap<String, Value>);

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }
}

/// Per-connection context, built once a ClientHello has been successfully
/// parsed for a new client address (spec.md §4.7 step 4).
pub struct Context {
    pub client_addr: SocketAddr,
    /// The first-of-connection Initial datagram. Cleared once the Forwarder
    /// has sent it on, to free the memory (spec.md §3: "cleared to free
    /// memory once forwarded").
    pub initial_packet: Option<Vec<u8>>,
    pub hello: ClientHelloInfo,
    pub scratch: Scratch,
    /// The proxy's listen socket, for handlers that need to write directly
    /// back to the client.
    pub listen_socket: Arc<UdpSocket>,
    /// Populated once the Forwarder has dialed a backend and registered the
    /// session in the session table.
    pub session: Option<Arc<Session>>,
    /// The handler chain this connection is being admitted under (or, for a
    /// packet on an already-admitted session, the chain it was admitted
    /// under — `Session::admitted_chain`). The Forwarder reads this to
    /// stamp the `Session` it creates, so a hot-reload never changes how an
    /// in-flight session tears down (spec.md §4.7).
    pub chain: Arc<Chain>,
}

impl Context {
    pub fn new(
        client_addr: SocketAddr,
        initial_packet: Vec<u8>,
        hello: ClientHelloInfo,
        session_count: usize,
        listen_socket: Arc<UdpSocket>,
        chain: Arc<Chain>,
    ) -> Self {
        let mut scratch = Scratch::new();
        scratch.set("_session_count", session_count as u64);
        Self {
            client_addr,
            initial_packet: Some(initial_packet),
            hello,
            scratch,
            listen_socket,
            session: None,
            chain,
        }
    }

    /// Builds a transient context for an Inbound packet on an
    /// already-admitted session (spec.md §4.7 steps 2/3): no ClientHello was
    /// parsed for this datagram, so `hello` is empty and `initial_packet` is
    /// absent.
    pub fn for_packet(
        client_addr: SocketAddr,
        session: Arc<Session>,
        listen_socket: Arc<UdpSocket>,
    ) -> Self {
        let chain = Arc::clone(&session.admitted_chain);
        Self {
            client_addr,
            initial_packet: None,
            hello: ClientHelloInfo {
                sni: None,
                alpn: Vec::new(),
                scid: Vec::new(),
                dcid: Vec::new(),
            },
            scratch: Scratch::new(),
            listen_socket,
            session: Some(session),
            chain,
        }
    }

    /// Drops the buffered Initial datagram once the Forwarder has relayed it
    /// to the backend.
    pub fn clear_initial_packet(&mut self) {
        self.initial_packet = None;
    }
}
