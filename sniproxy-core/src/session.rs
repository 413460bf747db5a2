//! Session table (C3): the concurrent index from a client 4-tuple or
//! Connection ID to the session serving it.
//!
//! Grounded on `connection_pool.rs`'s `Arc<DashMap<..>>`-of-shared-state
//! pattern and `udp_connection.rs`'s `DashMap<SocketAddr, UdpSession>`,
//! generalized to the two-index table spec.md §3/§4.3 describes.

use crate::handler::Chain;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Lifecycle state of a session (spec.md §4.7): `New -> Active -> Closing ->
/// Closed`. Stored as a plain atomic so any task can observe it without
/// taking the session table's per-entry lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    New = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::New,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A live client<->backend mapping.
///
/// `client_addr`, `last_activity` and the close state are touched from both
/// the listen-read task and the session's backend->client pump, so they are
/// plain atomics / a short `Mutex` rather than requiring external
/// synchronization (spec.md §5: "Session fields that are touched from both
/// the listen task and the pump task ... are atomic").
pub struct Session {
    pub id: u64,
    client_addr: Mutex<SocketAddr>,
    pub backend_addr: SocketAddr,
    pub backend_socket: Arc<UdpSocket>,
    pub created_at: u64,
    last_activity: AtomicU64,
    state: AtomicU8,
    closed: AtomicBool,
    /// Wakes anything waiting on the session's backend->client pump
    /// (`Session::notified`) as soon as the session moves past `Active`, so
    /// a sweep/shutdown/drop closes the session well inside one sweep
    /// interval instead of waiting out the pump's multi-minute read
    /// deadline (spec.md §8 P5).
    notify: Notify,
    /// The handler chain this session was admitted under (spec.md §4.7:
    /// "in-flight sessions continue with the chain they were admitted
    /// under until they terminate"). Every termination path — the idle
    /// sweeper, a backend read error in the pump, a mid-session `Drop`
    /// from the chain, or graceful shutdown — dispatches `on_disconnect`
    /// through this handle rather than whatever chain is currently live
    /// in the hot-reload cell, so a reload never changes how an
    /// already-admitted session tears down.
    pub admitted_chain: Arc<Chain>,
}

impl Session {
    pub fn new(
        id: u64,
        client_addr: SocketAddr,
        backend_addr: SocketAddr,
        backend_socket: Arc<UdpSocket>,
        admitted_chain: Arc<Chain>,
    ) -> Self {
        let now = now_secs();
        Self {
            id,
            client_addr: Mutex::new(client_addr),
            backend_addr,
            backend_socket,
            created_at: now,
            last_activity: AtomicU64::new(now),
            state: AtomicU8::new(SessionState::New as u8),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            admitted_chain,
        }
    }

    /// A future that resolves as soon as this session moves past `Active`.
    /// Must be created (but not yet polled) before the caller's own state
    /// check, so a `mark_closing`/`try_close` that races the check is never
    /// missed (the standard `Notify` "enable, then check" pattern).
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    pub fn client_addr(&self) -> SocketAddr {
        *self.client_addr.lock().unwrap()
    }

    /// Updates the client address on a fast-path migration hit (spec.md
    /// §4.7 step 3). Best-effort, not a correctness guarantee.
    pub fn set_client_addr(&self, addr: SocketAddr) {
        *self.client_addr.lock().unwrap() = addr;
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
        // First touch after creation promotes New -> Active.
        let _ = self.state.compare_exchange(
            SessionState::New as u8,
            SessionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the session towards `Closing`. Idempotent; never moves a
    /// session backwards.
    pub fn mark_closing(&self) {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur >= SessionState::Closing as u8 {
                return;
            }
            if self
                .state
                .compare_exchange(cur, SessionState::Closing as u8, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // `notify_one` (not `notify_waiters`): a permit is stored if
                // the pump hasn't called `notified()` yet, so the wakeup is
                // never lost to the create-future/await race (spec.md §5:
                // "checks both before the read and after the read
                // completes").
                self.notify.notify_one();
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_closing_or_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) >= SessionState::Closing as u8
    }

    /// CAS close-once (spec.md §3/§4.7): returns `true` to exactly one
    /// caller, who is then responsible for closing the backend socket.
    pub fn try_close(&self) -> bool {
        let won = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if won {
            self.state.store(SessionState::Closed as u8, Ordering::Release);
            self.notify.notify_one();
        }
        won
    }
}

/// Concurrent index from client 4-tuple and CID to session (C3).
pub struct SessionTable {
    by_client: DashMap<SocketAddr, Arc<Session>>,
    by_cid: DashMap<Vec<u8>, Arc<Session>>,
    // Every CID ever indexed for a session, so `remove` can clean up all of
    // them (spec.md §4.3: "removal deletes all of them").
    cids_by_client: DashMap<SocketAddr, Vec<Vec<u8>>>,
    next_id: AtomicU64,
    // Counter tracked alongside `next_id` so `len()` stays O(1) without
    // walking either DashMap.
    count: AtomicU32,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            by_client: DashMap::new(),
            by_cid: DashMap::new(),
            cids_by_client: DashMap::new(),
            next_id: AtomicU64::new(1),
            count: AtomicU32::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Indexes a freshly created session by its client address.
    pub fn insert(&self, session: Arc<Session>) {
        let addr = session.client_addr();
        self.by_client.insert(addr, session);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lookup_by_client(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        self.by_client.get(addr).map(|e| Arc::clone(e.value()))
    }

    pub fn lookup_by_cid(&self, cid: &[u8]) -> Option<Arc<Session>> {
        self.by_cid.get(cid).map(|e| Arc::clone(e.value()))
    }

    /// Adds a secondary CID -> session mapping. Idempotent; last-writer-wins
    /// on a conflicting CID (spec.md §4.3 — not expected in normal
    /// operation, logged by the caller).
    pub fn index_cid(&self, cid: Vec<u8>, session: &Arc<Session>) {
        self.by_cid.insert(cid.clone(), Arc::clone(session));
        self.cids_by_client
            .entry(session.client_addr())
            .or_default()
            .push(cid);
    }

    /// Re-indexes a session under a new client address, e.g. on a
    /// migration-fast-path CID hit (spec.md §4.7 step 3).
    pub fn reindex_client(&self, old_addr: SocketAddr, new_addr: SocketAddr, session: &Arc<Session>) {
        self.by_client.remove(&old_addr);
        self.by_client.insert(new_addr, Arc::clone(session));
        if let Some((_, cids)) = self.cids_by_client.remove(&old_addr) {
            self.cids_by_client.insert(new_addr, cids);
        }
    }

    /// Removes a session's primary mapping and every secondary CID it was
    /// ever indexed under. Idempotent. Takes a plain `&Session` (not
    /// `&Arc<Session>`) so callers that only ever see a borrowed session —
    /// `Handler::on_disconnect`, most notably — don't need to reconstruct an
    /// `Arc` just to call this.
    pub fn remove(&self, session: &Session) {
        let addr = session.client_addr();
        if self.by_client.remove(&addr).is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some((_, cids)) = self.cids_by_client.remove(&addr) {
            for cid in cids {
                self.by_cid.remove(&cid);
            }
        }
    }

    /// Snapshot of all live sessions, for the idle sweeper.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.by_client.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// O(1) session count, for rate-limiter gating.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
