//! Per-client connection state.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clinic_core::ids::{ConnectionId, SessionId, UserId};
use clinic_core::message::Message;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Close code for policy violations (auth failures, capacity).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code used on server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for idle timeouts.
pub const CLOSE_NORMAL: u16 = 1000;

/// Item on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialized text frame.
    Frame(Arc<String>),
    /// Close the transport.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Handshake state.
///
/// `Closed` is not represented: a closed connection is removed from the
/// registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Accepted, server hello not yet queued.
    Connecting,
    /// Server hello queued, waiting for the client hello.
    HelloSent,
    /// Verifying the client hello.
    Authenticating,
    /// Handshake complete.
    Active,
    /// Close requested.
    Closing,
}

/// Identity established by the handshake.
#[derive(Clone, Debug)]
pub struct AuthInfo {
    /// Verified user.
    pub user_id: UserId,
    /// Negotiated capabilities.
    pub capabilities: Vec<String>,
    /// Negotiated protocol version.
    pub version: String,
}

/// Per-connection statistics.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Handshake state.
    pub state: ConnectionState,
    /// Peer IP.
    pub ip_address: String,
    /// Peer user agent.
    pub user_agent: Option<String>,
    /// Authenticated user.
    pub user_id: Option<UserId>,
    /// Bound session.
    pub session_id: Option<SessionId>,
    /// Accept time.
    pub connected_at: DateTime<Utc>,
    /// Time since the last inbound frame.
    pub idle_time_ms: u64,
    /// Inbound frames processed.
    pub message_count: u64,
    /// Outbound frames dropped on a full queue.
    pub dropped_messages: u64,
    /// Subscribed topics.
    pub subscriptions: Vec<String>,
}

/// A connected client.
pub struct Connection {
    /// Connection id.
    pub id: ConnectionId,
    /// Peer address.
    pub address: SocketAddr,
    /// Peer user agent header.
    pub user_agent: Option<String>,
    tx: mpsc::Sender<Outbound>,
    state: Mutex<ConnectionState>,
    auth: Mutex<Option<AuthInfo>>,
    session_id: Mutex<Option<SessionId>>,
    subscriptions: Mutex<HashSet<String>>,
    /// Accept time.
    pub connected_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    message_count: AtomicU64,
    auth_failures: AtomicU32,
    dropped_messages: AtomicU64,
    is_alive: AtomicBool,
    closed: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection in `Connecting` state.
    pub fn new(
        id: ConnectionId,
        address: SocketAddr,
        user_agent: Option<String>,
        tx: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            address,
            user_agent,
            tx,
            state: Mutex::new(ConnectionState::Connecting),
            auth: Mutex::new(None),
            session_id: Mutex::new(None),
            subscriptions: Mutex::new(HashSet::new()),
            connected_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            message_count: AtomicU64::new(0),
            auth_failures: AtomicU32::new(0),
            dropped_messages: AtomicU64::new(0),
            is_alive: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move from `from` to `to`. Returns `false` if the state was not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Whether the handshake has completed.
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Record a successful handshake, moving `Authenticating` to `Active`.
    /// Returns `false` and records nothing if the connection already left
    /// `Authenticating` (closed while the hello was being verified).
    #[must_use]
    pub fn authenticate(&self, info: AuthInfo) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Authenticating {
            return false;
        }
        *self.auth.lock() = Some(info);
        *state = ConnectionState::Active;
        true
    }

    /// Authenticated user.
    pub fn user_id(&self) -> Option<UserId> {
        self.auth.lock().as_ref().map(|a| a.user_id.clone())
    }

    /// Negotiated capabilities.
    pub fn capabilities(&self) -> Vec<String> {
        self.auth
            .lock()
            .as_ref()
            .map(|a| a.capabilities.clone())
            .unwrap_or_default()
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> Option<String> {
        self.auth.lock().as_ref().map(|a| a.version.clone())
    }

    /// Rate-limit key: the user once authenticated, the peer IP before.
    pub fn rate_key(&self) -> String {
        match self.user_id() {
            Some(user) => format!("user:{user}"),
            None => format!("ip:{}", self.address.ip()),
        }
    }

    /// Bind to a session. A connection is bound to at most one session.
    pub fn bind_session(&self, session_id: SessionId) {
        *self.session_id.lock() = Some(session_id);
    }

    /// Bound session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().clone()
    }

    /// Add topics. Returns the full subscription set, sorted.
    pub fn subscribe<I: IntoIterator<Item = String>>(&self, topics: I) -> Vec<String> {
        let mut subs = self.subscriptions.lock();
        subs.extend(topics);
        sorted(&subs)
    }

    /// Remove topics. Returns the remaining set, sorted.
    pub fn unsubscribe<'a, I: IntoIterator<Item = &'a String>>(&self, topics: I) -> Vec<String> {
        let mut subs = self.subscriptions.lock();
        for topic in topics {
            let _ = subs.remove(topic);
        }
        sorted(&subs)
    }

    /// Whether the connection subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains(topic)
    }

    /// Enqueue a text frame. Returns `false` (and counts a drop) when the
    /// queue is full or closed.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(Outbound::Frame(frame)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and enqueue a protocol message.
    pub fn send_message(&self, message: &Message) -> bool {
        self.send(Arc::new(message.to_json()))
    }

    /// Request a transport close. Idempotent.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closing {
                return;
            }
            *state = ConnectionState::Closing;
        }
        let reason = reason.into();
        if self
            .tx
            .try_send(Outbound::Close { code, reason })
            .is_err()
        {
            // queue full or writer gone: drop the transport without a close frame
            self.closed.cancel();
        }
    }

    /// Fires once the transport must stop.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Record one inbound frame.
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
        let _ = self.message_count.fetch_add(1, Ordering::Relaxed);
        self.mark_alive();
    }

    /// Time since the last inbound frame (or accept).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Inbound frames processed.
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Count an authentication failure and return the new total.
    pub fn record_auth_failure(&self) -> u32 {
        self.auth_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Outbound frames dropped.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the peer as responsive (pong or any frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Read and reset the alive flag for the heartbeat.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Statistics snapshot.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id.clone(),
            state: self.state(),
            ip_address: self.address.ip().to_string(),
            user_agent: self.user_agent.clone(),
            user_id: self.user_id(),
            session_id: self.session_id(),
            connected_at: self.connected_at,
            idle_time_ms: u64::try_from(self.idle_for().as_millis()).unwrap_or(u64::MAX),
            message_count: self.message_count(),
            dropped_messages: self.drop_count(),
            subscriptions: sorted(&self.subscriptions.lock()),
        }
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<String> = set.iter().cloned().collect();
    v.sort();
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Connection::new(
            ConnectionId::from("conn_test"),
            "10.0.0.7:51000".parse().unwrap(),
            Some("test-agent".into()),
            tx,
        );
        (conn, rx)
    }

    fn frame_text(item: Outbound) -> String {
        match item {
            Outbound::Frame(f) => f.to_string(),
            Outbound::Close { .. } => panic!("expected frame"),
        }
    }

    #[test]
    fn starts_connecting_and_unauthenticated() {
        let (conn, _rx) = make_connection(4);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.user_id().is_none());
        assert!(conn.capabilities().is_empty());
        assert_eq!(conn.rate_key(), "ip:10.0.0.7");
    }

    #[test]
    fn transition_requires_expected_state() {
        let (conn, _rx) = make_connection(4);
        assert!(!conn.transition(ConnectionState::HelloSent, ConnectionState::Authenticating));
        assert!(conn.transition(ConnectionState::Connecting, ConnectionState::HelloSent));
        assert_eq!(conn.state(), ConnectionState::HelloSent);
    }

    fn auth_info(user: &str) -> AuthInfo {
        AuthInfo {
            user_id: UserId::from(user),
            capabilities: vec!["query".into()],
            version: "1.0.0".into(),
        }
    }

    fn start_handshake(conn: &Connection) {
        assert!(conn.transition(ConnectionState::Connecting, ConnectionState::HelloSent));
        assert!(conn.transition(ConnectionState::HelloSent, ConnectionState::Authenticating));
    }

    #[test]
    fn authenticate_switches_rate_key() {
        let (conn, _rx) = make_connection(4);
        start_handshake(&conn);
        assert!(conn.authenticate(auth_info("dr-ana")));
        assert!(conn.is_active());
        assert_eq!(conn.rate_key(), "user:dr-ana");
        assert_eq!(conn.capabilities(), vec!["query".to_owned()]);
    }

    #[test]
    fn authenticate_requires_handshake_in_progress() {
        let (conn, _rx) = make_connection(4);
        assert!(!conn.authenticate(auth_info("dr-ana")));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.user_id().is_none());
    }

    #[test]
    fn close_during_handshake_is_not_undone() {
        let (conn, _rx) = make_connection(4);
        start_handshake(&conn);
        conn.close(CLOSE_POLICY_VIOLATION, "bye");
        assert!(!conn.authenticate(auth_info("dr-ana")));
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(!conn.is_active());
        assert!(conn.user_id().is_none());
    }

    #[test]
    fn debug_shows_identity_and_state() {
        let (conn, _rx) = make_connection(4);
        let shown = format!("{conn:?}");
        assert!(shown.contains("10.0.0.7"));
        assert!(shown.contains("Connecting"));
    }

    #[tokio::test]
    async fn send_counts_drops_when_full() {
        let (conn, mut rx) = make_connection(1);
        assert!(conn.send(Arc::new("a".into())));
        assert!(!conn.send(Arc::new("b".into())));
        assert_eq!(conn.drop_count(), 1);
        assert_eq!(frame_text(rx.recv().await.unwrap()), "a");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, mut rx) = make_connection(4);
        conn.close(CLOSE_POLICY_VIOLATION, "bye");
        conn.close(CLOSE_POLICY_VIOLATION, "again");
        assert_eq!(conn.state(), ConnectionState::Closing);
        match rx.recv().await.unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 1008);
                assert_eq!(reason, "bye");
            }
            Outbound::Frame(_) => panic!("expected close"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_on_full_queue_cancels_transport() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send(Arc::new("fill".into())));
        conn.close(CLOSE_GOING_AWAY, "shutdown");
        assert!(conn.closed().is_cancelled());
    }

    #[test]
    fn subscriptions_are_sets() {
        let (conn, _rx) = make_connection(4);
        let subs = conn.subscribe(["queries".to_owned(), "sessions".to_owned(), "queries".to_owned()]);
        assert_eq!(subs, ["queries", "sessions"]);
        let left = conn.unsubscribe(&["queries".to_owned()]);
        assert_eq!(left, ["sessions"]);
        assert!(!conn.is_subscribed("queries"));
    }

    #[test]
    fn activity_and_alive_flag() {
        let (conn, _rx) = make_connection(4);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.record_activity();
        assert!(conn.check_alive());
        assert_eq!(conn.message_count(), 1);
    }

    #[test]
    fn auth_failures_accumulate() {
        let (conn, _rx) = make_connection(4);
        assert_eq!(conn.record_auth_failure(), 1);
        assert_eq!(conn.record_auth_failure(), 2);
    }

    #[test]
    fn info_reports_peer_details() {
        let (conn, _rx) = make_connection(4);
        conn.bind_session(SessionId::parse("abc12345").unwrap());
        let info = conn.info();
        assert_eq!(info.ip_address, "10.0.0.7");
        assert_eq!(info.user_agent.as_deref(), Some("test-agent"));
        assert_eq!(info.session_id.unwrap().as_str(), "abc12345");
    }
}
