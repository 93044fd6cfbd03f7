//! Authoritative session records.

use chrono::{DateTime, Duration, Utc};
use clinic_core::errors::GatewayError;
use clinic_core::events::GatewayEvent;
use clinic_core::ids::{SessionId, UserId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::events::EventBus;

/// One conversation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Owner.
    pub user_id: UserId,
    /// Free-form context.
    pub context: Map<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last patch.
    pub updated_at: DateTime<Utc>,
    /// Last dispatched message.
    pub last_activity: DateTime<Utc>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Deactivated sessions still exist but are flagged.
    pub active: bool,
    /// Dispatched messages.
    pub message_count: u64,
}

impl Session {
    fn new(id: SessionId, user_id: UserId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id,
            user_id,
            context: Map::new(),
            created_at: now,
            updated_at: now,
            last_activity: now,
            expires_at: now + ttl,
            active: true,
            message_count: 0,
        }
    }

    /// Whether the session is past its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Changes a client may request. Expiry can only move forward, via `renew`.
#[derive(Clone, Debug, Default)]
pub struct SessionPatch {
    /// Keys merged into the context. A `null` value removes the key.
    pub context: Map<String, Value>,
    /// New active flag.
    pub active: Option<bool>,
    /// Push expiry to `now + TTL` if that is later.
    pub renew: bool,
}

/// Concurrent session map with TTL expiry.
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    ttl: Duration,
    events: EventBus,
}

impl SessionStore {
    /// Create a store whose sessions live for `ttl`.
    pub fn new(ttl: std::time::Duration, events: EventBus) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(24)),
            events,
        }
    }

    /// Return the live session or create it for `user_id`.
    ///
    /// An existing session is returned unchanged, whoever owns it; the
    /// caller compares owners. An expired but unswept entry is replaced.
    pub fn get_or_create(&self, id: &SessionId, user_id: &UserId) -> Session {
        self.get_or_create_at(id, user_id, Utc::now())
    }

    pub(crate) fn get_or_create_at(&self, id: &SessionId, user_id: &UserId, now: DateTime<Utc>) -> Session {
        let (session, created) = match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired_at(now) {
                    let _ = e.insert(Session::new(id.clone(), user_id.clone(), now, self.ttl));
                    (e.get().clone(), true)
                } else {
                    (e.get().clone(), false)
                }
            }
            Entry::Vacant(e) => {
                let s = e.insert(Session::new(id.clone(), user_id.clone(), now, self.ttl));
                (s.clone(), true)
            }
        };
        if created {
            info!(session_id = %id, user_id = %user_id, expires_at = %session.expires_at, "session created");
            self.events.publish(GatewayEvent::SessionCreated {
                session_id: id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        session
    }

    /// Live session, if any.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        let now = Utc::now();
        self.sessions
            .get(id)
            .filter(|s| !s.is_expired_at(now))
            .map(|s| s.clone())
    }

    /// Owner of a live session.
    pub fn owner_of(&self, id: &SessionId) -> Option<UserId> {
        self.get(id).map(|s| s.user_id)
    }

    /// Record one dispatched message. Returns `false` for missing or expired sessions.
    pub fn touch(&self, id: &SessionId) -> bool {
        self.touch_at(id, Utc::now())
    }

    pub(crate) fn touch_at(&self, id: &SessionId, now: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut s) if !s.is_expired_at(now) => {
                s.last_activity = now;
                s.message_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Apply a patch. Ownership must be checked by the caller.
    pub fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<Session, GatewayError> {
        self.update_at(id, patch, Utc::now())
    }

    pub(crate) fn update_at(
        &self,
        id: &SessionId,
        patch: SessionPatch,
        now: DateTime<Utc>,
    ) -> Result<Session, GatewayError> {
        let mut s = match self.sessions.get_mut(id) {
            Some(s) if !s.is_expired_at(now) => s,
            _ => return Err(GatewayError::SessionExpired(id.to_string())),
        };
        for (key, value) in patch.context {
            if value.is_null() {
                let _ = s.context.remove(&key);
            } else {
                let _ = s.context.insert(key, value);
            }
        }
        if let Some(active) = patch.active {
            s.active = active;
        }
        if patch.renew {
            s.expires_at = s.expires_at.max(now + self.ttl);
        }
        s.updated_at = now;
        debug!(session_id = %id, keys = s.context.len(), "session updated");
        Ok(s.clone())
    }

    /// Remove expired sessions and publish `session_expired` for each.
    pub fn sweep_expired(&self) -> Vec<SessionId> {
        self.sweep_expired_at(Utc::now())
    }

    pub(crate) fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some((id, session)) = self.sessions.remove_if(&id, |_, s| s.is_expired_at(now)) {
                self.events.publish(GatewayEvent::SessionExpired {
                    session_id: id.to_string(),
                    user_id: session.user_id.to_string(),
                });
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            info!(expired = removed.len(), remaining = self.sessions.len(), "swept expired sessions");
        }
        removed
    }

    /// Drop a session immediately.
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Stored sessions, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions that are live and flagged active.
    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        self.sessions
            .iter()
            .filter(|s| s.active && !s.is_expired_at(now))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sid(s: &str) -> SessionId {
        SessionId::parse(s).unwrap()
    }

    fn store() -> (SessionStore, tokio::sync::broadcast::Receiver<GatewayEvent>) {
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        (SessionStore::new(std::time::Duration::from_secs(24 * 3600), bus), rx)
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let (store, _rx) = store();
        let a = store.get_or_create(&sid("abc12345"), &UserId::from("u1"));
        let b = store.get_or_create(&sid("abc12345"), &UserId::from("u1"));
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn new_session_expires_after_ttl() {
        let (store, _rx) = store();
        let now = Utc::now();
        let s = store.get_or_create_at(&sid("abc12345"), &UserId::from("u1"), now);
        assert_eq!(s.expires_at, now + Duration::hours(24));
        assert!(s.active);
        assert_eq!(s.message_count, 0);
    }

    #[test]
    fn creation_publishes_event_once() {
        let (store, mut rx) = store();
        let _ = store.get_or_create(&sid("abc12345"), &UserId::from("u1"));
        let _ = store.get_or_create(&sid("abc12345"), &UserId::from("u1"));
        assert_eq!(rx.try_recv().unwrap().event_type(), "session_created");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn existing_session_keeps_original_owner() {
        let (store, _rx) = store();
        let _ = store.get_or_create(&sid("abc12345"), &UserId::from("u1"));
        let s = store.get_or_create(&sid("abc12345"), &UserId::from("intruder"));
        assert_eq!(s.user_id.as_str(), "u1");
    }

    #[test]
    fn expired_sessions_are_invisible_before_sweep() {
        let (store, _rx) = store();
        let past = Utc::now() - Duration::hours(25);
        let old = store.get_or_create_at(&sid("abc12345"), &UserId::from("u1"), past);
        assert!(store.get(&sid("abc12345")).is_none());
        assert!(!store.touch(&sid("abc12345")));
        let fresh = store.get_or_create(&sid("abc12345"), &UserId::from("u1"));
        assert!(fresh.created_at > old.created_at);
    }

    #[test]
    fn touch_bumps_activity() {
        let (store, _rx) = store();
        let start = Utc::now();
        let _ = store.get_or_create_at(&sid("abc12345"), &UserId::from("u1"), start);
        let later = start + Duration::seconds(5);
        assert!(store.touch_at(&sid("abc12345"), later));
        assert!(store.touch_at(&sid("abc12345"), later));
        let s = store.get(&sid("abc12345")).unwrap();
        assert_eq!(s.message_count, 2);
        assert_eq!(s.last_activity, later);
        assert_eq!(s.updated_at, start);
    }

    #[test]
    fn concurrent_touches_do_not_lose_increments() {
        let (store, _rx) = store();
        let store = std::sync::Arc::new(store);
        let _ = store.get_or_create(&sid("abc12345"), &UserId::from("u1"));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(store.touch(&sid("abc12345")));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(store.get(&sid("abc12345")).unwrap().message_count, 800);
    }

    #[test]
    fn update_merges_and_removes_context_keys() {
        let (store, _rx) = store();
        let id = sid("abc12345");
        let _ = store.get_or_create(&id, &UserId::from("u1"));
        let mut context = Map::new();
        let _ = context.insert("lang".into(), json!("pt-BR"));
        let _ = context.insert("clinic".into(), json!("centro"));
        let _ = store
            .update(&id, SessionPatch { context, ..SessionPatch::default() })
            .unwrap();
        let mut removal = Map::new();
        let _ = removal.insert("clinic".into(), Value::Null);
        let s = store
            .update(&id, SessionPatch { context: removal, ..SessionPatch::default() })
            .unwrap();
        assert_eq!(s.context.get("lang"), Some(&json!("pt-BR")));
        assert!(!s.context.contains_key("clinic"));
        assert!(s.updated_at >= s.created_at);
    }

    #[test]
    fn renew_never_moves_expiry_backward() {
        let bus = EventBus::new(4);
        let store = SessionStore::new(std::time::Duration::from_secs(3600), bus);
        let id = sid("abc12345");
        let now = Utc::now();
        let created = store.get_or_create_at(&id, &UserId::from("u1"), now);

        let renewed = store
            .update_at(&id, SessionPatch { renew: true, ..SessionPatch::default() }, now + Duration::minutes(30))
            .unwrap();
        assert_eq!(renewed.expires_at, now + Duration::minutes(90));

        let earlier = store
            .update_at(&id, SessionPatch { renew: true, ..SessionPatch::default() }, now)
            .unwrap();
        assert_eq!(earlier.expires_at, renewed.expires_at);
        assert!(earlier.expires_at > created.expires_at);
    }

    #[test]
    fn update_of_missing_session_fails() {
        let (store, _rx) = store();
        let err = store
            .update(&sid("missing1"), SessionPatch::default())
            .unwrap_err();
        assert_eq!(err.code(), clinic_core::ErrorCode::SessionExpired);
    }

    #[test]
    fn sweep_removes_expired_and_publishes() {
        let (store, mut rx) = store();
        let now = Utc::now();
        let _ = store.get_or_create_at(&sid("oldsession"), &UserId::from("u1"), now - Duration::hours(30));
        let _ = store.get_or_create_at(&sid("newsession"), &UserId::from("u2"), now);
        while rx.try_recv().is_ok() {}

        let removed = store.sweep_expired_at(now);
        assert_eq!(removed, vec![sid("oldsession")]);
        assert_eq!(store.len(), 1);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.event_type(), "session_expired");
        assert_eq!(ev.session_id(), Some("oldsession"));
    }

    #[test]
    fn active_count_ignores_deactivated() {
        let (store, _rx) = store();
        let a = sid("session-a1");
        let _ = store.get_or_create(&a, &UserId::from("u1"));
        let _ = store.get_or_create(&sid("session-b1"), &UserId::from("u1"));
        let _ = store
            .update(&a, SessionPatch { active: Some(false), ..SessionPatch::default() })
            .unwrap();
        assert_eq!(store.active_count(), 1);
    }
}
