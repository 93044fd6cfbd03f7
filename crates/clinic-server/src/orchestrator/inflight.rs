//! Cancellation handles of queries being executed.

use clinic_core::ids::{ConnectionId, QueryId, UserId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Why a query was aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Client sent `cancel`.
    Cancelled,
    /// Originating connection went away.
    Disconnected,
    /// Server is shutting down.
    Shutdown,
}

impl AbortReason {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Disconnected => "disconnected",
            Self::Shutdown => "shutdown",
        }
    }
}

pub(crate) struct InFlightQuery {
    pub(crate) token: CancellationToken,
    pub(crate) connection_id: ConnectionId,
    reason: Mutex<Option<AbortReason>>,
}

/// Query ids are chosen by clients, so they are only unique per user.
type InFlightKey = (UserId, QueryId);

/// Live queries by owner and id.
#[derive(Default)]
pub(crate) struct InFlightRegistry {
    queries: DashMap<InFlightKey, InFlightQuery>,
}

impl InFlightRegistry {
    /// Register a query. `None` if `user_id` already has `query_id` in flight.
    pub(crate) fn insert(
        &self,
        user_id: &UserId,
        query_id: &QueryId,
        connection_id: ConnectionId,
    ) -> Option<CancellationToken> {
        match self.queries.entry((user_id.clone(), query_id.clone())) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                let _ = slot.insert(InFlightQuery {
                    token: token.clone(),
                    connection_id,
                    reason: Mutex::new(None),
                });
                Some(token)
            }
        }
    }

    /// Cancel one of `owner`'s queries. A query already being aborted
    /// counts as not in flight.
    pub(crate) fn cancel(&self, owner: &UserId, query_id: &QueryId, reason: AbortReason) -> bool {
        match self.queries.get(&(owner.clone(), query_id.clone())) {
            Some(q) if !q.token.is_cancelled() => {
                abort(&q, reason);
                true
            }
            _ => false,
        }
    }

    /// Cancel every query started from `connection_id`.
    pub(crate) fn cancel_for_connection(&self, connection_id: &ConnectionId, reason: AbortReason) -> usize {
        let mut n = 0;
        for q in &self.queries {
            if q.connection_id == *connection_id {
                abort(&q, reason);
                n += 1;
            }
        }
        n
    }

    /// Cancel everything.
    pub(crate) fn cancel_all(&self, reason: AbortReason) -> usize {
        let mut n = 0;
        for q in &self.queries {
            abort(&q, reason);
            n += 1;
        }
        n
    }

    /// Reason recorded by the first cancel, if any.
    pub(crate) fn abort_reason(&self, owner: &UserId, query_id: &QueryId) -> Option<AbortReason> {
        self.queries
            .get(&(owner.clone(), query_id.clone()))
            .and_then(|q| *q.reason.lock())
    }

    pub(crate) fn remove(&self, owner: &UserId, query_id: &QueryId) {
        let _ = self.queries.remove(&(owner.clone(), query_id.clone()));
    }

    pub(crate) fn len(&self) -> usize {
        self.queries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

fn abort(query: &InFlightQuery, reason: AbortReason) {
    {
        let mut r = query.reason.lock();
        if r.is_none() {
            *r = Some(reason);
        }
    }
    query.token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qid(s: &str) -> QueryId {
        QueryId::from(s)
    }

    fn user(s: &str) -> UserId {
        UserId::from(s)
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let reg = InFlightRegistry::default();
        assert!(reg.insert(&user("u1"), &qid("q1"), ConnectionId::from("c1")).is_some());
        assert!(reg.insert(&user("u1"), &qid("q1"), ConnectionId::from("c1")).is_none());
        reg.remove(&user("u1"), &qid("q1"));
        assert!(reg.insert(&user("u1"), &qid("q1"), ConnectionId::from("c1")).is_some());
    }

    #[test]
    fn same_id_from_different_users_runs_independently() {
        let reg = InFlightRegistry::default();
        let a = reg.insert(&user("u1"), &qid("msg-1"), ConnectionId::from("c1")).unwrap();
        let b = reg.insert(&user("u2"), &qid("msg-1"), ConnectionId::from("c2")).unwrap();
        assert_eq!(reg.len(), 2);

        assert!(reg.cancel(&user("u2"), &qid("msg-1"), AbortReason::Cancelled));
        assert!(!a.is_cancelled());
        assert!(b.is_cancelled());

        reg.remove(&user("u2"), &qid("msg-1"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.abort_reason(&user("u1"), &qid("msg-1")), None);
    }

    #[test]
    fn cancel_respects_owner() {
        let reg = InFlightRegistry::default();
        let token = reg.insert(&user("u1"), &qid("q1"), ConnectionId::from("c1")).unwrap();
        assert!(!reg.cancel(&user("u2"), &qid("q1"), AbortReason::Cancelled));
        assert!(!token.is_cancelled());
        assert!(reg.cancel(&user("u1"), &qid("q1"), AbortReason::Cancelled));
        assert!(token.is_cancelled());
        assert!(!reg.cancel(&user("u1"), &qid("q1"), AbortReason::Cancelled));
        assert!(!reg.cancel(&user("u1"), &qid("nope"), AbortReason::Cancelled));
    }

    #[test]
    fn first_reason_wins() {
        let reg = InFlightRegistry::default();
        let _ = reg.insert(&user("u1"), &qid("q1"), ConnectionId::from("c1"));
        assert!(reg.cancel(&user("u1"), &qid("q1"), AbortReason::Cancelled));
        let _ = reg.cancel_all(AbortReason::Shutdown);
        assert_eq!(reg.abort_reason(&user("u1"), &qid("q1")), Some(AbortReason::Cancelled));
    }

    #[test]
    fn cancel_for_connection_only_touches_its_queries() {
        let reg = InFlightRegistry::default();
        let a = reg.insert(&user("u1"), &qid("q1"), ConnectionId::from("c1")).unwrap();
        let b = reg.insert(&user("u1"), &qid("q2"), ConnectionId::from("c2")).unwrap();
        assert_eq!(reg.cancel_for_connection(&ConnectionId::from("c1"), AbortReason::Disconnected), 1);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert_eq!(reg.len(), 2);
    }
}
