//! Per-peer sequence sessions.
//!
//! A session is keyed by the sender's node name and pinned to the sender's
//! instance uuid. Only a hello may open (or re-open) a session; after that,
//! sequence numbers must strictly increase and may not jump by more than
//! [`MSG_MAX_SEQ_DELTA`]. A jump invalidates the session until the peer
//! says hello again.

use std::collections::HashMap;

use avail_core::{MSG_MAX_SEQ_DELTA, NODE_MAX};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    Accept,
    /// `seq` not greater than the last accepted one.
    Stale,
    /// Gap beyond the allowed delta; session dropped.
    Invalidated,
    /// No valid session and this is not a hello.
    NeedHello,
}

impl SeqVerdict {
    pub fn accepted(&self) -> bool {
        matches!(self, SeqVerdict::Accept)
    }
}

#[derive(Debug, Clone)]
struct Session {
    instance: Uuid,
    last_seq: u64,
    valid: bool,
    last_used: u64,
}

#[derive(Debug)]
pub struct PeerSessions {
    sessions: HashMap<String, Session>,
    capacity: usize,
    clock: u64,
}

impl PeerSessions {
    pub fn new() -> Self {
        Self::with_capacity(NODE_MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity,
            clock: 0,
        }
    }

    pub fn accept(&mut self, node: &str, instance: Uuid, seq: u64, is_hello: bool) -> SeqVerdict {
        self.clock += 1;
        let clock = self.clock;

        let Some(session) = self.sessions.get_mut(node) else {
            if !is_hello {
                debug!(%node, seq, "no session for peer, waiting for hello");
                return SeqVerdict::NeedHello;
            }
            self.open(node, instance, seq);
            return SeqVerdict::Accept;
        };

        if session.instance != instance || !session.valid {
            if !is_hello {
                debug!(%node, seq, "session not valid for this instance, waiting for hello");
                return SeqVerdict::NeedHello;
            }
            info!(%node, %instance, seq, "peer session re-established");
            *session = Session {
                instance,
                last_seq: seq,
                valid: true,
                last_used: clock,
            };
            return SeqVerdict::Accept;
        }

        if seq <= session.last_seq {
            debug!(%node, seq, last = session.last_seq, "stale sequence number");
            return SeqVerdict::Stale;
        }
        if seq - session.last_seq > MSG_MAX_SEQ_DELTA {
            warn!(
                %node,
                seq,
                last = session.last_seq,
                "sequence gap too large, invalidating peer session"
            );
            session.valid = false;
            return SeqVerdict::Invalidated;
        }

        session.last_seq = seq;
        session.last_used = clock;
        SeqVerdict::Accept
    }

    fn open(&mut self, node: &str, instance: Uuid, seq: u64) {
        if self.sessions.len() >= self.capacity {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(name, _)| name.clone());
            if let Some(name) = oldest {
                debug!(evicted = %name, "peer session table full, evicting least recently used");
                self.sessions.remove(&name);
            }
        }
        info!(%node, %instance, seq, "peer session established");
        self.sessions.insert(
            node.to_string(),
            Session {
                instance,
                last_seq: seq,
                valid: true,
                last_used: self.clock,
            },
        );
    }

    pub fn is_valid(&self, node: &str) -> bool {
        self.sessions.get(node).is_some_and(|s| s.valid)
    }

    pub fn forget(&mut self, node: &str) {
        self.sessions.remove(node);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for PeerSessions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_must_strictly_increase() {
        let mut sessions = PeerSessions::new();
        let peer = Uuid::new_v4();
        assert_eq!(sessions.accept("c1", peer, 10, true), SeqVerdict::Accept);
        assert_eq!(sessions.accept("c1", peer, 11, false), SeqVerdict::Accept);
        assert_eq!(sessions.accept("c1", peer, 11, false), SeqVerdict::Stale);
        assert_eq!(sessions.accept("c1", peer, 5, false), SeqVerdict::Stale);
        assert_eq!(sessions.accept("c1", peer, 12, false), SeqVerdict::Accept);
    }

    #[test]
    fn large_gap_invalidates_until_hello() {
        let mut sessions = PeerSessions::new();
        let peer = Uuid::new_v4();
        sessions.accept("c1", peer, 100, true);
        assert_eq!(sessions.accept("c1", peer, 1600, false), SeqVerdict::Invalidated);
        assert!(!sessions.is_valid("c1"));
        assert_eq!(sessions.accept("c1", peer, 1601, false), SeqVerdict::NeedHello);
        assert_eq!(sessions.accept("c1", peer, 1602, true), SeqVerdict::Accept);
        assert_eq!(sessions.accept("c1", peer, 1603, false), SeqVerdict::Accept);
    }

    #[test]
    fn gap_at_limit_is_accepted() {
        let mut sessions = PeerSessions::new();
        let peer = Uuid::new_v4();
        sessions.accept("c1", peer, 0, true);
        assert_eq!(sessions.accept("c1", peer, 1000, false), SeqVerdict::Accept);
    }

    #[test]
    fn non_hello_cannot_open_session() {
        let mut sessions = PeerSessions::new();
        assert_eq!(
            sessions.accept("c1", Uuid::new_v4(), 1, false),
            SeqVerdict::NeedHello
        );
        assert!(sessions.is_empty());
    }

    #[test]
    fn restarted_peer_needs_hello() {
        let mut sessions = PeerSessions::new();
        sessions.accept("c1", Uuid::new_v4(), 500, true);
        let restarted = Uuid::new_v4();
        assert_eq!(sessions.accept("c1", restarted, 1, false), SeqVerdict::NeedHello);
        assert_eq!(sessions.accept("c1", restarted, 1, true), SeqVerdict::Accept);
    }

    #[test]
    fn bounded_with_lru_eviction() {
        let mut sessions = PeerSessions::with_capacity(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        sessions.accept("a", a, 1, true);
        sessions.accept("b", b, 1, true);
        sessions.accept("a", a, 2, false);
        sessions.accept("c", c, 1, true);
        assert_eq!(sessions.len(), 2);
        assert!(sessions.is_valid("a"));
        assert!(!sessions.is_valid("b"));
        assert!(sessions.is_valid("c"));
    }
}
