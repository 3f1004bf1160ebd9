//! `SessionTable`: `SessionKey -> Session`.

use crate::addr::SessionKey;
use crate::session::Session;
use hashbrown::HashMap;

/// Owns every live `Session` exclusively. Removal destroys the KCP control block, closes
/// the TCP fd and returns ownership of its buffers for the pool/caller to reclaim.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<SessionKey, Session>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.key(), session);
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(key)
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<Session> {
        self.sessions.remove(key)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionKey, &Session)> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SessionKey, &mut Session)> {
        self.sessions.iter_mut()
    }

    /// Removes every session for which `predicate` returns true, returning them for the
    /// caller to finalize (close TCP, reclaim buffers). Used by the timeout sweep and by
    /// bulk session-0 RESET handling.
    pub fn retain_remove<F: FnMut(&Session) -> bool>(&mut self, mut predicate: F) -> Vec<Session> {
        let doomed: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| predicate(s))
            .map(|(k, _)| *k)
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| self.sessions.remove(&k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, Codec};
    use crate::msgframe::FramePool;
    use crate::queue::PacketQueue;
    use crate::session::{KcpTuning, SharedIo};
    use std::cell::RefCell;
    use std::net::SocketAddr;
    use std::rc::Rc;
    use std::time::Instant;

    fn make_session(peer: SocketAddr, conv: u32) -> Session {
        let key = SessionKey::new(peer, conv);
        let io = SharedIo {
            pool: Rc::new(RefCell::new(FramePool::new(4))),
            send: Rc::new(RefCell::new(PacketQueue::new(4))),
            codec: Rc::new(RefCell::new(Codec::new(crypto::generate_key(), true))),
        };
        let log = crate::logging::root_logger(crate::logging::Verbosity::Quiet);
        Session::new(key, peer, true, &KcpTuning::default(), io, Instant::now(), log)
    }

    #[test]
    fn insert_get_remove() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut table = SessionTable::new();
        let key = SessionKey::new(peer, 1);
        table.insert(make_session(peer, 1));

        assert!(table.contains(&key));
        assert_eq!(table.len(), 1);

        let removed = table.remove(&key);
        assert!(removed.is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn retain_remove_collects_matching() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut table = SessionTable::new();
        table.insert(make_session(peer, 1));
        table.insert(make_session(peer, 2));

        let removed = table.retain_remove(|s| s.key().conv() == 1);
        assert_eq!(removed.len(), 1);
        assert_eq!(table.len(), 1);
    }
}
