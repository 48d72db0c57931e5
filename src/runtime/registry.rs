//! Live sessions keyed by socket.

use crate::runtime::context::SocketId;
use crate::runtime::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Shared map from socket to session.
///
/// A session is torn down when the last `Arc` drops, which may be here, on
/// a worker still handling one of its completions, or in application code
/// that kept it. Removed sessions are always returned to the caller so they
/// drop outside the lock.
///
/// Removed sessions stay reachable as retired entries while anything else
/// keeps them alive, so late completions can still return their contexts.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SocketId, Arc<Session>>>,
    retired: Mutex<HashMap<SocketId, Weak<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.lock().insert(session.id(), session);
    }

    pub fn get(&self, id: SocketId) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: SocketId) -> Option<Arc<Session>> {
        let session = self.sessions.lock().remove(&id)?;
        let mut retired = self.retired.lock();
        retired.retain(|_, weak| weak.strong_count() > 0);
        retired.insert(id, Arc::downgrade(&session));
        Some(session)
    }

    /// A removed session that is still referenced elsewhere.
    pub fn get_retired(&self, id: SocketId) -> Option<Arc<Session>> {
        self.retired.lock().get(&id).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every session out of the registry.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.retired.lock().clear();
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::SocketContextPool;
    use crate::runtime::port::{test_submitter, SocketHandle, Submission};
    use crate::runtime::session::Callbacks;
    use crate::runtime::stats::ResourceStats;

    #[test]
    fn test_insert_get_remove() {
        let (submitter, rx, _poll) = test_submitter();
        let stats = Arc::new(ResourceStats::new());
        let registry = SessionRegistry::new();

        for id in 0..3 {
            let pool = SocketContextPool::new(
                SocketHandle::new(SocketId(id), submitter.clone()),
                Arc::clone(&stats),
            );
            registry.insert(Arc::new(Session::new(
                pool,
                "127.0.0.1:1".parse().unwrap(),
                "127.0.0.1:2".parse().unwrap(),
                Arc::new(Callbacks::default()),
                submitter.clone(),
                Arc::clone(&stats),
            )));
        }
        assert_eq!(registry.len(), 3);

        let session = registry.get(SocketId(1)).unwrap();
        assert_eq!(session.id(), SocketId(1));
        assert!(registry.get(SocketId(9)).is_none());

        let removed = registry.remove(SocketId(1)).unwrap();
        assert!(registry.remove(SocketId(1)).is_none());
        assert!(registry.get(SocketId(1)).is_none());
        assert_eq!(registry.len(), 2);

        // Still referenced here, so the socket stays open and the session
        // can be found as retired
        drop(removed);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.get_retired(SocketId(1)).unwrap().id(), SocketId(1));

        drop(session);
        assert!(matches!(rx.try_recv(), Ok(Submission::Close(SocketId(1)))));
        assert!(registry.get_retired(SocketId(1)).is_none());

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
