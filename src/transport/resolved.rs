//! Cache entry for one live transport: the ids that resolved to it, and its
//! named sessions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::contract::TransportInfo;
use crate::error::Result;
use crate::utils::FailureHook;

use super::{MessagingSession, Transport};

struct SessionEntry {
    name: String,
    session: Arc<dyn MessagingSession>,
    /// Hooks from every subscriber sharing this session; a session failure
    /// fans out to all of them.
    failure_hooks: Arc<Mutex<Vec<FailureHook>>>,
}

pub(crate) struct ResolvedTransport {
    info: TransportInfo,
    transport: Arc<dyn Transport>,
    known_ids: Mutex<Vec<String>>,
    sessions: Arc<Mutex<Vec<SessionEntry>>>,
}

impl ResolvedTransport {
    pub(crate) fn new(
        info: TransportInfo,
        transport: Arc<dyn Transport>,
        first_id: &str,
    ) -> Self {
        ResolvedTransport {
            info,
            transport,
            known_ids: Mutex::new(vec![first_id.to_string()]),
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn info(&self) -> &TransportInfo {
        &self.info
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn add_known_id(&self, transport_id: &str) {
        let mut ids = self.known_ids.lock();
        if !ids.iter().any(|id| id == transport_id) {
            ids.push(transport_id.to_string());
        }
    }

    pub(crate) fn known_ids(&self) -> Vec<String> {
        self.known_ids.lock().clone()
    }

    /// Returns the session registered under `name`, creating it on first
    /// request. Later callers share the instance; their failure hooks are
    /// appended to the shared list.
    pub(crate) fn get_or_create_session(
        &self,
        name: &str,
        on_failure: Option<FailureHook>,
    ) -> Result<Arc<dyn MessagingSession>> {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.iter().find(|e| e.name == name) {
            if let Some(hook) = on_failure {
                entry.failure_hooks.lock().push(hook);
            }
            return Ok(entry.session.clone());
        }

        let failure_hooks = Arc::new(Mutex::new(match on_failure {
            Some(hook) => vec![hook],
            None => Vec::new(),
        }));
        let cache = self.sessions.clone();
        let hooks = failure_hooks.clone();
        let session_hook: FailureHook = Arc::new(move || {
            // Evict the dead session before reporting, so resubscription gets
            // a fresh one instead of re-subscribing onto the failed instance.
            cache
                .lock()
                .retain(|entry| !Arc::ptr_eq(&entry.failure_hooks, &hooks));
            let snapshot = hooks.lock().clone();
            for hook in snapshot {
                hook();
            }
        });
        let session = self.transport.create_session(session_hook)?;
        sessions.push(SessionEntry {
            name: name.to_string(),
            session: session.clone(),
            failure_hooks,
        });
        Ok(session)
    }

    /// Marks every cached session as failed by firing its registered failure
    /// hooks. Called when the whole transport goes down, so subscribers get
    /// the same signal as for a single-session failure.
    pub(crate) fn notify_session_failures(&self) {
        let hook_lists: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .map(|entry| entry.failure_hooks.clone())
            .collect();
        for hooks in hook_lists {
            let snapshot = hooks.lock().clone();
            for hook in snapshot {
                hook();
            }
        }
    }

    pub(crate) fn dispose(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for entry in sessions {
            entry.session.dispose();
        }
        self.transport.dispose();
    }
}
