//! Resolves transport ids to live transports, caches them per broker
//! configuration, and broadcasts transport failures to interested parties.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::contract::{Destination, TransportInfo};
use crate::error::{MessagingError, Result};
use crate::utils::{call_only_once, FailureHook, Subscription};

use super::in_memory::InMemoryTransportFactory;
use super::resolved::ResolvedTransport;
use super::{DestinationUsage, MessagingSession, TransportFactory, TransportResolver};

/// Lifecycle events broadcast per transport id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Failure,
}

pub type TransportEventCallback = Arc<dyn Fn(&str, TransportEvent) + Send + Sync>;

pub struct TransportManager {
    resolver: Arc<dyn TransportResolver>,
    factories: HashMap<String, Arc<dyn TransportFactory>>,
    transports: DashMap<TransportInfo, Arc<ResolvedTransport>>,
    listeners: Arc<DashMap<u64, TransportEventCallback>>,
    next_listener_id: AtomicU64,
    disposed: AtomicBool,
    /// Handed to transport failure hooks without keeping the manager alive.
    self_ref: Weak<TransportManager>,
}

impl TransportManager {
    /// The in-memory factory is always available; explicit factories with the
    /// same kind name take precedence.
    pub fn new(
        resolver: Arc<dyn TransportResolver>,
        factories: Vec<Arc<dyn TransportFactory>>,
    ) -> Arc<Self> {
        let mut by_name: HashMap<String, Arc<dyn TransportFactory>> = HashMap::new();
        let in_memory: Arc<dyn TransportFactory> = Arc::new(InMemoryTransportFactory);
        by_name.insert(in_memory.name().to_string(), in_memory);
        for factory in factories {
            by_name.insert(factory.name().to_string(), factory);
        }
        Arc::new_cyclic(|self_ref| TransportManager {
            resolver,
            factories: by_name,
            transports: DashMap::new(),
            listeners: Arc::new(DashMap::new()),
            next_listener_id: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn resolve_transport_info(&self, transport_id: &str) -> Result<TransportInfo> {
        self.resolver
            .get_transport(transport_id)
            .ok_or_else(|| MessagingError::UnresolvableTransport {
                transport_id: transport_id.to_string(),
            })
    }

    fn resolve_transport(&self, transport_id: &str) -> Result<Arc<ResolvedTransport>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MessagingError::disposed("TransportManager"));
        }
        let info = self.resolve_transport_info(transport_id)?;

        if let Some(existing) = self.transports.get(&info) {
            existing.add_known_id(transport_id);
            return Ok(existing.clone());
        }

        let factory = self.factories.get(&info.messaging).ok_or_else(|| {
            MessagingError::UnsupportedMessaging {
                transport_id: transport_id.to_string(),
                kind: info.messaging.clone(),
            }
        })?;

        let manager = self.self_ref.clone();
        let failed_info = info.clone();
        let on_failure = call_only_once(move || {
            Self::on_transport_failed(&manager, &failed_info);
        });
        let transport = factory.create(&info, on_failure)?;
        let created = Arc::new(ResolvedTransport::new(info.clone(), transport, transport_id));

        // A racing resolver may have installed an entry meanwhile; the loser
        // discards its freshly-created transport.
        match self.transports.entry(info) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                created.dispose();
                existing.get().add_known_id(transport_id);
                Ok(existing.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(transport = %created.info(), "created transport");
                slot.insert(created.clone());
                Ok(created)
            }
        }
    }

    fn on_transport_failed(manager: &Weak<TransportManager>, info: &TransportInfo) {
        if let Some(manager) = manager.upgrade() {
            manager.process_transport_failure(info);
        }
    }

    /// Evicts the failed transport, marks its cached sessions as failed, and
    /// notifies event listeners once per transport id known to have resolved
    /// to it.
    pub(crate) fn process_transport_failure(&self, info: &TransportInfo) {
        let Some((_, resolved)) = self.transports.remove(info) else {
            return;
        };
        warn!(transport = %info, "transport failure, evicting instance");
        let ids = resolved.known_ids();
        resolved.notify_session_failures();
        resolved.dispose();

        let listeners: Vec<TransportEventCallback> =
            self.listeners.iter().map(|e| e.value().clone()).collect();
        for id in &ids {
            for listener in &listeners {
                listener(id, TransportEvent::Failure);
            }
        }
    }

    /// Returns the session named `session_name` on the transport behind
    /// `transport_id`, creating transport and session as needed. `on_failure`
    /// is invoked if that session later fails.
    pub fn get_messaging_session(
        &self,
        transport_id: &str,
        session_name: &str,
        on_failure: Option<FailureHook>,
    ) -> Result<Arc<dyn MessagingSession>> {
        let resolved = self.resolve_transport(transport_id)?;
        resolved.get_or_create_session(session_name, on_failure)
    }

    pub fn verify_destination(
        &self,
        transport_id: &str,
        destination: &Destination,
        usage: DestinationUsage,
        configure_if_required: bool,
    ) -> Result<()> {
        let resolved = self.resolve_transport(transport_id)?;
        resolved
            .transport()
            .verify_destination(destination, usage, configure_if_required)
    }

    /// Registers a listener for transport lifecycle events. Disposing the
    /// returned handle unregisters it.
    pub fn subscribe_on_transport_events(&self, callback: TransportEventCallback) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(id, callback);
        let listeners = self.listeners.clone();
        Subscription::new(move || {
            listeners.remove(&id);
        })
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<_> = self
            .transports
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (info, resolved) in entries {
            self.transports.remove(&info);
            resolved.dispose();
        }
        self.listeners.clear();
    }
}
