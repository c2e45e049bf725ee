//! Per-peer routing of message sessions.

use super::{MessageSession, SignalingHandler};
use crate::config::SessionConfig;
use crate::transport::{Transport, TransportKind};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

type RelayFactory = Box<dyn Fn(&str) -> Option<Arc<dyn Transport>> + Send + Sync>;

/// Map of message sessions keyed by peer identity.
///
/// Sessions are created on first use with the router's configuration, its
/// signaling handlers and, when a relay factory is set, a relay transport
/// addressed to the peer.
pub struct SessionRouter {
    config: SessionConfig,
    sessions: DashMap<String, Arc<MessageSession>>,
    handlers: RwLock<Vec<Arc<dyn SignalingHandler>>>,
    relay_factory: Option<RelayFactory>,
}

impl SessionRouter {
    /// Router creating sessions with `config`
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            relay_factory: None,
        }
    }

    /// Give every new session the relay transport built by `factory`
    #[must_use]
    pub fn with_relay<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Option<Arc<dyn Transport>> + Send + Sync + 'static,
    {
        self.relay_factory = Some(Box::new(factory));
        self
    }

    /// Register a handler on every current and future session
    pub fn add_handler(&self, handler: Arc<dyn SignalingHandler>) {
        for session in self.sessions.iter() {
            session.add_handler(Arc::clone(&handler));
        }
        self.handlers.write().push(handler);
    }

    /// Session with `remote`, created if absent
    pub fn get_or_create(&self, remote: &str) -> Arc<MessageSession> {
        if let Some(session) = self.sessions.get(remote) {
            return Arc::clone(session.value());
        }

        let session = Arc::clone(
            self.sessions
                .entry(remote.to_string())
                .or_insert_with(|| {
                    debug!(remote, "creating message session");
                    let session = MessageSession::new(remote, self.config.clone());
                    for handler in self.handlers.read().iter() {
                        session.add_handler(Arc::clone(handler));
                    }
                    session
                })
                .value(),
        );

        if session.active_transport().is_none() {
            if let Some(relay) = self.relay_factory.as_ref().and_then(|f| f(remote)) {
                session.set_relay_transport(Some(relay));
            }
        }
        session
    }

    /// Existing session with `remote`
    #[must_use]
    pub fn get(&self, remote: &str) -> Option<Arc<MessageSession>> {
        self.sessions.get(remote).map(|s| Arc::clone(s.value()))
    }

    /// Deliver a relay frame from `remote`
    pub fn route_relay(&self, remote: &str, frame: &[u8]) {
        self.get_or_create(remote)
            .receive_bytes(TransportKind::Relay, frame);
    }

    /// Close and forget the session with `remote`
    pub fn remove(&self, remote: &str) -> Option<Arc<MessageSession>> {
        let (_, session) = self.sessions.remove(remote)?;
        session.close();
        Some(session)
    }

    /// Number of sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        self.sessions.clear();
        for session in sessions {
            session.close();
        }
    }
}

impl std::fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRouter")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
