//! Coordinator-side client sessions. Only the coordinator loop touches the registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::client_proxy::ClientProxy;
use crate::protocol::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Fitting,
    Evaluating,
    Idle,
    Disconnected,
}

pub struct ClientSession {
    pub id: ClientId,
    pub connection_id: Uuid,
    pub status: SessionStatus,
    pub connected_at: DateTime<Utc>,
    /// Deadline of the phase the client is currently serving.
    pub deadline: Option<Instant>,
    /// Sample count from the client's most recent accepted result.
    pub last_num_examples: Option<u64>,
    pub failures: u32,
    proxy: Option<Arc<dyn ClientProxy>>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("status", &self.status)
            .field("last_num_examples", &self.last_num_examples)
            .field("failures", &self.failures)
            .finish()
    }
}

impl ClientSession {
    fn new(id: ClientId, proxy: Arc<dyn ClientProxy>) -> Self {
        Self {
            id,
            connection_id: Uuid::new_v4(),
            status: SessionStatus::Connected,
            connected_at: Utc::now(),
            deadline: None,
            last_num_examples: None,
            failures: 0,
            proxy: Some(proxy),
        }
    }

    pub fn is_live(&self) -> bool {
        self.status != SessionStatus::Disconnected
    }

    pub fn proxy(&self) -> Option<Arc<dyn ClientProxy>> {
        self.proxy.clone()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<ClientId, ClientSession>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(Uuid),
    AlreadyConnected,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. A live session with the same id blocks admission; a disconnected one is replaced.
    pub fn connect(&mut self, id: ClientId, proxy: Arc<dyn ClientProxy>) -> Admission {
        if self.sessions.get(&id).is_some_and(ClientSession::is_live) {
            return Admission::AlreadyConnected;
        }
        let session = ClientSession::new(id.clone(), proxy);
        let connection_id = session.connection_id;
        info!(client_id = %id, %connection_id, "client_connected");
        self.sessions.insert(id, session);
        Admission::Admitted(connection_id)
    }

    /// Mark disconnected and release the proxy. Returns false when there was no live session.
    pub fn disconnect(&mut self, id: &ClientId, reason: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(s) if s.is_live() => {
                s.status = SessionStatus::Disconnected;
                s.deadline = None;
                s.proxy = None;
                info!(client_id = %id, reason, "client_disconnected");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &ClientId) -> Option<&ClientSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &ClientId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(id)
    }

    /// Whether `connection_id` still names the live session for `id`.
    pub fn is_current(&self, id: &ClientId, connection_id: Uuid) -> bool {
        self.sessions.get(id).is_some_and(|s| s.is_live() && s.connection_id == connection_id)
    }

    /// Live session ids in ascending order.
    pub fn available(&self) -> Vec<ClientId> {
        self.sessions.values().filter(|s| s.is_live()).map(|s| s.id.clone()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_live()).count()
    }

    pub fn set_status(&mut self, id: &ClientId, status: SessionStatus, deadline: Option<Instant>) {
        if let Some(s) = self.sessions.get_mut(id).filter(|s| s.is_live()) {
            debug!(client_id = %id, from = ?s.status, to = ?status, "session_status");
            s.status = status;
            s.deadline = deadline;
        }
    }

    /// Take every live proxy and mark all sessions disconnected.
    pub fn drain(&mut self) -> Vec<(ClientId, Arc<dyn ClientProxy>)> {
        let mut out = Vec::new();
        for s in self.sessions.values_mut() {
            if let Some(p) = s.proxy.take() {
                out.push((s.id.clone(), p));
            }
            s.status = SessionStatus::Disconnected;
            s.deadline = None;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_proxy::LocalClientProxy;
    use crate::testing::ConstantTrainer;

    fn proxy(id: &str) -> Arc<dyn ClientProxy> {
        Arc::new(LocalClientProxy::new(ClientId::from(id), ConstantTrainer::new(&[1.0], 1)))
    }

    #[test]
    fn duplicate_live_connect_is_refused() {
        let mut reg = SessionRegistry::new();
        let first = reg.connect("a".into(), proxy("a"));
        assert!(matches!(first, Admission::Admitted(_)));
        assert_eq!(reg.connect("a".into(), proxy("a")), Admission::AlreadyConnected);
        assert_eq!(reg.live_count(), 1);
    }

    #[test]
    fn reconnect_after_disconnect_gets_new_connection() {
        let mut reg = SessionRegistry::new();
        let Admission::Admitted(old) = reg.connect("a".into(), proxy("a")) else { panic!("not admitted") };
        assert!(reg.disconnect(&"a".into(), "test"));
        assert!(!reg.disconnect(&"a".into(), "again"));
        assert!(reg.get(&"a".into()).unwrap().proxy().is_none());
        let Admission::Admitted(new) = reg.connect("a".into(), proxy("a")) else { panic!("not admitted") };
        assert_ne!(old, new);
        assert!(reg.is_current(&"a".into(), new));
        assert!(!reg.is_current(&"a".into(), old));
    }

    #[test]
    fn available_is_sorted_and_skips_disconnected() {
        let mut reg = SessionRegistry::new();
        for id in ["c", "a", "b"] {
            reg.connect(id.into(), proxy(id));
        }
        reg.disconnect(&"b".into(), "gone");
        assert_eq!(reg.available(), vec![ClientId::from("a"), ClientId::from("c")]);
        reg.set_status(&"b".into(), SessionStatus::Fitting, None);
        assert_eq!(reg.get(&"b".into()).unwrap().status, SessionStatus::Disconnected);
        assert_eq!(reg.drain().len(), 2);
        assert_eq!(reg.live_count(), 0);
    }
}
