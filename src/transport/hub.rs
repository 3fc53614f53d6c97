use super::dedup::InboundDedup;
use super::reliable::ReliableSender;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Transport pair bound to one live agent connection.
pub struct Connection {
    pub id: String,
    pub organization_id: String,
    pub sender: Arc<ReliableSender>,
    pub dedup: Arc<InboundDedup>,
}

/// Live connections keyed by connection id.
#[derive(Default)]
pub struct ConnectionHub {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection`, returning the one it replaced, if any.
    pub fn register(&self, connection: Connection) -> Option<Arc<Connection>> {
        self.connections
            .write()
            .insert(connection.id.clone(), Arc::new(connection))
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(connection_id).cloned()
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.write().remove(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
