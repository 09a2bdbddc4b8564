//! Persistence collaborator for connections. Records are keyed by `guid`.

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::StoreError;
use crate::primitives::Connection;

pub trait ConnectionStore: Send + Sync {
    /// Inserts or replaces the record with the same `guid`.
    fn save(&self, connection: &Connection) -> Result<(), StoreError>;
    fn find_by_id(&self, id: &str) -> Result<Option<Connection>, StoreError>;
    fn find_by_guid(&self, guid: &str) -> Result<Option<Connection>, StoreError>;
    fn all(&self) -> Result<Vec<Connection>, StoreError>;

    fn active(&self) -> Result<Vec<Connection>, StoreError> {
        Ok(self.all()?.into_iter().filter(Connection::is_active).collect())
    }

    fn active_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.active()?.into_iter().map(|connection| connection.name).collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryConnectionStore {
    connections: DashMap<String, Connection>,
}

impl InMemoryConnectionStore {
    pub fn new() -> InMemoryConnectionStore {
        InMemoryConnectionStore::default()
    }
}

impl FromIterator<Connection> for InMemoryConnectionStore {
    fn from_iter<I: IntoIterator<Item = Connection>>(connections: I) -> Self {
        InMemoryConnectionStore {
            connections: connections
                .into_iter()
                .map(|connection| (connection.guid.clone(), connection))
                .collect(),
        }
    }
}

impl ConnectionStore for InMemoryConnectionStore {
    fn save(&self, connection: &Connection) -> Result<(), StoreError> {
        self.connections.insert(connection.guid.clone(), connection.clone());
        Ok(())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Connection>, StoreError> {
        if id.is_empty() {
            return Ok(None);
        }
        Ok(self
            .connections
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.value().clone()))
    }

    fn find_by_guid(&self, guid: &str) -> Result<Option<Connection>, StoreError> {
        Ok(self.connections.get(guid).map(|entry| entry.value().clone()))
    }

    fn all(&self) -> Result<Vec<Connection>, StoreError> {
        let mut connections: Vec<Connection> =
            self.connections.iter().map(|entry| entry.value().clone()).collect();
        connections.sort_by_key(|connection| connection.created_at);
        Ok(connections)
    }
}

impl<S: ConnectionStore + ?Sized> ConnectionStore for Arc<S> {
    fn save(&self, connection: &Connection) -> Result<(), StoreError> {
        (**self).save(connection)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Connection>, StoreError> {
        (**self).find_by_id(id)
    }

    fn find_by_guid(&self, guid: &str) -> Result<Option<Connection>, StoreError> {
        (**self).find_by_guid(guid)
    }

    fn all(&self) -> Result<Vec<Connection>, StoreError> {
        (**self).all()
    }
}
