//! Live sessions keyed by client id.
//!
//! A session only enters the registry once it is connected, and a watcher task
//! removes it as soon as its status leaves `Connected`, so a snapshot never
//! hands out a session that is known to be gone.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use shared::{domain::ClientId, error::RegistryError};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::session::Session;

type SessionMap = BTreeMap<ClientId, Arc<Session>>;

#[derive(Clone, Default)]
pub struct FleetRegistry {
    sessions: Arc<RwLock<SessionMap>>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        // Subscribe before the liveness check so a drop in between is still observed.
        let mut status = session.watch_status();
        let client_id = session.id();
        if !status.borrow_and_update().is_connected() {
            return Err(RegistryError::NotConnected(client_id));
        }

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&client_id) {
                return Err(RegistryError::DuplicateClient(client_id));
            }
            sessions.insert(client_id, Arc::clone(&session));
        }
        debug!(client_id = client_id.0, "registry: session added");

        let registry = Arc::downgrade(&self.sessions);
        let watched = Arc::downgrade(&session);
        tokio::spawn(async move {
            loop {
                if !status.borrow_and_update().is_connected() {
                    break;
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
            evict(registry, client_id, watched).await;
        });
        Ok(())
    }

    /// Removes and returns the session, whatever its state.
    pub async fn remove(&self, client_id: ClientId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&client_id)
    }

    pub async fn get(&self, client_id: ClientId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&client_id).cloned()
    }

    /// Connected sessions in ascending id order.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.is_connected())
            .cloned()
            .collect()
    }

    pub async fn count_live(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.is_connected())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Empties the registry, handing every entry to the caller.
    pub async fn take_all(&self) -> Vec<Arc<Session>> {
        let taken = std::mem::take(&mut *self.sessions.write().await);
        taken.into_values().collect()
    }
}

async fn evict(registry: Weak<RwLock<SessionMap>>, client_id: ClientId, watched: Weak<Session>) {
    let Some(sessions) = registry.upgrade() else {
        return;
    };
    let mut sessions = sessions.write().await;
    // A drain may already have taken the entry; only drop the instance we watched.
    let same_instance = sessions
        .get(&client_id)
        .is_some_and(|current| Weak::ptr_eq(&Arc::downgrade(current), &watched));
    if same_instance {
        sessions.remove(&client_id);
        info!(client_id = client_id.0, "registry: removed disconnected session");
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
