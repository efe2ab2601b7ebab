//! In-memory map of live sessions, keyed by [`AccountId`].
//!
//! There is at most one entry per account. Registering a new session returns
//! the one it evicted so the caller can close it.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::sync::RwLock;

use wazper_common::AccountId;

use crate::transport::TransportSession;

/// Registry-assigned session generation. Unique for the lifetime of the process.
pub type SessionId = u64;

/// A registered session.
pub struct SessionHandle {
    pub id: SessionId,
    pub account_id: AccountId,
    pub session: Arc<dyn TransportSession>,
    authenticated: AtomicBool,
}

impl SessionHandle {
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

/// Shared session map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<AccountId, Arc<SessionHandle>>>>,
    next_id: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, replacing any existing one for the account.
    /// Returns the new handle and the evicted one, if any.
    pub async fn register(
        &self,
        account_id: AccountId,
        session: Arc<dyn TransportSession>,
    ) -> (Arc<SessionHandle>, Option<Arc<SessionHandle>>) {
        let handle = Arc::new(SessionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            account_id,
            session,
            authenticated: AtomicBool::new(false),
        });
        let evicted = self
            .sessions
            .write()
            .await
            .insert(account_id, Arc::clone(&handle));
        (handle, evicted)
    }

    pub async fn get(&self, account_id: AccountId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&account_id).cloned()
    }

    /// The session, only if it completed authentication.
    pub async fn get_authenticated(&self, account_id: AccountId) -> Option<Arc<SessionHandle>> {
        self.get(account_id)
            .await
            .filter(|handle| handle.is_authenticated())
    }

    pub async fn is_current(&self, account_id: AccountId, session_id: SessionId) -> bool {
        self.sessions
            .read()
            .await
            .get(&account_id)
            .is_some_and(|h| h.id == session_id)
    }

    pub async fn remove(&self, account_id: AccountId) -> Option<Arc<SessionHandle>> {
        self.sessions.write().await.remove(&account_id)
    }

    /// Remove the entry only if it is still the given session.
    pub async fn remove_if(
        &self,
        account_id: AccountId,
        session_id: SessionId,
    ) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&account_id).is_some_and(|h| h.id == session_id) {
            sessions.remove(&account_id)
        } else {
            None
        }
    }

    /// Remove and return every entry.
    pub async fn drain(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn account_ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;

    fn session() -> Arc<dyn TransportSession> {
        Arc::new(FakeSession::default())
    }

    #[tokio::test]
    async fn register_evicts_previous_session() {
        let registry = SessionRegistry::new();
        let id = AccountId::new(1);

        let (first, evicted) = registry.register(id, session()).await;
        assert!(evicted.is_none());
        let (second, evicted) = registry.register(id, session()).await;
        assert_eq!(evicted.map(|h| h.id), Some(first.id));
        assert_ne!(first.id, second.id);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn lookups_by_parsed_and_numeric_id_agree() {
        let registry = SessionRegistry::new();
        registry.register(AccountId::new(42), session()).await;

        let parsed = AccountId::parse("42").unwrap();
        assert!(registry.get(parsed).await.is_some());
        assert!(registry.get(AccountId::from(42u64)).await.is_some());
    }

    #[tokio::test]
    async fn get_authenticated_requires_open_session() {
        let registry = SessionRegistry::new();
        let id = AccountId::new(3);
        let (handle, _) = registry.register(id, session()).await;

        assert!(registry.get_authenticated(id).await.is_none());
        handle.mark_authenticated();
        assert!(registry.get_authenticated(id).await.is_some());
    }

    #[tokio::test]
    async fn remove_if_ignores_stale_generation() {
        let registry = SessionRegistry::new();
        let id = AccountId::new(5);
        let (old, _) = registry.register(id, session()).await;
        let (new, _) = registry.register(id, session()).await;

        assert!(registry.remove_if(id, old.id).await.is_none());
        assert!(registry.is_current(id, new.id).await);
        assert!(registry.remove_if(id, new.id).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn drain_empties_registry() {
        let registry = SessionRegistry::new();
        registry.register(AccountId::new(2), session()).await;
        registry.register(AccountId::new(1), session()).await;
        assert_eq!(registry.account_ids().await, vec![
            AccountId::new(1),
            AccountId::new(2)
        ]);

        assert_eq!(registry.drain().await.len(), 2);
        assert!(registry.is_empty().await);
    }
}
