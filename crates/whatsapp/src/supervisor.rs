//! Connection supervisor: per-account lifecycle state machine.
//!
//! Every operation and every lifecycle event for an account runs under that
//! account's lock, so transitions for one account are applied one at a time
//! and in the order the transport emitted them. Different accounts never
//! contend. Status changes are written to the [`AccountStore`] before the
//! registry or the retry book is touched.

use std::{sync::Arc, time::Duration};

use {
    chrono::Utc,
    dashmap::DashMap,
    futures::future::BoxFuture,
    serde::Serialize,
    tokio::{sync::Mutex, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, instrument, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use {
    wazper_common::{
        Account, AccountId, AccountStatus, AccountUpdate, ActivityAction, Error, Result,
    },
    wazper_config::SupervisorConfig,
};

use crate::{
    credentials::{CredentialState, CredentialStore},
    pairing::{PairingRenderer, QrPairingRenderer},
    registry::{SessionId, SessionRegistry},
    retry::{BackoffPolicy, RetryBook},
    store::{AccountStore, ActivityEntry},
    transport::{
        CloseClass, CloseInfo, CloseReason, EventStream, LifecycleEvent, Transport,
        TransportEvent, UserInfo,
    },
};

/// Snapshot returned by [`Supervisor::status`].
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatusView {
    #[serde(flatten)]
    pub account: Account,
    /// A session is registered and authenticated.
    pub live: bool,
    pub consecutive_failures: u32,
    /// Backoff chosen for the pending reconnect.
    pub retry_delay: Option<Duration>,
    /// Time until the pending reconnect fires.
    pub next_retry_in: Option<Duration>,
}

pub struct SupervisorBuilder {
    store: Arc<dyn AccountStore>,
    credentials: Arc<dyn CredentialStore>,
    transport: Arc<dyn Transport>,
    renderer: Arc<dyn PairingRenderer>,
    registry: SessionRegistry,
    config: SupervisorConfig,
}

impl SupervisorBuilder {
    pub fn with_renderer(mut self, renderer: Arc<dyn PairingRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Supervisor {
        Supervisor {
            inner: Arc::new(Inner {
                store: self.store,
                credentials: self.credentials,
                transport: self.transport,
                renderer: self.renderer,
                registry: self.registry,
                retries: Mutex::new(RetryBook::new()),
                locks: DashMap::new(),
                policy: BackoffPolicy::from(&self.config),
                cooldown: self.config.connect_cooldown(),
            }),
        }
    }
}

/// Owns the lifecycle of every account's session.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn AccountStore>,
    credentials: Arc<dyn CredentialStore>,
    transport: Arc<dyn Transport>,
    renderer: Arc<dyn PairingRenderer>,
    registry: SessionRegistry,
    retries: Mutex<RetryBook>,
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
    policy: BackoffPolicy,
    cooldown: Duration,
}

impl Supervisor {
    pub fn builder(
        store: Arc<dyn AccountStore>,
        credentials: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
    ) -> SupervisorBuilder {
        SupervisorBuilder {
            store,
            credentials,
            transport,
            renderer: Arc::new(QrPairingRenderer::default()),
            registry: SessionRegistry::new(),
            config: SupervisorConfig::default(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.inner.policy
    }

    /// Open a session for the account. Returns once the session exists;
    /// authentication completes asynchronously.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn connect(&self, account_id: AccountId) -> Result<()> {
        let lock = self.inner.account_lock(account_id);
        let _guard = lock.lock().await;

        self.inner.store.get(account_id).await?;
        if self.inner.registry.get_authenticated(account_id).await.is_some() {
            debug!("already connected");
            return Ok(());
        }
        {
            let mut retries = self.inner.retries.lock().await;
            if let Some(retry_after) =
                retries.cooldown_remaining(account_id, self.inner.cooldown, Instant::now())
            {
                debug!(retry_after_ms = retry_after.as_millis() as u64, "connect rate limited");
                return Err(Error::RateLimited {
                    account_id,
                    retry_after,
                });
            }
            retries.cancel(account_id);
        }
        self.inner.open_session(account_id).await
    }

    /// Log out and deregister. Idempotent.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn disconnect(&self, account_id: AccountId) -> Result<()> {
        let lock = self.inner.account_lock(account_id);
        let _guard = lock.lock().await;

        let account = self.inner.store.get(account_id).await?;
        self.inner.retries.lock().await.clear(account_id);
        self.inner
            .store
            .update(
                account_id,
                AccountUpdate::status(AccountStatus::Disconnected).clear_pairing_payload(),
            )
            .await?;

        let handle = self.inner.registry.remove(account_id).await;
        let had_session = handle.is_some();
        if let Some(handle) = handle {
            match handle.session.logout().await {
                Ok(()) => {
                    if let Err(e) = self.inner.credentials.wipe(account_id).await {
                        warn!(error = %e, "failed to wipe credentials after logout");
                    }
                },
                Err(e) => warn!(error = %e, "logout failed, dropping session"),
            }
            handle.session.close().await;
        }

        if had_session || account.status != AccountStatus::Disconnected {
            info!("account disconnected");
            self.inner
                .log_activity(ActivityEntry::new(account_id, ActivityAction::Disconnected))
                .await;
        }
        Ok(())
    }

    /// Tear down without logout, wipe credentials and pair from scratch.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn force_reconnect(&self, account_id: AccountId) -> Result<()> {
        let lock = self.inner.account_lock(account_id);
        let _guard = lock.lock().await;

        self.inner.store.get(account_id).await?;
        self.inner.retries.lock().await.clear(account_id);
        if let Some(handle) = self.inner.registry.remove(account_id).await {
            handle.session.close().await;
        }
        self.inner.credentials.wipe(account_id).await?;
        self.inner
            .store
            .update(
                account_id,
                AccountUpdate::status(AccountStatus::Connecting).clear_pairing_payload(),
            )
            .await?;
        info!("credentials wiped, re-pairing");
        self.inner.open_session(account_id).await
    }

    /// Disconnect, cancel pending reconnects and wipe credentials ahead of
    /// the account row being deleted.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn remove_account(&self, account_id: AccountId) -> Result<()> {
        let lock = self.inner.account_lock(account_id);
        let guard = lock.lock().await;
        let result = self.inner.detach_account(account_id).await;
        drop(guard);
        // Keep the entry while another caller is still waiting on it.
        self.inner
            .locks
            .remove_if(&account_id, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    /// Apply a lifecycle event to the account's current session.
    pub async fn on_lifecycle_event(&self, account_id: AccountId, event: LifecycleEvent) {
        match self.inner.registry.get(account_id).await {
            Some(handle) => {
                self.inner
                    .handle_event(account_id, handle.id, event)
                    .await
            },
            None => debug!(account_id = %account_id, "no session for lifecycle event"),
        }
    }

    /// Reconnect every account whose stored status is not `disconnected`.
    /// Returns how many connects were started.
    pub async fn initialize(&self) -> Result<usize> {
        let accounts = self
            .inner
            .store
            .list_by_status_not_in(&[AccountStatus::Disconnected])
            .await?;
        let mut started = 0;
        for account in accounts {
            match self.connect(account.id).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "startup reconnect failed")
                },
            }
        }
        info!(started, "resumed accounts");
        Ok(started)
    }

    /// Cancel timers and close every session without logging out. Stored
    /// status is left as is so the next start resumes the same accounts.
    pub async fn shutdown(&self) {
        self.inner.retries.lock().await.cancel_all();
        let handles = self.inner.registry.drain().await;
        let count = handles.len();
        for handle in handles {
            handle.session.close().await;
        }
        info!(sessions = count, "supervisor shut down");
    }

    pub async fn status(&self, account_id: AccountId) -> Result<AccountStatusView> {
        let account = self.inner.store.get(account_id).await?;
        let live = self
            .inner
            .registry
            .get_authenticated(account_id)
            .await
            .is_some();
        let retries = self.inner.retries.lock().await;
        let record = retries.get(account_id);
        let now = Instant::now();
        Ok(AccountStatusView {
            account,
            live,
            consecutive_failures: retries.failures(account_id),
            retry_delay: record.and_then(|r| r.scheduled_delay),
            next_retry_in: record
                .and_then(|r| r.next_eligible)
                .map(|at| at.saturating_duration_since(now)),
        })
    }
}

impl Inner {
    fn account_lock(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(account_id).or_default().value())
    }

    /// Caller holds the account lock.
    async fn detach_account(&self, account_id: AccountId) -> Result<()> {
        self.retries.lock().await.clear(account_id);
        if let Some(handle) = self.registry.remove(account_id).await {
            if let Err(e) = handle.session.logout().await {
                warn!(error = %e, "logout failed during removal");
            }
            handle.session.close().await;
        }
        self.credentials.wipe(account_id).await?;
        match self
            .store
            .update(
                account_id,
                AccountUpdate::status(AccountStatus::Disconnected).clear_pairing_payload(),
            )
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => {},
            Err(e) => return Err(e),
        }
        info!("account removed from supervision");
        Ok(())
    }

    async fn log_activity(&self, entry: ActivityEntry) {
        let action = entry.action;
        if let Err(e) = self.store.append_activity_log(entry).await {
            warn!(action = %action, error = %e, "failed to append activity log");
        }
    }

    /// Open and register a session. Caller holds the account lock.
    ///
    /// Failure to reach the transport counts as a transient failure and is
    /// retried with backoff rather than returned.
    async fn open_session(self: &Arc<Self>, account_id: AccountId) -> Result<()> {
        self.retries
            .lock()
            .await
            .record_attempt(account_id, Instant::now());
        let credentials = self.credentials.load(account_id).await?;

        if let Some(previous) = self.registry.remove(account_id).await {
            debug!(account_id = %account_id, session_id = previous.id, "closing previous session");
            previous.session.close().await;
        }

        let opened = match self.transport.open(account_id, credentials).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "failed to open session");
                let info = CloseInfo::new(CloseReason::ConnectionLost).with_detail(e.to_string());
                self.on_closed(account_id, None, info).await;
                return Ok(());
            },
        };

        if let Err(e) = self
            .store
            .update(account_id, AccountUpdate::status(AccountStatus::Connecting))
            .await
        {
            opened.session.close().await;
            return Err(e);
        }

        let (handle, evicted) = self.registry.register(account_id, opened.session).await;
        if let Some(evicted) = evicted {
            evicted.session.close().await;
        }
        info!(account_id = %account_id, session_id = handle.id, "session opened");
        #[cfg(feature = "metrics")]
        counter!("wazper_sessions_opened_total").increment(1);

        self.spawn_event_worker(account_id, handle.id, opened.events);
        Ok(())
    }

    /// One worker per session drains its event stream in order.
    fn spawn_event_worker(
        self: &Arc<Self>,
        account_id: AccountId,
        session_id: SessionId,
        mut events: EventStream,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::CredentialsUpdated(update) => {
                        inner
                            .persist_credentials(account_id, session_id, &update)
                            .await;
                    },
                    TransportEvent::Lifecycle(event) => {
                        let closed = matches!(event, LifecycleEvent::Closed(_));
                        inner.handle_event(account_id, session_id, event).await;
                        if closed {
                            return;
                        }
                    },
                }
            }
            let info = CloseInfo::new(CloseReason::ConnectionLost).with_detail("event stream ended");
            inner
                .handle_event(account_id, session_id, LifecycleEvent::Closed(info))
                .await;
        });
    }

    /// Saves from a session that has since been replaced or torn down are
    /// dropped, so a wipe is never undone by a stale write.
    async fn persist_credentials(
        &self,
        account_id: AccountId,
        session_id: SessionId,
        update: &CredentialState,
    ) {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        if !self.registry.is_current(account_id, session_id).await {
            debug!(account_id = %account_id, session_id, "ignoring credentials from stale session");
            return;
        }
        if let Err(e) = self.credentials.save(account_id, update).await {
            warn!(account_id = %account_id, error = %e, "failed to persist credentials");
        }
    }

    async fn handle_event(
        self: &Arc<Self>,
        account_id: AccountId,
        session_id: SessionId,
        event: LifecycleEvent,
    ) {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        if !self.registry.is_current(account_id, session_id).await {
            debug!(account_id = %account_id, session_id, "ignoring event from stale session");
            return;
        }

        match event {
            LifecycleEvent::PairingPayloadIssued(challenge) => {
                self.on_pairing(account_id, &challenge).await
            },
            LifecycleEvent::Opened(user) => self.on_opened(account_id, session_id, user).await,
            LifecycleEvent::Closed(info) => self.on_closed(account_id, Some(session_id), info).await,
        }
    }

    async fn on_pairing(&self, account_id: AccountId, challenge: &str) {
        let payload = match self.renderer.render(challenge) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "pairing render failed, storing raw payload");
                challenge.to_string()
            },
        };
        let first = self
            .store
            .get(account_id)
            .await
            .map(|a| a.pairing_payload.is_none())
            .unwrap_or(true);

        if let Err(e) = self
            .store
            .update(
                account_id,
                AccountUpdate::status(AccountStatus::Connecting).with_pairing_payload(payload),
            )
            .await
        {
            warn!(account_id = %account_id, error = %e, "failed to store pairing payload");
            return;
        }
        info!(account_id = %account_id, "pairing payload issued");
        if first {
            self.log_activity(ActivityEntry::new(account_id, ActivityAction::PairingIssued))
                .await;
        }
    }

    async fn on_opened(&self, account_id: AccountId, session_id: SessionId, user: UserInfo) {
        let Some(handle) = self.registry.get(account_id).await else {
            return;
        };
        let account = match self.store.get(account_id).await {
            Ok(account) => account,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "cannot load account on open");
                return;
            },
        };

        let phone = user
            .phone_number()
            .or_else(|| handle.session.user().and_then(|u| u.phone_number()));
        let mut update = AccountUpdate::status(AccountStatus::Connected)
            .clear_pairing_payload()
            .with_last_connected(Utc::now());
        let changed_from = match &phone {
            Some(phone) if account.phone.as_deref() != Some(phone.as_str()) => {
                update = update.with_phone(phone.clone());
                Some(account.phone.clone())
            },
            _ => None,
        };

        if let Err(e) = self.store.update(account_id, update).await {
            warn!(account_id = %account_id, error = %e, "failed to record connected status");
            return;
        }
        handle.mark_authenticated();
        self.retries.lock().await.reset_failures(account_id);
        info!(account_id = %account_id, session_id, phone = ?phone, "account connected");

        let mut entry = ActivityEntry::new(account_id, ActivityAction::Connected);
        if let Some(phone) = &phone {
            entry = entry.with_details(format!("Connected as {phone}"));
        }
        self.log_activity(entry).await;

        if let (Some(Some(old)), Some(new)) = (changed_from, &phone) {
            warn!(account_id = %account_id, old = %old, new = %new, "phone number changed");
            self.log_activity(
                ActivityEntry::new(account_id, ActivityAction::PhoneChanged)
                    .with_details(format!("Phone changed from {old} to {new}")),
            )
            .await;
        }
    }

    /// Classify a close and drive the resulting transition. Caller holds the
    /// account lock. `session_id` is `None` when the session never opened.
    async fn on_closed(
        self: &Arc<Self>,
        account_id: AccountId,
        session_id: Option<SessionId>,
        info: CloseInfo,
    ) {
        let class = info.reason.class();
        let failures = self.retries.lock().await.failures(account_id);
        let give_up = class == CloseClass::Transient && self.policy.exhausted(failures);

        let (status, action, details) = match class {
            CloseClass::ExplicitLogout => (
                AccountStatus::Disconnected,
                ActivityAction::LoggedOut,
                "Logged out from device".to_string(),
            ),
            CloseClass::Permanent => (
                AccountStatus::Error,
                ActivityAction::ConnectionError,
                format!("Permanent failure: {}", info.describe()),
            ),
            CloseClass::Transient if give_up => (
                AccountStatus::Error,
                ActivityAction::ConnectionError,
                format!(
                    "Gave up after {failures} reconnect attempts: {}",
                    info.describe()
                ),
            ),
            CloseClass::Transient => (
                AccountStatus::Reconnecting,
                ActivityAction::ReconnectScheduled,
                String::new(),
            ),
        };

        let mut update = AccountUpdate::status(status);
        if status != AccountStatus::Reconnecting {
            update = update.clear_pairing_payload();
        }
        let account_gone = match self.store.update(account_id, update).await {
            Ok(()) => false,
            Err(Error::NotFound(_)) => true,
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "failed to record close");
                false
            },
        };

        if let Some(session_id) = session_id
            && let Some(handle) = self.registry.remove_if(account_id, session_id).await
        {
            handle.session.close().await;
        }

        if account_gone {
            self.retries.lock().await.clear(account_id);
            debug!(account_id = %account_id, "account deleted, not reconnecting");
            return;
        }

        match class {
            CloseClass::ExplicitLogout => {
                self.retries.lock().await.clear(account_id);
                if let Err(e) = self.credentials.wipe(account_id).await {
                    warn!(account_id = %account_id, error = %e, "failed to wipe credentials after logout");
                }
                info!(account_id = %account_id, "logged out remotely");
                self.log_activity(ActivityEntry::new(account_id, action).with_details(details))
                    .await;
            },
            CloseClass::Permanent => {
                self.retries.lock().await.clear(account_id);
                let err = Error::PermanentConnectionFailure {
                    account_id,
                    reason: info.describe(),
                };
                warn!(error = %err, "not reconnecting");
                self.log_activity(ActivityEntry::new(account_id, action).with_details(details))
                    .await;
            },
            CloseClass::Transient if give_up => {
                self.retries.lock().await.clear(account_id);
                let err = Error::TransientConnectionFailure {
                    account_id,
                    reason: info.describe(),
                };
                warn!(error = %err, failures, "giving up on reconnect");
                self.log_activity(ActivityEntry::new(account_id, action).with_details(details))
                    .await;
            },
            CloseClass::Transient => self.schedule_reconnect(account_id, failures, &info).await,
        }
    }

    async fn schedule_reconnect(
        self: &Arc<Self>,
        account_id: AccountId,
        failures: u32,
        info: &CloseInfo,
    ) {
        let delay = self.policy.delay(failures);
        let (attempt, token) = self
            .retries
            .lock()
            .await
            .schedule(account_id, delay, Instant::now());
        info!(
            account_id = %account_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %info.describe(),
            "reconnect scheduled"
        );
        #[cfg(feature = "metrics")]
        counter!("wazper_reconnects_scheduled_total").increment(1);
        self.log_activity(
            ActivityEntry::new(account_id, ActivityAction::ReconnectScheduled).with_details(
                format!(
                    "Reconnecting in {}s (attempt {attempt}): {}",
                    delay.as_secs(),
                    info.describe()
                ),
            ),
        )
        .await;

        tokio::spawn(Arc::clone(self).reconnect_after(account_id, delay, token));
    }

    /// Timer body. Boxed because the reconnect path can schedule another timer.
    fn reconnect_after(
        self: Arc<Self>,
        account_id: AccountId,
        delay: Duration,
        token: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tokio::select! {
                _ = token.cancelled() => {},
                _ = tokio::time::sleep(delay) => self.fire_reconnect(account_id, token).await,
            }
        })
    }

    async fn fire_reconnect(self: &Arc<Self>, account_id: AccountId, token: CancellationToken) {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        if token.is_cancelled() {
            return;
        }
        self.retries.lock().await.fired(account_id);

        match self.store.get(account_id).await {
            Ok(_) => {},
            Err(Error::NotFound(_)) => {
                self.retries.lock().await.clear(account_id);
                debug!(account_id = %account_id, "account gone, dropping reconnect");
                return;
            },
            Err(e) => warn!(account_id = %account_id, error = %e, "account lookup failed before reconnect"),
        }

        if let Err(e) = self.credentials.soft_clean(account_id).await {
            warn!(account_id = %account_id, error = %e, "soft clean failed");
        }
        if let Err(e) = self.open_session(account_id).await {
            warn!(account_id = %account_id, error = %e, "reconnect failed");
            let info = CloseInfo::new(CloseReason::ConnectionLost).with_detail(e.to_string());
            self.on_closed(account_id, None, info).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use {async_trait::async_trait, serde_json::json};

    use super::*;

    use crate::{
        credentials::{CredentialOp, IDENTITY_ENTRY, MemoryCredentialStore},
        pairing::RawPairingRenderer,
        store::MemoryAccountStore,
        testing::{FakeTransport, settle, user},
    };

    struct Harness {
        supervisor: Supervisor,
        store: Arc<MemoryAccountStore>,
        credentials: Arc<MemoryCredentialStore>,
        transport: Arc<FakeTransport>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryAccountStore::new());
        let credentials = Arc::new(MemoryCredentialStore::new());
        let transport = FakeTransport::new();
        let supervisor = Supervisor::builder(
            Arc::clone(&store) as Arc<dyn AccountStore>,
            Arc::clone(&credentials) as Arc<dyn CredentialStore>,
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .with_renderer(Arc::new(RawPairingRenderer))
        .build();
        Harness {
            supervisor,
            store,
            credentials,
            transport,
        }
    }

    fn closed(code: u16) -> LifecycleEvent {
        LifecycleEvent::Closed(CloseInfo::new(CloseReason::from_code(Some(code))))
    }

    async fn status_of(h: &Harness, id: AccountId) -> AccountStatus {
        h.store.get(id).await.unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn connect_pair_and_open() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;

        h.supervisor.connect(id).await.unwrap();
        assert_eq!(status_of(&h, id).await, AccountStatus::Connecting);
        assert!(h.supervisor.registry().get(id).await.is_some());
        assert!(h.supervisor.registry().get_authenticated(id).await.is_none());

        h.transport
            .emit(id, LifecycleEvent::PairingPayloadIssued("2@qr".into()));
        settle().await;
        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.status, AccountStatus::Connecting);
        assert_eq!(account.pairing_payload.as_deref(), Some("2@qr"));

        h.transport
            .emit(id, LifecycleEvent::Opened(user("628123456789")));
        settle().await;
        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.status, AccountStatus::Connected);
        assert!(account.pairing_payload.is_none());
        assert!(account.last_connected.is_some());
        assert_eq!(account.phone.as_deref(), Some("628123456789"));
        assert!(h.supervisor.registry().get_authenticated(id).await.is_some());
        assert_eq!(h.store.actions(id), vec![
            ActivityAction::Created,
            ActivityAction::PairingIssued,
            ActivityAction::Connected,
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_unknown_account_is_not_found() {
        let h = harness();
        let err = h.supervisor.connect(AccountId::new(99)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(h.transport.open_count(AccountId::new(99)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_within_cooldown_is_rate_limited() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;

        h.supervisor.connect(id).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let err = h.supervisor.connect(id).await.unwrap_err();
        match err {
            Error::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(20))
            },
            other => panic!("expected RateLimited, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(20)).await;
        h.supervisor.connect(id).await.unwrap();
        assert_eq!(h.transport.open_count(id), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_connect_force_connect_keeps_one_live_session() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;

        h.supervisor.connect(id).await.unwrap();
        h.supervisor.force_reconnect(id).await.unwrap();
        // Cooldown restarts with the forced attempt.
        assert!(matches!(
            h.supervisor.connect(id).await,
            Err(Error::RateLimited { .. })
        ));
        tokio::time::advance(Duration::from_secs(31)).await;
        h.supervisor.connect(id).await.unwrap();
        settle().await;

        assert_eq!(h.transport.open_count(id), 3);
        assert_eq!(h.transport.live_sessions(id), 1);
        assert_eq!(h.supervisor.registry().len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_wipes_before_loading() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.credentials.seed(
            id,
            CredentialState::new().with_entry(IDENTITY_ENTRY, json!({"me": "x"})),
        );

        h.supervisor.force_reconnect(id).await.unwrap();

        let journal = h.credentials.journal();
        let wipe = journal
            .iter()
            .position(|op| *op == CredentialOp::Wipe(id))
            .unwrap();
        let load = journal
            .iter()
            .position(|op| *op == CredentialOp::Load(id))
            .unwrap();
        assert!(wipe < load);
        assert!(h.transport.last_credentials(id).unwrap().is_empty());
        assert_eq!(status_of(&h, id).await, AccountStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();
        h.transport.emit(id, LifecycleEvent::Opened(user("628")));
        settle().await;
        let session = h.transport.session(id).unwrap();

        h.supervisor.disconnect(id).await.unwrap();
        assert_eq!(status_of(&h, id).await, AccountStatus::Disconnected);
        assert_eq!(session.logouts(), 1);

        h.supervisor.disconnect(id).await.unwrap();
        assert_eq!(status_of(&h, id).await, AccountStatus::Disconnected);
        assert_eq!(session.logouts(), 1);
        assert!(h.supervisor.registry().is_empty().await);
        assert_eq!(
            h.store
                .actions(id)
                .iter()
                .filter(|a| **a == ActivityAction::Disconnected)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_error() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();

        let mut observed = Vec::new();
        for _ in 0..5 {
            h.transport.emit(id, closed(428));
            settle().await;
            assert_eq!(status_of(&h, id).await, AccountStatus::Reconnecting);
            assert!(h.supervisor.registry().get(id).await.is_none());

            let view = h.supervisor.status(id).await.unwrap();
            let delay = view.retry_delay.unwrap();
            observed.push(delay.as_secs());

            let opens = h.transport.open_count(id);
            tokio::time::advance(delay).await;
            settle().await;
            assert_eq!(h.transport.open_count(id), opens + 1);
        }
        assert_eq!(observed, vec![5, 15, 45, 135, 300]);

        h.transport.emit(id, closed(428));
        settle().await;
        assert_eq!(status_of(&h, id).await, AccountStatus::Error);
        let view = h.supervisor.status(id).await.unwrap();
        assert_eq!(view.consecutive_failures, 0);
        assert!(view.retry_delay.is_none());

        let opens = h.transport.open_count(id);
        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(h.transport.open_count(id), opens);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_failures() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();

        h.transport.emit(id, closed(515));
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        h.transport.emit(id, closed(515));
        settle().await;
        assert_eq!(h.supervisor.status(id).await.unwrap().consecutive_failures, 2);

        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        h.transport.emit(id, LifecycleEvent::Opened(user("628")));
        settle().await;
        assert_eq!(h.supervisor.status(id).await.unwrap().consecutive_failures, 0);

        h.transport.emit(id, closed(515));
        settle().await;
        let view = h.supervisor.status(id).await.unwrap();
        assert_eq!(view.retry_delay, Some(Duration::from_secs(5)));
        assert!(view.next_retry_in.unwrap() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_reconnect_soft_cleans_credentials() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.credentials.seed(
            id,
            CredentialState::new()
                .with_entry(IDENTITY_ENTRY, json!({"me": "x"}))
                .with_entry("pre-key-1", json!(1)),
        );
        h.supervisor.connect(id).await.unwrap();
        h.transport.emit(id, closed(408));
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert!(h.credentials.journal().contains(&CredentialOp::SoftClean(id)));
        let creds = h.transport.last_credentials(id).unwrap();
        assert_eq!(creds.keys().collect::<Vec<_>>(), vec![IDENTITY_ENTRY]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_close_sets_error_without_retry() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();

        h.transport.emit(id, closed(403));
        settle().await;
        assert_eq!(status_of(&h, id).await, AccountStatus::Error);
        assert!(h.supervisor.registry().is_empty().await);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(h.transport.open_count(id), 1);
        assert!(h.store.actions(id).contains(&ActivityAction::ConnectionError));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_logout_disconnects_and_wipes() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();
        h.transport.emit(id, LifecycleEvent::Opened(user("628")));
        settle().await;

        h.transport.emit(id, closed(401));
        settle().await;
        assert_eq!(status_of(&h, id).await, AccountStatus::Disconnected);
        assert!(h.credentials.journal().contains(&CredentialOp::Wipe(id)));
        assert!(h.store.actions(id).contains(&ActivityAction::LoggedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();
        h.transport.emit(id, closed(428));
        settle().await;

        h.supervisor.disconnect(id).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(h.transport.open_count(id), 1);
        assert_eq!(status_of(&h, id).await, AccountStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_account_drops_pending_reconnect() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();
        h.transport.emit(id, closed(428));
        settle().await;

        h.supervisor.remove_account(id).await.unwrap();
        assert!(!h.supervisor.inner.locks.contains_key(&id));
        h.store.delete(id).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(h.transport.open_count(id), 1);
        assert!(h.credentials.journal().contains(&CredentialOp::Wipe(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_events_are_ignored() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();
        let first = h.supervisor.registry().get(id).await.unwrap().id;

        h.supervisor.force_reconnect(id).await.unwrap();
        h.supervisor
            .inner
            .handle_event(id, first, closed(403))
            .await;
        assert_eq!(status_of(&h, id).await, AccountStatus::Connecting);
        assert!(h.supervisor.registry().get(id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_counts_as_lost_connection() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();

        h.transport.end_stream(id);
        settle().await;
        assert_eq!(status_of(&h, id).await, AccountStatus::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_schedules_retry() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.transport.fail_next_opens(1);

        h.supervisor.connect(id).await.unwrap();
        assert_eq!(status_of(&h, id).await, AccountStatus::Reconnecting);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(h.transport.open_count(id), 1);
        assert_eq!(status_of(&h, id).await, AccountStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn phone_change_is_logged() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.store
            .update(id, AccountUpdate::default().with_phone("62811"))
            .await
            .unwrap();
        h.supervisor.connect(id).await.unwrap();
        h.transport.emit(id, LifecycleEvent::Opened(user("62899")));
        settle().await;

        assert_eq!(
            h.store.get(id).await.unwrap().phone.as_deref(),
            Some("62899")
        );
        let entries = h.store.activity(id);
        let changed = entries
            .iter()
            .find(|e| e.action == ActivityAction::PhoneChanged)
            .unwrap();
        assert_eq!(
            changed.details.as_deref(),
            Some("Phone changed from 62811 to 62899")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn phone_falls_back_to_session_identity() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();
        h.transport.session(id).unwrap().set_user(user("62877"));
        h.transport
            .emit(id, LifecycleEvent::Opened(UserInfo::default()));
        settle().await;

        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.status, AccountStatus::Connected);
        assert_eq!(account.phone.as_deref(), Some("62877"));
    }

    #[tokio::test(start_paused = true)]
    async fn credential_updates_are_persisted() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();

        h.transport.emit(
            id,
            TransportEvent::CredentialsUpdated(
                CredentialState::new().with_entry(IDENTITY_ENTRY, json!({"me": "y"})),
            ),
        );
        settle().await;
        assert!(h.credentials.snapshot(id).has_identity());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_resumes_and_shutdown_keeps_status() {
        let h = harness();
        let a = h.store.create("a").unwrap().id;
        let b = h.store.create("b").unwrap().id;
        let c = h.store.create("c").unwrap().id;
        h.store
            .update(a, AccountUpdate::status(AccountStatus::Connected))
            .await
            .unwrap();
        h.store
            .update(c, AccountUpdate::status(AccountStatus::Reconnecting))
            .await
            .unwrap();

        assert_eq!(h.supervisor.initialize().await.unwrap(), 2);
        assert_eq!(h.transport.open_count(a), 1);
        assert_eq!(h.transport.open_count(b), 0);
        assert_eq!(h.transport.open_count(c), 1);

        h.transport.emit(a, LifecycleEvent::Opened(user("628")));
        settle().await;
        h.supervisor.shutdown().await;
        settle().await;

        assert!(h.supervisor.registry().is_empty().await);
        assert_eq!(h.transport.session(a).unwrap().logouts(), 0);
        assert_eq!(h.transport.session(a).unwrap().closes(), 1);
        assert_eq!(status_of(&h, a).await, AccountStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_keeps_authenticated_session() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();
        h.transport.emit(id, LifecycleEvent::Opened(user("628")));
        settle().await;

        tokio::time::advance(Duration::from_secs(31)).await;
        h.supervisor.connect(id).await.unwrap();
        settle().await;

        let session = h.transport.session(id).unwrap();
        assert_eq!(session.closes(), 0);
        assert_eq!(h.transport.open_count(id), 1);
        assert_eq!(status_of(&h, id).await, AccountStatus::Connected);
        assert!(h.supervisor.registry().get_authenticated(id).await.is_some());
    }

    /// Credential store whose saves take a while to land.
    struct SlowSave(Arc<MemoryCredentialStore>);

    #[async_trait]
    impl CredentialStore for SlowSave {
        async fn load(&self, account_id: AccountId) -> Result<CredentialState> {
            self.0.load(account_id).await
        }

        async fn save(&self, account_id: AccountId, update: &CredentialState) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.save(account_id, update).await
        }

        async fn soft_clean(&self, account_id: AccountId) -> Result<()> {
            self.0.soft_clean(account_id).await
        }

        async fn wipe(&self, account_id: AccountId) -> Result<()> {
            self.0.wipe(account_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_wipe_outlives_in_flight_save() {
        let store = Arc::new(MemoryAccountStore::new());
        let credentials = Arc::new(MemoryCredentialStore::new());
        let transport = FakeTransport::new();
        let supervisor = Supervisor::builder(
            Arc::clone(&store) as Arc<dyn AccountStore>,
            Arc::new(SlowSave(Arc::clone(&credentials))) as Arc<dyn CredentialStore>,
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .with_renderer(Arc::new(RawPairingRenderer))
        .build();
        let id = store.create("main").unwrap().id;

        supervisor.connect(id).await.unwrap();
        transport.emit(
            id,
            TransportEvent::CredentialsUpdated(
                CredentialState::new().with_entry(IDENTITY_ENTRY, json!({"me": "old"})),
            ),
        );
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        supervisor.force_reconnect(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(credentials.snapshot(id).is_empty());
        assert!(transport.last_credentials(id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_from_replaced_session_are_dropped() {
        let h = harness();
        let id = h.store.create("main").unwrap().id;
        h.supervisor.connect(id).await.unwrap();
        let stale = h.supervisor.registry().get(id).await.unwrap().id;
        h.supervisor.force_reconnect(id).await.unwrap();

        h.supervisor
            .inner
            .persist_credentials(
                id,
                stale,
                &CredentialState::new().with_entry(IDENTITY_ENTRY, json!({"me": "old"})),
            )
            .await;
        assert!(h.credentials.snapshot(id).is_empty());
    }
}
