//! Scripted transport used by unit tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {async_trait::async_trait, chrono::Utc, tokio::sync::mpsc};

use wazper_common::{AccountId, Error, Result};

use crate::{
    credentials::CredentialState,
    transport::{
        OpenedSession, OutboundPayload, Receipt, Transport, TransportEvent,
        TransportSession, UserInfo,
    },
};

/// Let spawned tasks run under a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Default)]
pub struct FakeSession {
    sends: Mutex<Vec<(String, OutboundPayload)>>,
    logouts: AtomicUsize,
    closes: AtomicUsize,
    fail_sends: AtomicBool,
    fail_to: Mutex<Vec<String>>,
    user: Mutex<Option<UserInfo>>,
}

impl FakeSession {
    pub fn sends(&self) -> Vec<(String, OutboundPayload)> {
        self.sends.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.logouts() == 0 && self.closes() == 0
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Reject sends addressed to this exact address.
    pub fn fail_sends_to(&self, address: &str) {
        if let Ok(mut list) = self.fail_to.lock() {
            list.push(address.to_string());
        }
    }

    pub fn set_user(&self, user: UserInfo) {
        if let Ok(mut slot) = self.user.lock() {
            *slot = Some(user);
        }
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    async fn send(&self, address: &str, payload: OutboundPayload) -> Result<Receipt> {
        let rejected = self.fail_sends.load(Ordering::SeqCst)
            || self
                .fail_to
                .lock()
                .map(|l| l.iter().any(|a| a == address))
                .unwrap_or(false);
        if rejected {
            return Err(Error::DispatchFailure(format!("rejected send to {address}")));
        }
        let mut sends = self
            .sends
            .lock()
            .map_err(|e| Error::transport(e.to_string()))?;
        sends.push((address.to_string(), payload));
        Ok(Receipt {
            message_id: format!("MSG{}", sends.len()),
            timestamp: Utc::now(),
        })
    }

    async fn logout(&self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn user(&self) -> Option<UserInfo> {
        self.user.lock().ok().and_then(|u| u.clone())
    }
}

struct OpenRecord {
    account_id: AccountId,
    credentials: CredentialState,
    session: Arc<FakeSession>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Transport whose sessions are driven by the test through [`FakeTransport::emit`].
#[derive(Default)]
pub struct FakeTransport {
    opens: Mutex<Vec<OpenRecord>>,
    failures_pending: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` opens fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn open_count(&self, account_id: AccountId) -> usize {
        self.with_opens(|opens| opens.iter().filter(|o| o.account_id == account_id).count())
    }

    /// Credentials handed to the most recent open.
    pub fn last_credentials(&self, account_id: AccountId) -> Option<CredentialState> {
        self.with_opens(|opens| {
            opens
                .iter()
                .rev()
                .find(|o| o.account_id == account_id)
                .map(|o| o.credentials.clone())
        })
    }

    pub fn session(&self, account_id: AccountId) -> Option<Arc<FakeSession>> {
        self.with_opens(|opens| {
            opens
                .iter()
                .rev()
                .find(|o| o.account_id == account_id)
                .map(|o| Arc::clone(&o.session))
        })
    }

    /// Sessions opened for an account that were neither closed nor logged out.
    pub fn live_sessions(&self, account_id: AccountId) -> usize {
        self.with_opens(|opens| {
            opens
                .iter()
                .filter(|o| o.account_id == account_id && o.session.is_live())
                .count()
        })
    }

    /// Emit an event on the most recent session of an account.
    pub fn emit(&self, account_id: AccountId, event: impl Into<TransportEvent>) -> bool {
        let event = event.into();
        self.with_opens(|opens| {
            opens
                .iter()
                .rev()
                .find(|o| o.account_id == account_id)
                .is_some_and(|o| o.events.send(event).is_ok())
        })
    }

    /// Drop the event sender of the most recent session, ending its stream.
    pub fn end_stream(&self, account_id: AccountId) {
        self.with_opens(|opens| {
            if let Some(record) = opens.iter_mut().rev().find(|o| o.account_id == account_id) {
                let (tx, _) = mpsc::unbounded_channel();
                record.events = tx;
            }
        });
    }

    fn with_opens<T: Default>(&self, f: impl FnOnce(&mut Vec<OpenRecord>) -> T) -> T {
        self.opens.lock().map(|mut o| f(&mut o)).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        account_id: AccountId,
        credentials: CredentialState,
    ) -> Result<OpenedSession> {
        let pending = self.failures_pending.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_pending.store(pending - 1, Ordering::SeqCst);
            return Err(Error::transport("sidecar unreachable"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(FakeSession::default());
        let mut opens = self
            .opens
            .lock()
            .map_err(|e| Error::transport(e.to_string()))?;
        opens.push(OpenRecord {
            account_id,
            credentials,
            session: Arc::clone(&session),
            events: tx,
        });
        Ok(OpenedSession {
            session,
            events: rx,
        })
    }
}

pub fn user(phone: &str) -> UserInfo {
    UserInfo {
        jid: Some(format!("{phone}:3@s.whatsapp.net")),
        name: Some("Test".into()),
    }
}
