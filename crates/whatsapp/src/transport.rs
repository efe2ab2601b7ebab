//! Contract with the opaque protocol client.
//!
//! A [`Transport`] opens one session per account from stored credentials and
//! hands back the session together with its ordered event stream. The
//! supervisor never looks inside the protocol; it only reacts to
//! [`LifecycleEvent`]s and persists [`TransportEvent::CredentialsUpdated`].

use std::sync::Arc;

use {
    async_trait::async_trait,
    bytes::Bytes,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
};

use wazper_common::{AccountId, Result};

use crate::credentials::CredentialState;

/// Suffix of a fully qualified personal address.
pub const USER_ADDRESS_SUFFIX: &str = "@s.whatsapp.net";

/// Identity reported by the remote side once a session is open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Fully qualified address, e.g. `628123456789:12@s.whatsapp.net`.
    pub jid: Option<String>,
    pub name: Option<String>,
}

impl UserInfo {
    /// Bare phone number, without device suffix or server part.
    pub fn phone_number(&self) -> Option<String> {
        let jid = self.jid.as_deref()?;
        let user = jid.split('@').next()?;
        let phone = user.split(':').next()?;
        (!phone.is_empty()).then(|| phone.to_string())
    }
}

/// Why a session closed, as reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    LoggedOut,
    Forbidden,
    MultideviceMismatch,
    BadSession,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    RestartRequired,
    ServiceUnavailable,
    Unknown(u16),
}

/// Retry classification of a [`CloseReason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    ExplicitLogout,
    Permanent,
    Transient,
}

impl CloseReason {
    /// Map a protocol status code. A missing code means the socket dropped.
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            None | Some(408) => Self::ConnectionLost,
            Some(401) => Self::LoggedOut,
            Some(403) => Self::Forbidden,
            Some(411) => Self::MultideviceMismatch,
            Some(428) => Self::ConnectionClosed,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(503) => Self::ServiceUnavailable,
            Some(515) => Self::RestartRequired,
            Some(other) => Self::Unknown(other),
        }
    }

    pub fn class(self) -> CloseClass {
        match self {
            Self::LoggedOut => CloseClass::ExplicitLogout,
            Self::Forbidden | Self::MultideviceMismatch => CloseClass::Permanent,
            Self::BadSession
            | Self::ConnectionClosed
            | Self::ConnectionLost
            | Self::ConnectionReplaced
            | Self::RestartRequired
            | Self::ServiceUnavailable
            | Self::Unknown(_) => CloseClass::Transient,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoggedOut => "logged out",
            Self::Forbidden => "forbidden",
            Self::MultideviceMismatch => "protocol mismatch",
            Self::BadSession => "bad session",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionLost => "connection lost",
            Self::ConnectionReplaced => "connection replaced",
            Self::RestartRequired => "restart required",
            Self::ServiceUnavailable => "service unavailable",
            Self::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub reason: CloseReason,
    pub detail: Option<String>,
}

impl CloseInfo {
    pub fn new(reason: CloseReason) -> Self {
        Self {
            reason,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn describe(&self) -> String {
        match (&self.reason, &self.detail) {
            (CloseReason::Unknown(code), Some(d)) => format!("status {code}: {d}"),
            (CloseReason::Unknown(code), None) => format!("status {code}"),
            (reason, Some(d)) => format!("{}: {d}", reason.as_str()),
            (reason, None) => reason.as_str().to_string(),
        }
    }
}

/// Connection lifecycle events consumed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PairingPayloadIssued(String),
    Opened(UserInfo),
    Closed(CloseInfo),
}

/// Everything a session emits, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Lifecycle(LifecycleEvent),
    /// Incremental credential rotation to merge into the stored state.
    CredentialsUpdated(CredentialState),
}

impl From<LifecycleEvent> for TransportEvent {
    fn from(event: LifecycleEvent) -> Self {
        Self::Lifecycle(event)
    }
}

pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Protocol payload handed to [`TransportSession::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Text {
        text: String,
    },
    Image {
        data: Bytes,
        caption: Option<String>,
    },
    Video {
        data: Bytes,
        caption: Option<String>,
    },
    /// Voice-note semantics: never carries a caption.
    Audio {
        data: Bytes,
        mime_type: String,
    },
    Document {
        data: Bytes,
        mime_type: String,
        file_name: String,
        caption: Option<String>,
    },
}

impl OutboundPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Audio { .. } => "audio",
            Self::Document { .. } => "document",
        }
    }
}

/// Delivery receipt returned by a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A live protocol session for one account.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Send a payload to a fully qualified address.
    async fn send(&self, address: &str, payload: OutboundPayload) -> Result<Receipt>;

    /// Unpair the device and end the session.
    async fn logout(&self) -> Result<()>;

    /// Drop the connection without unpairing.
    async fn close(&self);

    /// Identity assigned by the remote side, when already known.
    fn user(&self) -> Option<UserInfo> {
        None
    }
}

pub struct OpenedSession {
    pub session: Arc<dyn TransportSession>,
    pub events: EventStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session from the given credentials. Authentication completes
    /// asynchronously and is reported through the event stream.
    async fn open(&self, account_id: AccountId, credentials: CredentialState)
    -> Result<OpenedSession>;
}
