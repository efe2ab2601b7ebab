//! Account model shared between the supervisor, the dispatcher and stores.

use std::{fmt, str::FromStr};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Deserializer, Serialize},
};

use crate::error::Error;

/// Canonical account identifier.
///
/// Every id entering the system, whether it arrives as a number from the
/// database or as a string from a route parameter, is normalized to this
/// integral form before it is used as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AccountId(u64);

impl AccountId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Normalize a textual id (`"42"`, `" 42 "`) into an `AccountId`.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        raw.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| Error::InvalidAccountId(raw.to_string()))
    }
}

impl From<u64> for AccountId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl TryFrom<i64> for AccountId {
    type Error = Error;

    fn try_from(id: i64) -> Result<Self, Self::Error> {
        u64::try_from(id)
            .map(Self)
            .map_err(|_| Error::InvalidAccountId(id.to_string()))
    }
}

impl FromStr for AccountId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n)),
            Raw::Text(s) => Self::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Stored connection status of an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "reconnecting" => Ok(Self::Reconnecting),
            "error" => Ok(Self::Error),
            other => Err(Error::Store(format!("unknown account status: {other}").into())),
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Durable account record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub phone: Option<String>,
    pub status: AccountStatus,
    /// Displayable pairing image, present only while a scan is pending.
    pub pairing_payload: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            phone: None,
            status: AccountStatus::Disconnected,
            pairing_payload: None,
            last_connected: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update, bumping `updated_at`.
    pub fn apply(&mut self, update: &AccountUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(phone) = &update.phone {
            self.phone = Some(phone.clone());
        }
        if let Some(payload) = &update.pairing_payload {
            self.pairing_payload = payload.clone();
        }
        if let Some(at) = update.last_connected {
            self.last_connected = Some(at);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of an account record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountUpdate {
    pub status: Option<AccountStatus>,
    pub phone: Option<String>,
    /// `Some(None)` clears the stored payload.
    pub pairing_payload: Option<Option<String>>,
    pub last_connected: Option<DateTime<Utc>>,
}

impl AccountUpdate {
    pub fn status(status: AccountStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_pairing_payload(mut self, payload: impl Into<String>) -> Self {
        self.pairing_payload = Some(Some(payload.into()));
        self
    }

    pub fn clear_pairing_payload(mut self) -> Self {
        self.pairing_payload = Some(None);
        self
    }

    pub fn with_last_connected(mut self, at: DateTime<Utc>) -> Self {
        self.last_connected = Some(at);
        self
    }
}

/// Activity log vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Created,
    Connected,
    Disconnected,
    LoggedOut,
    ConnectionError,
    PairingIssued,
    PhoneChanged,
    MessageSent,
    MessageFailed,
    ReconnectScheduled,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::LoggedOut => "logged_out",
            Self::ConnectionError => "connection_error",
            Self::PairingIssued => "pairing_issued",
            Self::PhoneChanged => "phone_changed",
            Self::MessageSent => "message_sent",
            Self::MessageFailed => "message_failed",
            Self::ReconnectScheduled => "reconnect_scheduled",
        }
    }
}

impl FromStr for ActivityAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            "logged_out" => Self::LoggedOut,
            "connection_error" => Self::ConnectionError,
            "pairing_issued" => Self::PairingIssued,
            "phone_changed" => Self::PhoneChanged,
            "message_sent" => Self::MessageSent,
            "message_failed" => Self::MessageFailed,
            "reconnect_scheduled" => Self::ReconnectScheduled,
            other => return Err(Error::Store(format!("unknown activity action: {other}").into())),
        })
    }
}

impl fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
