//! Error taxonomy for account, session and delivery operations.

use std::time::Duration;

use thiserror::Error;

use crate::types::AccountId;

/// Boxed foreign error carried as a source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("account {0} not found")]
    NotFound(AccountId),

    #[error("invalid account id: {0:?}")]
    InvalidAccountId(String),

    #[error("connect for account {account_id} rate limited, retry in {}s", retry_after.as_secs())]
    RateLimited {
        account_id: AccountId,
        retry_after: Duration,
    },

    #[error("account {0} is not connected")]
    NotConnected(AccountId),

    #[error("media unreadable: {0}")]
    MediaUnreadable(#[source] BoxError),

    #[error("invalid recipient: {0:?}")]
    InvalidRecipient(String),

    #[error("permanent connection failure for account {account_id}: {reason}")]
    PermanentConnectionFailure { account_id: AccountId, reason: String },

    #[error("transient connection failure for account {account_id}: {reason}")]
    TransientConnectionFailure { account_id: AccountId, reason: String },

    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("credential store error: {0}")]
    Credentials(#[source] BoxError),

    #[error("account store error: {0}")]
    Store(#[source] BoxError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    pub fn credentials(err: impl Into<BoxError>) -> Self {
        Self::Credentials(err.into())
    }

    pub fn store(err: impl Into<BoxError>) -> Self {
        Self::Store(err.into())
    }

    pub fn media(err: impl Into<BoxError>) -> Self {
        Self::MediaUnreadable(err.into())
    }

    /// Precondition failures are reported to the caller rather than driving
    /// status transitions.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidAccountId(_)
                | Self::RateLimited { .. }
                | Self::NotConnected(_)
                | Self::MediaUnreadable(_)
                | Self::InvalidRecipient(_)
        )
    }
}
