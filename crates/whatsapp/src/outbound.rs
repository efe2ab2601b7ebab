//! Outbound message dispatch through the live session of an account.

use std::sync::Arc;

use {
    async_trait::async_trait,
    tracing::{debug, instrument, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use wazper_common::{AccountId, ActivityAction, Error, Result};

use crate::{
    media::MediaSource,
    registry::SessionRegistry,
    store::{AccountStore, ActivityEntry},
    transport::{OutboundPayload, Receipt, USER_ADDRESS_SUFFIX},
};

/// Single-message sending surface used by callers and the broadcast engine.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, account_id: AccountId, to: &str, text: &str) -> Result<Receipt>;

    async fn send_media(
        &self,
        account_id: AccountId,
        to: &str,
        media: &MediaSource,
        caption: Option<&str>,
    ) -> Result<Receipt>;
}

/// Turn a raw phone number into a fully qualified address. Addresses that
/// already carry a server part are left alone.
pub fn normalize_address(to: &str) -> Result<String> {
    let to = to.trim();
    if to.contains('@') {
        return Ok(to.to_string());
    }
    let digits: String = to.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(Error::InvalidRecipient(to.to_string()));
    }
    Ok(format!("{digits}{USER_ADDRESS_SUFFIX}"))
}

fn display_recipient(address: &str) -> &str {
    address.split('@').next().unwrap_or(address)
}

/// Dispatcher backed by the session registry.
pub struct WhatsAppOutbound {
    registry: SessionRegistry,
    store: Arc<dyn AccountStore>,
}

impl WhatsAppOutbound {
    pub fn new(registry: SessionRegistry, store: Arc<dyn AccountStore>) -> Self {
        Self { registry, store }
    }

    async fn dispatch(
        &self,
        account_id: AccountId,
        to: &str,
        payload: OutboundPayload,
    ) -> Result<Receipt> {
        let handle = self
            .registry
            .get_authenticated(account_id)
            .await
            .ok_or(Error::NotConnected(account_id))?;
        let address = normalize_address(to)?;
        let kind = payload.kind();
        debug!(account_id = %account_id, to = %address, kind, "sending message");

        match handle.session.send(&address, payload).await {
            Ok(receipt) => {
                #[cfg(feature = "metrics")]
                counter!("wazper_messages_total", "result" => "sent").increment(1);
                self.log(
                    ActivityEntry::new(account_id, ActivityAction::MessageSent).with_details(
                        format!("Message sent to {}", display_recipient(&address)),
                    ),
                )
                .await;
                Ok(receipt)
            },
            Err(e) => {
                #[cfg(feature = "metrics")]
                counter!("wazper_messages_total", "result" => "failed").increment(1);
                warn!(account_id = %account_id, to = %address, kind, error = %e, "send failed");
                self.log(
                    ActivityEntry::new(account_id, ActivityAction::MessageFailed).with_details(
                        format!(
                            "Failed to send to {}: {e}",
                            display_recipient(&address)
                        ),
                    ),
                )
                .await;
                Err(match e {
                    Error::DispatchFailure(_) => e,
                    other => Error::DispatchFailure(other.to_string()),
                })
            },
        }
    }

    async fn log(&self, entry: ActivityEntry) {
        if let Err(e) = self.store.append_activity_log(entry).await {
            warn!(error = %e, "failed to append activity log");
        }
    }
}

#[async_trait]
impl Outbound for WhatsAppOutbound {
    #[instrument(skip(self, text), fields(account_id = %account_id))]
    async fn send_text(&self, account_id: AccountId, to: &str, text: &str) -> Result<Receipt> {
        self.dispatch(account_id, to, OutboundPayload::Text {
            text: text.to_string(),
        })
        .await
    }

    #[instrument(skip(self, media, caption), fields(account_id = %account_id))]
    async fn send_media(
        &self,
        account_id: AccountId,
        to: &str,
        media: &MediaSource,
        caption: Option<&str>,
    ) -> Result<Receipt> {
        if self.registry.get_authenticated(account_id).await.is_none() {
            return Err(Error::NotConnected(account_id));
        }
        let loaded = media.load().await?;
        self.dispatch(account_id, to, loaded.to_payload(caption))
            .await
    }
}
