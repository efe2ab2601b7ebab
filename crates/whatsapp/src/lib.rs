//! Multi-account WhatsApp session supervision.
//!
//! The [`Supervisor`] owns each account's connection lifecycle through an
//! opaque [`Transport`]; the [`WhatsAppOutbound`] dispatcher and the
//! [`BroadcastEngine`] send through whichever session the
//! [`SessionRegistry`] currently holds for an account.

pub mod broadcast;
pub mod credentials;
pub mod media;
pub mod outbound;
pub mod pairing;
pub mod registry;
pub mod retry;
pub mod service;
pub mod sidecar;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use {
    broadcast::{
        BroadcastControl, BroadcastEngine, BroadcastOutcome, BroadcastRequest, DelayRange,
        Recipient, RecipientResult, RunState, parse_recipients, render_template,
    },
    credentials::{CredentialState, CredentialStore, FileCredentialStore},
    media::MediaSource,
    outbound::{Outbound, WhatsAppOutbound},
    pairing::{PairingRenderer, QrPairingRenderer},
    registry::SessionRegistry,
    service::WhatsAppService,
    sidecar::SidecarTransport,
    store::{AccountStore, ActivityEntry, MemoryAccountStore, SqliteAccountStore},
    supervisor::{AccountStatusView, Supervisor},
    transport::{LifecycleEvent, Transport, TransportSession},
};
