//! Wire types for the protocol sidecar websocket.

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    serde::{Deserialize, Serialize},
};

use wazper_common::AccountId;

use crate::{credentials::CredentialState, transport::OutboundPayload};

/// Messages sent to the sidecar.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Login {
        #[serde(rename = "accountId")]
        account_id: AccountId,
        credentials: CredentialState,
    },
    /// Unpair the device and close.
    Logout {
        #[serde(rename = "accountId")]
        account_id: AccountId,
    },
    /// Close the socket, keeping the pairing.
    Close {
        #[serde(rename = "accountId")]
        account_id: AccountId,
    },
    Send {
        #[serde(rename = "accountId")]
        account_id: AccountId,
        to: String,
        #[serde(rename = "requestId")]
        request_id: String,
        payload: WirePayload,
    },
}

/// Message content with media bytes base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WirePayload {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Video {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Audio {
        data: String,
        #[serde(rename = "mimetype")]
        mime_type: String,
    },
    Document {
        data: String,
        #[serde(rename = "mimetype")]
        mime_type: String,
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl From<&OutboundPayload> for WirePayload {
    fn from(payload: &OutboundPayload) -> Self {
        match payload {
            OutboundPayload::Text { text } => Self::Text { text: text.clone() },
            OutboundPayload::Image { data, caption } => Self::Image {
                data: STANDARD.encode(data),
                caption: caption.clone(),
            },
            OutboundPayload::Video { data, caption } => Self::Video {
                data: STANDARD.encode(data),
                caption: caption.clone(),
            },
            OutboundPayload::Audio { data, mime_type } => Self::Audio {
                data: STANDARD.encode(data),
                mime_type: mime_type.clone(),
            },
            OutboundPayload::Document {
                data,
                mime_type,
                file_name,
                caption,
            } => Self::Document {
                data: STANDARD.encode(data),
                mime_type: mime_type.clone(),
                file_name: file_name.clone(),
                caption: caption.clone(),
            },
        }
    }
}

/// Messages received from the sidecar.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarMessage {
    Qr {
        #[serde(rename = "accountId")]
        account_id: AccountId,
        qr: String,
    },
    Connected {
        #[serde(rename = "accountId")]
        account_id: AccountId,
        #[serde(rename = "phoneNumber", default)]
        phone_number: Option<String>,
        #[serde(default)]
        jid: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    Disconnected {
        #[serde(rename = "accountId")]
        account_id: AccountId,
        #[serde(rename = "statusCode", default)]
        status_code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    LoggedOut {
        #[serde(rename = "accountId")]
        account_id: AccountId,
    },
    CredsUpdate {
        #[serde(rename = "accountId")]
        account_id: AccountId,
        entries: CredentialState,
    },
    SendResult {
        #[serde(rename = "requestId")]
        request_id: String,
        success: bool,
        #[serde(rename = "messageId", default)]
        message_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        #[serde(rename = "accountId", default)]
        account_id: Option<AccountId>,
        error: String,
    },
}
