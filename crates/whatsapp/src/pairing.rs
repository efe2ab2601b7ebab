//! Rendering of pairing challenges into something a user can scan.

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    qrcode::{QrCode, render::svg},
};

use wazper_common::BoxError;

pub trait PairingRenderer: Send + Sync {
    /// Turn a raw pairing challenge into a displayable payload.
    fn render(&self, challenge: &str) -> Result<String, BoxError>;
}

/// Renders the challenge as an SVG QR code wrapped in a `data:` URL.
#[derive(Debug, Clone, Copy)]
pub struct QrPairingRenderer {
    min_size: u32,
}

impl Default for QrPairingRenderer {
    fn default() -> Self {
        Self { min_size: 256 }
    }
}

impl QrPairingRenderer {
    pub fn with_min_size(mut self, min_size: u32) -> Self {
        self.min_size = min_size;
        self
    }
}

impl PairingRenderer for QrPairingRenderer {
    fn render(&self, challenge: &str) -> Result<String, BoxError> {
        let code = QrCode::new(challenge.as_bytes())?;
        let image = code
            .render::<svg::Color>()
            .min_dimensions(self.min_size, self.min_size)
            .build();
        Ok(format!(
            "data:image/svg+xml;base64,{}",
            STANDARD.encode(image.as_bytes())
        ))
    }
}

/// Passes the challenge through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPairingRenderer;

impl PairingRenderer for RawPairingRenderer {
    fn render(&self, challenge: &str) -> Result<String, BoxError> {
        Ok(challenge.to_string())
    }
}
