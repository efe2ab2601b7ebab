//! Media sources and payload construction per content kind.

use std::path::{Path, PathBuf};

use bytes::Bytes;

use wazper_common::{Error, Result};

use crate::transport::OutboundPayload;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Resolve a MIME type from a file extension. Unknown extensions map to
/// `application/octet-stream`.
pub fn mime_from_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "m4a" => "audio/mp4",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => OCTET_STREAM,
    }
}

fn mime_from_name(name: &str) -> &'static str {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map_or(OCTET_STREAM, mime_from_extension)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::Document
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaData {
    Bytes(Bytes),
    Path(PathBuf),
}

/// Media as handed to the dispatcher, before it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub data: MediaData,
    pub mime_type: Option<String>,
    /// Name the file was uploaded under.
    pub file_name: Option<String>,
}

impl MediaSource {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            data: MediaData::Bytes(data.into()),
            mime_type: None,
            file_name: None,
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            data: MediaData::Path(path.into()),
            mime_type: None,
            file_name: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Read the payload and settle its MIME type and file name.
    pub async fn load(&self) -> Result<LoadedMedia> {
        let (data, path_name) = match &self.data {
            MediaData::Bytes(bytes) => (bytes.clone(), None),
            MediaData::Path(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    Error::media(format!("cannot read {}: {e}", path.display()))
                })?;
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string);
                (Bytes::from(bytes), name)
            },
        };
        if data.is_empty() {
            return Err(Error::media("media payload is empty"));
        }

        let file_name = self
            .file_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or(path_name)
            .unwrap_or_else(|| "file".to_string());
        let mime_type = self
            .mime_type
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| mime_from_name(&file_name).to_string());

        Ok(LoadedMedia {
            kind: MediaKind::from_mime(&mime_type),
            data,
            mime_type,
            file_name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedMedia {
    pub data: Bytes,
    pub mime_type: String,
    pub kind: MediaKind,
    pub file_name: String,
}

impl LoadedMedia {
    /// Build the protocol payload. Empty captions are omitted and audio never
    /// carries one.
    pub fn to_payload(&self, caption: Option<&str>) -> OutboundPayload {
        let caption = caption
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let data = self.data.clone();
        match self.kind {
            MediaKind::Image => OutboundPayload::Image { data, caption },
            MediaKind::Video => OutboundPayload::Video { data, caption },
            MediaKind::Audio => OutboundPayload::Audio {
                data,
                mime_type: self.mime_type.clone(),
            },
            MediaKind::Document => OutboundPayload::Document {
                data,
                mime_type: self.mime_type.clone(),
                file_name: self.file_name.clone(),
                caption,
            },
        }
    }
}
