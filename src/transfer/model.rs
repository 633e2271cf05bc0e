use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::discovery::model::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
    Error,
    Canceled,
    Active,
}

impl TransferStatus {
    /// A transfer in a terminal status never changes again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Error
                | TransferStatus::Canceled
                | TransferStatus::Rejected
        )
    }
}

impl Default for TransferStatus {
    fn default() -> Self {
        TransferStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Send,
    Receive,
}

impl Default for TransferType {
    fn default() -> Self {
        TransferType::Send
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    File,
    Text,
    Folder,
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::File
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Progress {
    pub current: i64,
    pub total: i64,
    pub speed: f64,
}

/// One transfer session, from ask to terminal status. Created by whichever
/// side initiates; mirrored into the receive side's table by the ask handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub sender: Peer,
    /// File or folder basename; empty for text payloads.
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default, rename = "savePath")]
    pub save_path: String,
    #[serde(default)]
    pub status: TransferStatus,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default, rename = "type")]
    pub transfer_type: TransferType,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub error_msg: String,
    /// Capability token for the upload leg, issued when the ask is accepted.
    #[serde(default)]
    pub token: String,
}

impl Transfer {
    pub fn new(id: impl Into<String>, sender: Peer) -> Self {
        Self {
            id: id.into(),
            create_time: Utc::now().timestamp_millis(),
            sender,
            status: TransferStatus::Pending,
            ..Default::default()
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    pub fn with_file_size(mut self, size: i64) -> Self {
        self.file_size = size;
        self
    }

    pub fn with_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = transfer_type;
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }
}

/// The receiver-side answer to a pending ask, produced either by auto-accept
/// or by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub accepted: bool,
    #[serde(default)]
    pub save_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferAskResponse {
    pub id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferUploadResponse {
    pub id: String,
    pub message: String,
    pub status: TransferStatus,
}
