//! JSON wire protocol between clients and the gateway.
//!
//! Inbound: `{"username", "image" (base64 JPEG/PNG), "timestamp"?}`.
//! Outbound: `{"action", "reason", "actual_username", "send_time", "finish_time"}`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decision::domain::action::{Action, Reason};
use crate::decision::domain::decision_engine::Decision;
use crate::shared::frame::Frame;

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ClientMessage {
    pub username: String,
    pub image: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub action: Action,
    pub reason: Reason,
    pub actual_username: String,
    pub send_time: f64,
    pub finish_time: f64,
}

impl From<Decision> for ServerMessage {
    fn from(d: Decision) -> Self {
        Self {
            action: d.action,
            reason: d.reason,
            actual_username: d.username,
            send_time: d.sent_at,
            finish_time: d.finished_at,
        }
    }
}

/// Application close codes (WebSocket 4000-4999 range).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCode {
    ServerFull,
    NotAvailable,
    Blocked,
    SignedOut,
    IdleTimeout,
    DuplicateSession,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::ServerFull => 4001,
            CloseCode::NotAvailable => 4002,
            CloseCode::Blocked => 4003,
            CloseCode::SignedOut => 4004,
            CloseCode::IdleTimeout => 4005,
            CloseCode::DuplicateSession => 4006,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            CloseCode::ServerFull => "server full",
            CloseCode::NotAvailable => "not available",
            CloseCode::Blocked => "blocked",
            CloseCode::SignedOut => "signed out",
            CloseCode::IdleTimeout => "idle timeout",
            CloseCode::DuplicateSession => "duplicate session",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        [
            CloseCode::ServerFull,
            CloseCode::NotAvailable,
            CloseCode::Blocked,
            CloseCode::SignedOut,
            CloseCode::IdleTimeout,
            CloseCode::DuplicateSession,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("image is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image could not be decoded: {0}")]
    Image(#[from] image::ImageError),
}

pub fn parse_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decodes the message's base64 image into a frame.
///
/// Accepts an optional `data:image/...;base64,` prefix.
pub fn decode_image(message: &ClientMessage, index: u64) -> Result<Frame, ProtocolError> {
    let payload = match message.image.split_once(";base64,") {
        Some((_, data)) => data,
        None => message.image.as_str(),
    };
    let bytes = STANDARD.decode(payload.trim())?;
    Ok(Frame::decode(&bytes, index)?)
}

pub fn encode_response(message: &ServerMessage) -> String {
    // Serialization of plain enums, strings and floats cannot fail;
    // non-finite times are the only edge and are sanitized by callers.
    serde_json::to_string(message).unwrap_or_else(|_| String::from("{}"))
}
