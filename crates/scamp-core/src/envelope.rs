//! Request/reply envelopes and the JSON header that introduces each message.
//!
//! A message on the wire is one `Header` packet whose body is a JSON
//! [`PacketHeader`], followed by zero or more `Data` packets carrying the blob,
//! terminated by an `Eof` packet.

use crate::error::{ScampError, ScampResult};
use serde::{Deserialize, Serialize};

/// Serialization format of a request or reply blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeFormat {
    Json,
    JsonStore,
}

impl Default for EnvelopeFormat {
    fn default() -> Self {
        EnvelopeFormat::Json
    }
}

/// Whether a header opens a request or answers one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Reply,
}

/// JSON body of a `Header` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketHeader {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default)]
    pub envelope: EnvelopeFormat,
    #[serde(default)]
    pub version: i64,
    pub message_type: MessageType,
    #[serde(default)]
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifying_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl PacketHeader {
    /// Serialize to the JSON bytes carried by a `Header` packet.
    pub fn to_bytes(&self) -> ScampResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a `Header` packet body.
    pub fn from_bytes(body: &[u8]) -> ScampResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// An inbound request as seen by a service action.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Request {
    pub action: String,
    pub envelope: EnvelopeFormat,
    pub version: i64,
    pub blob: Vec<u8>,
    pub request_id: u64,
    pub ticket: Option<String>,
    pub identifying_token: Option<String>,
}

impl Request {
    /// Build a request from its header and the reassembled blob.
    pub fn from_parts(header: PacketHeader, blob: Vec<u8>) -> ScampResult<Self> {
        if header.message_type != MessageType::Request {
            return Err(ScampError::Protocol(format!(
                "expected request header, got {:?}",
                header.message_type
            )));
        }
        Ok(Self {
            action: header.action,
            envelope: header.envelope,
            version: header.version,
            blob,
            request_id: header.request_id,
            ticket: header.ticket,
            identifying_token: header.identifying_token,
        })
    }

    /// Header to send ahead of this request's blob.
    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            action: self.action.clone(),
            envelope: self.envelope,
            version: self.version,
            message_type: MessageType::Request,
            request_id: self.request_id,
            ticket: self.ticket.clone(),
            identifying_token: self.identifying_token.clone(),
            error: None,
            error_code: None,
        }
    }
}

/// A reply produced by a service action.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    pub blob: Vec<u8>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl Reply {
    pub fn new(blob: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: blob.into(),
            ..Default::default()
        }
    }

    /// An error reply with an empty blob.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            blob: Vec::new(),
            error: Some(message.into()),
            error_code: Some(code.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.error_code.is_some()
    }

    /// Header answering `request_id`.
    pub fn header(&self, envelope: EnvelopeFormat, request_id: u64) -> PacketHeader {
        PacketHeader {
            action: String::new(),
            envelope,
            version: 1,
            message_type: MessageType::Reply,
            request_id,
            ticket: None,
            identifying_token: None,
            error: self.error.clone(),
            error_code: self.error_code.clone(),
        }
    }

    /// Build a reply from its header and the reassembled blob.
    pub fn from_parts(header: PacketHeader, blob: Vec<u8>) -> ScampResult<Self> {
        if header.message_type != MessageType::Reply {
            return Err(ScampError::Protocol(format!(
                "expected reply header, got {:?}",
                header.message_type
            )));
        }
        Ok(Self {
            blob,
            error: header.error,
            error_code: header.error_code,
        })
    }
}
