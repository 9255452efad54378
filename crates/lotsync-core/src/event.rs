//! Versioned broadcast envelope.
//!
//! Every outbound message is wrapped so older and newer subscribers can both
//! parse the stream; unknown kinds or extra fields are ignored by consumers,
//! never treated as protocol errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::model::PageKind;

/// Wire protocol version carried on every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionReady,
    LotCreated,
    LotUpdated,
    AuctionCreated,
    SyncRunFinished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionReady => "connection_ready",
            Self::LotCreated => "lot_created",
            Self::LotUpdated => "lot_updated",
            Self::AuctionCreated => "auction_created",
            Self::SyncRunFinished => "sync_run_finished",
        }
    }
}

/// The mandatory wrapper around every broadcast message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: JsonValue,
}

impl Envelope {
    pub fn new(kind: EventKind, payload: JsonValue) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn connection_ready() -> Self {
        Self::new(EventKind::ConnectionReady, JsonValue::Null)
    }
}

/// Payload for `lot_created` / `lot_updated` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotChangePayload {
    pub auction_code: String,
    pub lot_code: String,
    pub page_kind: PageKind,
    pub changed_fields: Vec<String>,
    /// Fingerprint now stored for this lot's page kind.
    pub fingerprint: String,
}

impl LotChangePayload {
    pub fn into_envelope(self, kind: EventKind) -> Envelope {
        let payload = serde_json::to_value(&self).unwrap_or(JsonValue::Null);
        Envelope::new(kind, payload)
    }
}
