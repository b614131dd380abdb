//! Queue wire format
//!
//! Intents travel as a versioned JSON object:
//!
//! ```json
//! {"version":1,"transfer_id":"01J...","sender_id":1,"recipient_id":2,"amount":300,"created_at":"..."}
//! ```
//!
//! Anything that fails to decode (bad JSON, unknown version, invalid intent)
//! is a `MalformedPayload` and goes to the dead-letter path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transfer::error::TransferError;
use crate::transfer::types::{AccountId, MinorUnits, TransferIntent};

pub const WIRE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IntentEnvelope {
    version: u32,
    transfer_id: String,
    sender_id: i64,
    recipient_id: i64,
    amount: MinorUnits,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

pub fn encode_intent(intent: &TransferIntent) -> Result<Vec<u8>, TransferError> {
    let envelope = IntentEnvelope {
        version: WIRE_VERSION,
        transfer_id: intent.transfer_id.to_string(),
        sender_id: intent.sender_id.0,
        recipient_id: intent.recipient_id.0,
        amount: intent.amount,
        created_at: intent.created_at,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode_intent(payload: &[u8]) -> Result<TransferIntent, TransferError> {
    let envelope: IntentEnvelope = serde_json::from_slice(payload)?;

    if envelope.version != WIRE_VERSION {
        return Err(TransferError::MalformedPayload(format!(
            "unsupported payload version {}",
            envelope.version
        )));
    }

    let transfer_id = envelope.transfer_id.parse().map_err(|_| {
        TransferError::MalformedPayload(format!("invalid transfer_id: {}", envelope.transfer_id))
    })?;

    let intent = TransferIntent {
        transfer_id,
        sender_id: AccountId(envelope.sender_id),
        recipient_id: AccountId(envelope.recipient_id),
        amount: envelope.amount,
        created_at: envelope.created_at,
    };
    intent
        .validate()
        .map_err(|e| TransferError::MalformedPayload(e.to_string()))?;

    Ok(intent)
}
