//! Decoding of the farm stream's push envelopes.
//!
//! Every frame on the farm socket is a JSON object of the form
//! `{ "type": ..., "device_id": ..., "data": ... }`. Only `telemetry` is
//! routed to the sample store; every other kind is passed through as
//! [`PushMessage::Other`] so newer backends can add message kinds freely.

use serde::Deserialize;
use serde_json::Value;

use crate::error::DecodeError;
use crate::types::Sample;

const TELEMETRY: &str = "telemetry";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Telemetry { device_id: String, sample: Sample },
    Other { kind: String },
}

pub fn decode_push(text: &str) -> Result<PushMessage, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.kind != TELEMETRY {
        return Ok(PushMessage::Other {
            kind: envelope.kind,
        });
    }

    let device_id = envelope
        .device_id
        .filter(|id| !id.is_empty())
        .ok_or(DecodeError::MissingDeviceId)?;
    let data = envelope.data.ok_or(DecodeError::MissingData)?;
    let sample: Sample = serde_json::from_value(data).map_err(DecodeError::Payload)?;

    Ok(PushMessage::Telemetry {
        sample: sample.for_device(&device_id),
        device_id,
    })
}

pub fn decode_push_bytes(bytes: &[u8]) -> Result<PushMessage, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    decode_push(text)
}
