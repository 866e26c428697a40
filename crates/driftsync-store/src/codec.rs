//! CBOR encoding of relay payloads and device id generation.

use bytes::Bytes;
use driftsync_core::{DeviceId, LogChange, SharedEntryPayload};

use crate::error::{Result, StoreError};

/// Encode an entry payload for the relay.
pub fn encode_payload(payload: &SharedEntryPayload) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(payload, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a relay payload.
pub fn decode_payload(data: &[u8]) -> Result<SharedEntryPayload> {
    ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn encode_change(change: &LogChange) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(change, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode_change(data: &[u8]) -> Result<LogChange> {
    ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// A fresh random device id (16 hex characters).
pub fn generate_device_id() -> DeviceId {
    let bytes: [u8; 8] = rand::random();
    DeviceId::new(hex::encode(bytes))
}

/// Current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::PrimaryKey;
    use serde_json::json;

    #[test]
    fn test_payload_survives_cbor() {
        let payload = SharedEntryPayload {
            collection: "tags".into(),
            pk: PrimaryKey::Compound(vec![json!("work"), json!(3)]),
            change: LogChange::Modify {
                field: "color".into(),
                value: json!({"r": 255, "g": 0.5, "b": null}),
            },
        };

        let data = encode_payload(&payload).unwrap();
        assert_eq!(decode_payload(&data).unwrap(), payload);
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert!(matches!(
            decode_payload(&[0xff, 0x00, 0x13]),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_device_ids_are_hex_and_distinct() {
        let a = generate_device_id();
        let b = generate_device_id();
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
