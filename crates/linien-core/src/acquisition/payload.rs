//! Result payloads and their content hashes.
//!
//! A payload is an opaque byte buffer tagged with a schema name. On its own
//! the supervisor never looks inside; consumers pick a decoder by schema.
//! Payloads always travel as the binary envelope
//!
//! ```text
//! [u16 BE: schema len][schema UTF-8][u32 BE: data len][data]
//! ```
//!
//! which text formats such as JSON carry as one lowercase hex string.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{LinienError, Result};

/// Identifier attached to frames acquired after `continue_acquisition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schema-tagged acquisition data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub schema: String,
    pub data: Bytes,
}

impl Payload {
    pub fn new(schema: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            schema: schema.into(),
            data: data.into(),
        }
    }

    /// Encode into the binary envelope.
    pub fn encode(&self) -> Result<Bytes> {
        let schema_len = u16::try_from(self.schema.len()).map_err(|_| LinienError::Validation {
            field: "schema".to_string(),
            message: format!("schema name of {} bytes is too long", self.schema.len()),
        })?;
        let data_len = u32::try_from(self.data.len()).map_err(|_| LinienError::Validation {
            field: "data".to_string(),
            message: format!("payload of {} bytes is too large", self.data.len()),
        })?;

        let mut buf = BytesMut::with_capacity(6 + self.schema.len() + self.data.len());
        buf.put_u16(schema_len);
        buf.put_slice(self.schema.as_bytes());
        buf.put_u32(data_len);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Decode a binary envelope. Trailing bytes are rejected.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let schema_len = take_len(&mut buf, 2)? as usize;
        let schema = std::str::from_utf8(take_bytes(&mut buf, schema_len)?)
            .map_err(|e| invalid(format!("schema is not UTF-8: {}", e)))?
            .to_string();
        let data_len = take_len(&mut buf, 4)? as usize;
        let data = Bytes::copy_from_slice(take_bytes(&mut buf, data_len)?);

        if buf.has_remaining() {
            return Err(invalid(format!("{} trailing bytes", buf.remaining())));
        }
        Ok(Self { schema, data })
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let envelope = self.encode().map_err(serde::ser::Error::custom)?;
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(&envelope))
        } else {
            serializer.serialize_bytes(&envelope)
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let envelope = if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            Bytes::from(hex::decode(text).map_err(serde::de::Error::custom)?)
        } else {
            Bytes::deserialize(deserializer)?
        };
        Self::decode(&envelope).map_err(serde::de::Error::custom)
    }
}

fn take_len(buf: &mut &[u8], width: usize) -> Result<u32> {
    if buf.remaining() < width {
        return Err(invalid("truncated length prefix".to_string()));
    }
    Ok(match width {
        2 => u32::from(buf.get_u16()),
        _ => buf.get_u32(),
    })
}

fn take_bytes<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(invalid(format!(
            "envelope truncated: need {} bytes, have {}",
            len,
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn invalid(message: String) -> LinienError {
    LinienError::Validation {
        field: "payload".to_string(),
        message,
    }
}

/// BLAKE3 digest identifying the content of one result frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash the full identity of a frame.
    ///
    /// The correlation id is part of the identity, so continuing acquisition
    /// under a new id always yields a fresh frame even if the data repeats.
    pub fn of(is_raw: bool, payload: &Payload, correlation_id: Option<CorrelationId>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[u8::from(is_raw)]);
        hasher.update(&(payload.schema.len() as u64).to_be_bytes());
        hasher.update(payload.schema.as_bytes());
        hasher.update(&(payload.data.len() as u64).to_be_bytes());
        hasher.update(&payload.data);
        match correlation_id {
            Some(id) => {
                hasher.update(&[1]);
                hasher.update(&id.0.to_be_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_layout() {
        let payload = Payload::new("ab", vec![1u8, 2, 3]);
        let encoded = payload.encode().unwrap();
        assert_eq!(&encoded[..], &[0, 2, b'a', b'b', 0, 0, 0, 3, 1, 2, 3]);
        assert_eq!(Payload::decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_decode_rejects_truncated_and_trailing() {
        assert!(Payload::decode(&[0]).is_err());
        assert!(Payload::decode(&[0, 5, b'a']).is_err());
        assert!(Payload::decode(&[0, 0, 0, 0, 0, 0, 9]).is_err());
        assert!(Payload::decode(&[0, 0, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_oversized_schema_is_rejected() {
        let payload = Payload::new("x".repeat(70_000), Bytes::new());
        assert!(matches!(payload.encode(), Err(LinienError::Validation { .. })));
    }

    #[test]
    fn test_hash_depends_on_every_component() {
        let payload = Payload::new("linien.trace.v1", vec![1u8, 2, 3]);
        let base = ContentHash::of(false, &payload, None);

        assert_eq!(base, ContentHash::of(false, &payload.clone(), None));
        assert_ne!(base, ContentHash::of(true, &payload, None));
        assert_ne!(base, ContentHash::of(false, &payload, Some(CorrelationId(0))));
        assert_ne!(
            base,
            ContentHash::of(false, &Payload::new("linien.raw.v1", vec![1u8, 2, 3]), None)
        );
        assert_ne!(
            base,
            ContentHash::of(false, &Payload::new("linien.trace.v1", vec![1u8, 2, 4]), None)
        );
    }

    #[test]
    fn test_hash_displays_as_hex() {
        let hash = ContentHash::of(false, &Payload::new("s", Bytes::new()), None);
        let shown = hash.to_string();
        assert_eq!(shown.len(), 64);
        assert_eq!(hex::decode(&shown).unwrap(), hash.0);
    }

    #[test]
    fn test_json_carries_the_envelope_as_hex() {
        let payload = Payload::new("ab", vec![1u8, 2, 3]);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!("0002616200000003010203"));

        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_json_rejects_malformed_envelopes() {
        assert!(serde_json::from_str::<Payload>("\"zz\"").is_err());
        assert!(serde_json::from_str::<Payload>("\"0005\"").is_err());
        assert!(serde_json::from_str::<Payload>("[0, 1]").is_err());
    }
}
