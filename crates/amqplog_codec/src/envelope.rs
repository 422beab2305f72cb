//! Message envelopes stored in exchange logs.
//!
//! The exchange log holds each published message exactly once. The header
//! (routing key and properties) is CBOR; the body follows verbatim so it is
//! never re-encoded:
//!
//! ```text
//! | header_len u32 BE | CBOR header (header_len bytes) | body |
//! ```

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Encodes any serializable value as CBOR.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR value.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR for `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

/// Protocol-level message properties.
///
/// The routing engine never interprets these; they travel from publish to
/// delivery unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// MIME content type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// MIME content encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    /// Application headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// 1 = transient, 2 = persistent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    /// Message priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Correlation identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Reply-to address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Application message identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Message timestamp (seconds since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Message type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Creating application identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

impl MessageProperties {
    /// Creates empty properties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Adds an application header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[derive(Serialize, Deserialize)]
struct EnvelopeHeader {
    routing_key: String,
    #[serde(default)]
    properties: MessageProperties,
}

/// A published message as stored in the exchange log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Routing key supplied at publish time.
    pub routing_key: String,
    /// Protocol properties.
    pub properties: MessageProperties,
    /// Message body.
    pub body: Vec<u8>,
}

impl MessageEnvelope {
    /// Creates an envelope.
    pub fn new(routing_key: impl Into<String>, properties: MessageProperties, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            properties,
            body,
        }
    }

    /// Encodes the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be serialized or is larger than 4 GiB.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let header = to_cbor(&EnvelopeHeader {
            routing_key: self.routing_key.clone(),
            properties: self.properties.clone(),
        })?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| CodecError::encoding_failed("envelope header too large"))?;

        let mut buf = Vec::with_capacity(4 + header.len() + self.body.len());
        buf.extend_from_slice(&header_len.to_be_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Decodes an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the header length is out of bounds or the header is
    /// not valid CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < 4 {
            return Err(CodecError::UnexpectedEof {
                needed: 4,
                actual: bytes.len(),
            });
        }
        let header_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let header_end = 4usize.saturating_add(header_len);
        if bytes.len() < header_end {
            return Err(CodecError::UnexpectedEof {
                needed: header_end,
                actual: bytes.len(),
            });
        }

        let header: EnvelopeHeader = from_cbor(&bytes[4..header_end])?;
        Ok(Self {
            routing_key: header.routing_key,
            properties: header.properties,
            body: bytes[header_end..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_stored_verbatim_after_header() {
        let envelope = MessageEnvelope::new("k", MessageProperties::new(), b"hi".to_vec());
        let bytes = envelope.encode().unwrap();
        assert!(bytes.ends_with(b"hi"));
        assert_eq!(MessageEnvelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn properties_survive() {
        let properties = MessageProperties::new()
            .with_content_type("text/plain")
            .with_header("x-trace", "abc");
        let envelope = MessageEnvelope::new("a.b.c", properties.clone(), vec![0, 1, 2, 255]);
        let decoded = MessageEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.properties, properties);
        assert_eq!(decoded.routing_key, "a.b.c");
        assert_eq!(decoded.body, vec![0, 1, 2, 255]);
    }

    #[test]
    fn empty_body() {
        let envelope = MessageEnvelope::new("", MessageProperties::new(), Vec::new());
        let decoded = MessageEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn header_length_past_end_fails() {
        let mut bytes = 1000u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xA0]);
        assert!(matches!(
            MessageEnvelope::decode(&bytes),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn garbage_header_fails() {
        let mut bytes = 2u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        assert!(matches!(
            MessageEnvelope::decode(&bytes),
            Err(CodecError::DecodingFailed { .. })
        ));
    }

    #[test]
    fn cbor_helpers_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        let decoded: BTreeMap<String, u32> = from_cbor(&to_cbor(&map).unwrap()).unwrap();
        assert_eq!(decoded, map);
    }
}
