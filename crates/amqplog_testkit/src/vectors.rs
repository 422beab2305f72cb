//! Byte-level test vectors for amqplog's on-log layouts.
//!
//! Positions and index records are read by anything that inspects a log
//! directory, so their encodings are pinned here. Vectors serialize to JSON
//! for use by external tooling.

use amqplog_codec::{IndexRecord, Position};
use serde::{Deserialize, Serialize};

/// A test vector that can be shared with external tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestVector {
    /// Unique identifier for this vector.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Input data (hex-encoded).
    pub input_hex: String,
    /// Expected re-encoding (hex-encoded); empty when decoding must fail.
    pub expected_hex: String,
    /// Expected error kind (if this should fail).
    pub expected_error: Option<String>,
}

impl TestVector {
    fn ok(id: &str, description: &str, hex: &str) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            input_hex: hex.into(),
            expected_hex: hex.into(),
            expected_error: None,
        }
    }

    fn err(id: &str, description: &str, hex: &str, error: &str) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            input_hex: hex.into(),
            expected_hex: String::new(),
            expected_error: Some(error.into()),
        }
    }
}

/// Position test vectors.
pub fn position_vectors() -> Vec<TestVector> {
    vec![
        TestVector::ok(
            "position_earliest",
            "Earliest position (0, 0)",
            "00000000000000000000000000000000",
        ),
        TestVector::ok(
            "position_3_17",
            "Position (3, 17), both fields big-endian",
            "00000000000000030000000000000011",
        ),
        TestVector::ok(
            "position_max_segment",
            "Position (u64::MAX, 1)",
            "ffffffffffffffff0000000000000001",
        ),
        TestVector::err(
            "position_short",
            "Fifteen bytes",
            "000000000000000000000000000000",
            "UnexpectedEof",
        ),
        TestVector::err(
            "position_long",
            "Seventeen bytes",
            "0000000000000000000000000000000000",
            "TrailingBytes",
        ),
    ]
}

/// Index record test vectors.
pub fn index_record_vectors() -> Vec<TestVector> {
    vec![
        TestVector::ok(
            "index_orders",
            "Record for exchange 'orders' at (3, 17)",
            "0000000000000003000000000000001100066f7264657273",
        ),
        TestVector::ok(
            "index_default_exchange",
            "Record for the default exchange at (0, 0)",
            "000000000000000000000000000000000000",
        ),
        TestVector::err(
            "index_missing_length",
            "Position without a name length",
            "00000000000000000000000000000000",
            "UnexpectedEof",
        ),
        TestVector::err(
            "index_short_name",
            "Name length exceeds remaining bytes",
            "0000000000000000000000000000000000056f7264",
            "UnexpectedEof",
        ),
        TestVector::err(
            "index_trailing",
            "Extra byte after the name",
            "0000000000000000000000000000000000016100",
            "TrailingBytes",
        ),
        TestVector::err(
            "index_bad_utf8",
            "Name is not UTF-8",
            "000000000000000000000000000000000001ff",
            "InvalidUtf8",
        ),
    ]
}

/// Generate all test vectors as JSON.
pub fn all_vectors_json() -> String {
    let vectors = AllTestVectors {
        position: position_vectors(),
        index_record: index_record_vectors(),
    };

    serde_json::to_string_pretty(&vectors).expect("Failed to serialize vectors")
}

#[derive(Debug, Serialize, Deserialize)]
struct AllTestVectors {
    position: Vec<TestVector>,
    index_record: Vec<TestVector>,
}

/// Encodes bytes as lowercase hex.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decodes lowercase or uppercase hex.
///
/// # Panics
///
/// Panics on odd length or a non-hex digit.
pub fn hex_decode(hex: &str) -> Vec<u8> {
    assert!(hex.len() % 2 == 0, "odd-length hex string");
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("Invalid hex digit"))
        .collect()
}

/// Decodes `vector` with `decode`, re-encodes with `encode` and checks the
/// outcome against the vector. Returns a description of the mismatch.
pub fn check_vector<T, E: std::fmt::Debug>(
    vector: &TestVector,
    decode: impl Fn(&[u8]) -> Result<T, E>,
    encode: impl Fn(&T) -> Vec<u8>,
) -> Result<(), String> {
    let input = hex_decode(&vector.input_hex);
    match (decode(&input), &vector.expected_error) {
        (Ok(value), None) => {
            let encoded = hex_encode(&encode(&value));
            if encoded == vector.expected_hex {
                Ok(())
            } else {
                Err(format!(
                    "{}: encoded {encoded}, expected {}",
                    vector.id, vector.expected_hex
                ))
            }
        }
        (Err(e), Some(kind)) => {
            let actual = format!("{e:?}");
            if actual.starts_with(kind.as_str()) {
                Ok(())
            } else {
                Err(format!("{}: got {actual}, expected {kind}", vector.id))
            }
        }
        (Ok(_), Some(kind)) => Err(format!("{}: decoded, expected {kind}", vector.id)),
        (Err(e), None) => Err(format!("{}: unexpected error {e:?}", vector.id)),
    }
}

/// Checks every position vector.
pub fn check_position_vectors() -> Vec<String> {
    position_vectors()
        .iter()
        .filter_map(|v| check_vector(v, Position::decode, |p| p.encode().to_vec()).err())
        .collect()
}

/// Checks every index record vector.
pub fn check_index_record_vectors() -> Vec<String> {
    index_record_vectors()
        .iter()
        .filter_map(|v| {
            check_vector(v, IndexRecord::decode, |r| {
                r.encode().expect("Failed to re-encode record")
            })
            .err()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_helpers() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0xff]), "00abff");
        assert_eq!(hex_decode("00ABff"), vec![0x00, 0xab, 0xff]);
    }

    #[test]
    fn test_position_vectors() {
        let failures = check_position_vectors();
        assert!(failures.is_empty(), "{failures:?}");
    }

    #[test]
    fn test_index_record_vectors() {
        let failures = check_index_record_vectors();
        assert!(failures.is_empty(), "{failures:?}");
    }

    #[test]
    fn test_index_record_prefix_is_position() {
        let input = hex_decode(&index_record_vectors()[0].input_hex);
        assert_eq!(Position::decode_prefix(&input).unwrap(), Position::new(3, 17));
    }

    #[test]
    fn test_all_vectors_json() {
        let json = all_vectors_json();
        assert!(json.contains("position_3_17"));
        assert!(json.contains("index_record"));
    }
}
