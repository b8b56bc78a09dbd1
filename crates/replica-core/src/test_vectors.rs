//! Fixed vectors that other implementations must reproduce byte for byte

use crate::crypto::*;
use crate::timestamp::Timestamp;
use crate::types::*;
use serde::Serialize;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub inputs: serde_json::Value,
    pub output_hex: String,
}

pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![
        keccak_empty_vector(),
        address_vector(),
        timestamp_vector(),
        eid_vector(),
    ]
}

fn keccak_empty_vector() -> TestVector {
    TestVector {
        name: "keccak256_empty".into(),
        description: "Keccak-256 of the empty string".into(),
        inputs: serde_json::json!({ "data_hex": "" }),
        output_hex: hex::encode(keccak256(b"")),
    }
}

fn address_vector() -> TestVector {
    let mut raw = [0u8; 32];
    raw[31] = 1;
    let key = KeyPair::from_private_bytes(&raw).unwrap();
    TestVector {
        name: "address_from_private_key_one".into(),
        description: "address = keccak256(uncompressed_pub[1..])[12..]".into(),
        inputs: serde_json::json!({ "private_key_hex": hex::encode(raw) }),
        output_hex: hex::encode(key.address().0),
    }
}

fn timestamp_vector() -> TestVector {
    let ts = Timestamp::new(1_700_000_000, 123);
    TestVector {
        name: "timestamp_bytes".into(),
        description: "seconds i64 BE ‖ nanos u32 BE".into(),
        inputs: serde_json::to_value(ts).unwrap(),
        output_hex: hex::encode(ts.to_bytes()),
    }
}

fn eid_vector() -> TestVector {
    TestVector {
        name: "eid_empty_base58".into(),
        description: "base58 (Bitcoin alphabet) of the empty id".into(),
        inputs: serde_json::json!({ "bytes_hex": hex::encode(Eid::EMPTY.0) }),
        output_hex: hex::encode(Eid::EMPTY.to_base58()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_vectors() {
        let vectors = generate_test_vectors();
        assert_eq!(vectors.len(), 4);
        let json = serde_json::to_string_pretty(&vectors).unwrap();
        assert!(json.contains("keccak256_empty"));
    }

    #[test]
    fn test_keccak_vector() {
        let v = keccak_empty_vector();
        assert_eq!(
            v.output_hex,
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_address_vector() {
        let v = address_vector();
        assert_eq!(v.output_hex, "7e5f4552091a69125d5dfcb7b8c2659029395bdf");
    }

    #[test]
    fn test_timestamp_vector() {
        let v = timestamp_vector();
        assert_eq!(v.output_hex, "000000006553f1000000007b");
    }

    #[test]
    fn test_eid_vector() {
        let v = eid_vector();
        assert_eq!(v.output_hex, hex::encode("1".repeat(40)));
    }
}
