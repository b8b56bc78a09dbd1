//! Identifier types shared by every layer
//!
//! All identifiers are fixed-size byte arrays compared bytewise, so that
//! their big-endian concatenation into storage keys sorts the same way the
//! values do.

use crate::error::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size of an address in bytes
pub const SIZE_ADDRESS: usize = 20;
/// Size of an id postfix in bytes
pub const SIZE_POSTFIX: usize = SIZE_ADDRESS;
/// Size of an [`Eid`] in bytes
pub const SIZE_EID: usize = SIZE_ADDRESS + SIZE_POSTFIX;
/// Size of a [`Salt`] in bytes
pub const SIZE_SALT: usize = 32;

/// Record format version
pub type Version = u8;

/// Current record format version
pub const CURRENT_VERSION: Version = 2;

// =============================================================================
// ADDRESS
// =============================================================================

/// 20-byte address: the tail of the Keccak-256 of a public key or a hash
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; SIZE_ADDRESS]);

impl Address {
    /// Parse from a slice of exactly 20 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SIZE_ADDRESS] = bytes
            .try_into()
            .map_err(|_| Error::InvalidId(format!("address length {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SIZE_ADDRESS] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        Address::from_slice(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// EID
// =============================================================================

/// 40-byte entity/object/oplog identifier.
///
/// The first 20 bytes are an address derived from a public key, the last 20
/// are either random or a postfix linking the id to another id. `EMPTY` and
/// `MAX` bracket every range scan.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Eid(pub [u8; SIZE_EID]);

impl Eid {
    /// Sentinel sorting before every real id
    pub const EMPTY: Eid = Eid([0; SIZE_EID]);
    /// Sentinel sorting after every real id
    pub const MAX: Eid = Eid([0xff; SIZE_EID]);

    /// Fully random id
    pub fn new_random() -> Self {
        let mut bytes = [0u8; SIZE_EID];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Id whose first half is `addr` and second half is random
    pub fn with_address(addr: &Address) -> Self {
        let mut id = Self::new_random();
        id.0[..SIZE_ADDRESS].copy_from_slice(&addr.0);
        id
    }

    /// Id whose first half is `addr` and second half is the first half of `postfix`
    pub fn with_address_postfix(addr: &Address, postfix: &Eid) -> Self {
        let mut bytes = [0u8; SIZE_EID];
        bytes[..SIZE_ADDRESS].copy_from_slice(&addr.0);
        bytes[SIZE_ADDRESS..].copy_from_slice(&postfix.0[..SIZE_POSTFIX]);
        Self(bytes)
    }

    /// Parse from a slice of exactly 40 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SIZE_EID] = bytes
            .try_into()
            .map_err(|_| Error::InvalidId(format!("id length {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Address half of the id
    pub fn address(&self) -> Address {
        let mut addr = [0u8; SIZE_ADDRESS];
        addr.copy_from_slice(&self.0[..SIZE_ADDRESS]);
        Address(addr)
    }

    /// True if both ids share the same address half
    pub fn is_same_key(&self, other: &Eid) -> bool {
        self.0[..SIZE_ADDRESS] == other.0[..SIZE_ADDRESS]
    }

    pub fn as_bytes(&self) -> &[u8; SIZE_EID] {
        &self.0
    }

    /// Base58 rendering (Bitcoin alphabet)
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eid({})", self.to_base58())
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl FromStr for Eid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::InvalidId(e.to_string()))?;
        Eid::from_slice(&raw)
    }
}

impl Serialize for Eid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Eid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// SALT
// =============================================================================

/// 32 random bytes appended to signed content and used as a chain code
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Salt(pub [u8; SIZE_SALT]);

impl Salt {
    /// Fresh random salt
    pub fn random() -> Self {
        let mut bytes = [0u8; SIZE_SALT];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SIZE_SALT] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("salt length {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; SIZE_SALT]
    }
}

impl Default for Salt {
    fn default() -> Self {
        Self([0; SIZE_SALT])
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Salt {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        crate::canonical::base64_bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Salt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw: Vec<u8> = crate::canonical::base64_bytes::deserialize(deserializer)?;
        Salt::from_slice(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// HASH
// =============================================================================

/// Keccak-256 digest, base64 in JSON
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidPayload(format!("hash length {}", bytes.len())))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        crate::canonical::base64_bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw: Vec<u8> = crate::canonical::base64_bytes::deserialize(deserializer)?;
        Hash32::from_slice(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eid_base58_roundtrip() {
        let id = Eid::new_random();
        let parsed: Eid = id.to_base58().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_eid_sentinels_bracket_random_ids() {
        for _ in 0..16 {
            let id = Eid::new_random();
            assert!(Eid::EMPTY <= id);
            assert!(id <= Eid::MAX);
        }
    }

    #[test]
    fn test_eid_json_is_base58_string() {
        let id = Eid::MAX;
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_base58()));
        let back: Eid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Eid::MAX);
    }

    #[test]
    fn test_eid_postfix() {
        let addr = Address([7; SIZE_ADDRESS]);
        let other = Eid([9; SIZE_EID]);
        let id = Eid::with_address_postfix(&addr, &other);
        assert_eq!(id.address(), addr);
        assert_eq!(&id.0[SIZE_ADDRESS..], &[9; SIZE_POSTFIX]);
        assert!(id.is_same_key(&Eid::with_address(&addr)));
    }

    #[test]
    fn test_eid_rejects_bad_length() {
        assert!(matches!(Eid::from_slice(&[1, 2, 3]), Err(Error::InvalidId(_))));
        let short = bs58::encode([1u8; 10]).into_string();
        assert!(short.parse::<Eid>().is_err());
    }
}
