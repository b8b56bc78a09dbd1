//! Keccak-256 hashing and secp256k1 signatures
//!
//! Signatures are 65 bytes `r ‖ s ‖ v` over a 32-byte Keccak digest, so the
//! signer's public key can be recovered from the signature alone.

use crate::error::{Error, Result};
use crate::types::{Address, Salt, SIZE_ADDRESS};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use sha3::{Digest, Keccak256};

/// Size of a recoverable signature
pub const SIZE_SIGNATURE: usize = 65;

// =============================================================================
// HASHING
// =============================================================================

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Keccak-256 over the concatenation of `parts`
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Last 20 bytes of a 32-byte hash
pub fn hash_to_address(hash: &[u8; 32]) -> Address {
    let mut addr = [0u8; SIZE_ADDRESS];
    addr.copy_from_slice(&hash[32 - SIZE_ADDRESS..]);
    Address(addr)
}

/// Address of a SEC1 public key (compressed or uncompressed)
pub fn public_key_to_address(pubkey: &[u8]) -> Result<Address> {
    let vk = VerifyingKey::from_sec1_bytes(pubkey).map_err(|e| Error::InvalidKey(e.to_string()))?;
    Ok(verifying_key_to_address(&vk))
}

pub(crate) fn verifying_key_to_address(vk: &VerifyingKey) -> Address {
    let point = vk.to_encoded_point(false);
    // skip the 0x04 tag
    hash_to_address(&keccak256(&point.as_bytes()[1..]))
}

// =============================================================================
// KEYS
// =============================================================================

/// A secp256k1 key pair
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Fresh random key
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        loop {
            let mut raw = [0u8; 32];
            rng.fill_bytes(&mut raw);
            if let Ok(signing) = SigningKey::from_slice(&raw) {
                return Self { signing };
            }
        }
    }

    pub fn from_private_bytes(raw: &[u8]) -> Result<Self> {
        let signing = SigningKey::from_slice(raw).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self { signing })
    }

    pub(crate) fn from_signing_key(signing: SigningKey) -> Self {
        Self { signing }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes().into()
    }

    /// 65-byte uncompressed public key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    pub fn address(&self) -> Address {
        verifying_key_to_address(self.signing.verifying_key())
    }

    /// Recoverable signature over a 32-byte digest
    pub fn sign_hash(&self, hash: &[u8; 32]) -> Result<[u8; SIZE_SIGNATURE]> {
        let (sig, recid) = self
            .signing
            .sign_prehash_recoverable(hash)
            .map_err(|_| Error::InvalidSignature)?;
        let mut out = [0u8; SIZE_SIGNATURE];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte();
        Ok(out)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", self.address())
    }
}

// =============================================================================
// VERIFICATION
// =============================================================================

fn parse_signature(sig: &[u8]) -> Result<Signature> {
    if sig.len() < 64 {
        return Err(Error::InvalidSignature);
    }
    Signature::from_slice(&sig[..64]).map_err(|_| Error::InvalidSignature)
}

/// Uncompressed public key of the signer of `hash`
pub fn recover_public_key(hash: &[u8; 32], sig: &[u8]) -> Result<Vec<u8>> {
    if sig.len() != SIZE_SIGNATURE {
        return Err(Error::InvalidSignature);
    }
    let signature = parse_signature(sig)?;
    let recid = RecoveryId::from_byte(sig[64]).ok_or(Error::InvalidSignature)?;
    let vk = VerifyingKey::recover_from_prehash(hash, &signature, recid)
        .map_err(|_| Error::InvalidSignature)?;
    Ok(vk.to_encoded_point(false).as_bytes().to_vec())
}

/// Check `sig[..64]` over `hash` against a SEC1 public key
pub fn verify_signature(pubkey: &[u8], hash: &[u8; 32], sig: &[u8]) -> Result<()> {
    let vk = VerifyingKey::from_sec1_bytes(pubkey).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let signature = parse_signature(sig)?;
    vk.verify_prehash(hash, &signature)
        .map_err(|_| Error::InvalidSignature)
}

/// Digest signed by [`sign_data`]: `keccak(bytes ‖ salt)`
pub fn data_hash(bytes: &[u8], salt: &Salt) -> [u8; 32] {
    keccak256_concat(&[bytes, &salt.0])
}

/// Salt, hash and sign arbitrary content
pub fn sign_data(key: &KeyPair, bytes: &[u8]) -> Result<(Salt, [u8; 32], [u8; SIZE_SIGNATURE])> {
    let salt = Salt::random();
    let hash = data_hash(bytes, &salt);
    let sig = key.sign_hash(&hash)?;
    Ok((salt, hash, sig))
}

/// Verify content signed by [`sign_data`]
pub fn verify_data(bytes: &[u8], pubkey: &[u8], salt: &Salt, sig: &[u8]) -> Result<()> {
    verify_signature(pubkey, &data_hash(bytes, salt), sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(keccak256_concat(&[b"ab", b"c"]), keccak256(b"abc"));
    }

    #[test]
    fn test_sign_recover() {
        let key = KeyPair::generate();
        let hash = keccak256(b"payload");
        let sig = key.sign_hash(&hash).unwrap();
        let pubkey = recover_public_key(&hash, &sig).unwrap();
        assert_eq!(pubkey, key.public_key_bytes());
        assert_eq!(public_key_to_address(&pubkey).unwrap(), key.address());
        assert!(verify_signature(&pubkey, &hash, &sig).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let key = KeyPair::generate();
        let other = KeyPair::generate();
        let hash = keccak256(b"payload");
        let sig = key.sign_hash(&hash).unwrap();
        assert!(matches!(
            verify_signature(&other.public_key_bytes(), &hash, &sig),
            Err(Error::InvalidSignature)
        ));
        assert!(recover_public_key(&hash, &sig[..64]).is_err());
    }

    #[test]
    fn test_sign_data() {
        let key = KeyPair::generate();
        let (salt, hash, sig) = sign_data(&key, b"content").unwrap();
        assert_eq!(hash, data_hash(b"content", &salt));
        assert!(verify_data(b"content", &key.public_key_bytes(), &salt, &sig).is_ok());
        assert!(verify_data(b"contenT", &key.public_key_bytes(), &salt, &sig).is_err());
    }

    #[test]
    fn test_private_bytes_roundtrip() {
        let key = KeyPair::generate();
        let back = KeyPair::from_private_bytes(&key.private_bytes()).unwrap();
        assert_eq!(back.address(), key.address());
        assert!(KeyPair::from_private_bytes(&[0u8; 32]).is_err());
    }
}
