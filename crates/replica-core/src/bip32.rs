//! BIP32-like child key derivation on secp256k1
//!
//! `il ‖ chain' = HMAC-SHA512(chain, compressed_pub ‖ index_be32)`. A private
//! child is `(il + k) mod n`, a public child is `il·G + P`, so a verifier that
//! only knows the parent public key and chain code can re-derive the child
//! public key.

use crate::canonical::base64_bytes;
use crate::crypto::{public_key_to_address, verifying_key_to_address, KeyPair};
use crate::error::{Error, Result};
use crate::types::{Address, Salt};
use hmac::{Hmac, Mac};
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::elliptic_curve::group::Group;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::{Field, PrimeField};
use k256::{FieldBytes, ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Indices tried by [`derive_child_with_retry`] before giving up
pub const MAX_ITER_DERIVE_KEY: u32 = 10;

/// Key type tag carried in [`KeyExtraInfo`]
pub const KEY_TYPE_BIP32: u8 = 1;

#[derive(Clone)]
enum KeyMaterial {
    Private(SigningKey),
    Public(VerifyingKey),
}

/// A key plus its chain code
#[derive(Clone)]
pub struct ExtendedKey {
    key: KeyMaterial,
    chain_code: [u8; 32],
    child_num: u32,
}

impl ExtendedKey {
    pub fn from_private(key: &KeyPair, chain_code: [u8; 32]) -> Self {
        Self {
            key: KeyMaterial::Private(key.signing_key().clone()),
            chain_code,
            child_num: 0,
        }
    }

    pub fn from_public(pubkey: &[u8], chain_code: [u8; 32]) -> Result<Self> {
        let vk = VerifyingKey::from_sec1_bytes(pubkey).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self {
            key: KeyMaterial::Public(vk),
            chain_code,
            child_num: 0,
        })
    }

    fn verifying_key(&self) -> VerifyingKey {
        match &self.key {
            KeyMaterial::Private(sk) => *sk.verifying_key(),
            KeyMaterial::Public(vk) => *vk,
        }
    }

    /// 65-byte uncompressed public key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.verifying_key().to_encoded_point(false).as_bytes().to_vec()
    }

    pub fn address(&self) -> Address {
        verifying_key_to_address(&self.verifying_key())
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    pub fn child_num(&self) -> u32 {
        self.child_num
    }

    /// Signing key, if this is a private extended key
    pub fn signing_key(&self) -> Option<KeyPair> {
        match &self.key {
            KeyMaterial::Private(sk) => Some(KeyPair::from_signing_key(sk.clone())),
            KeyMaterial::Public(_) => None,
        }
    }

    /// Drop the private half
    pub fn neuter(&self) -> ExtendedKey {
        Self {
            key: KeyMaterial::Public(self.verifying_key()),
            chain_code: self.chain_code,
            child_num: self.child_num,
        }
    }

    /// Child at `index`. Private keys derive private children, public keys public ones.
    pub fn child(&self, index: u32) -> Result<ExtendedKey> {
        let compressed = self.verifying_key().to_encoded_point(true);
        let mut mac =
            HmacSha512::new_from_slice(&self.chain_code).map_err(|e| Error::InvalidKey(e.to_string()))?;
        mac.update(compressed.as_bytes());
        mac.update(&index.to_be_bytes());
        let out = mac.finalize().into_bytes();

        let il: Option<Scalar> = Scalar::from_repr(FieldBytes::clone_from_slice(&out[..32])).into();
        let il = il.ok_or(Error::InvalidChild(index))?;
        if bool::from(il.is_zero()) {
            return Err(Error::InvalidChild(index));
        }
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&out[32..]);

        let key = match &self.key {
            KeyMaterial::Private(sk) => {
                let k: Scalar = *sk.as_nonzero_scalar().as_ref();
                let child = il + k;
                let bytes = child.to_bytes();
                // zero or a leading zero byte: non-standard length
                if bool::from(child.is_zero()) || bytes[0] == 0 {
                    return Err(Error::InvalidChild(index));
                }
                let sk = SigningKey::from_bytes(&bytes).map_err(|_| Error::InvalidChild(index))?;
                KeyMaterial::Private(sk)
            }
            KeyMaterial::Public(vk) => {
                let point = ProjectivePoint::GENERATOR * il + ProjectivePoint::from(*vk.as_affine());
                if bool::from(point.is_identity()) {
                    return Err(Error::InvalidChild(index));
                }
                let vk = VerifyingKey::from_affine(point.to_affine())
                    .map_err(|_| Error::InvalidChild(index))?;
                KeyMaterial::Public(vk)
            }
        };

        Ok(ExtendedKey {
            key,
            chain_code,
            child_num: index,
        })
    }
}

// =============================================================================
// KEY EXTRA INFO
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bip32Data {
    /// Parent public key
    #[serde(rename = "P", with = "base64_bytes")]
    pub parent: Vec<u8>,
    /// Chain code
    #[serde(rename = "S")]
    pub salt: Salt,
    #[serde(rename = "C")]
    pub child: u32,
}

/// What a verifier needs to tie a derived key back to its parent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExtraInfo {
    #[serde(rename = "T")]
    pub key_type: u8,
    #[serde(rename = "D")]
    pub data: Bip32Data,
}

impl KeyExtraInfo {
    /// Check that `child_pub` derives from a parent whose address is `parent_address`
    pub fn verify(&self, child_pub: &[u8], parent_address: &Address) -> Result<()> {
        if self.key_type != KEY_TYPE_BIP32 {
            return Err(Error::KeyExtraMismatch);
        }
        if public_key_to_address(&self.data.parent)? != *parent_address {
            return Err(Error::KeyExtraMismatch);
        }
        let derived = ExtendedKey::from_public(&self.data.parent, self.data.salt.0)?
            .child(self.data.child)?
            .public_key_bytes();
        let claimed = VerifyingKey::from_sec1_bytes(child_pub)
            .map_err(|e| Error::InvalidKey(e.to_string()))?
            .to_encoded_point(false);
        if derived != claimed.as_bytes() {
            return Err(Error::KeyExtraMismatch);
        }
        Ok(())
    }
}

/// Derive the child of `master` at `index` under a fresh random chain code
pub fn derive_child(master: &KeyPair, index: u32) -> Result<(KeyPair, KeyExtraInfo)> {
    let salt = Salt::random();
    let child = ExtendedKey::from_private(master, salt.0).child(index)?;
    let key = child.signing_key().ok_or(Error::InvalidChild(index))?;
    let extra = KeyExtraInfo {
        key_type: KEY_TYPE_BIP32,
        data: Bip32Data {
            parent: master.public_key_bytes(),
            salt,
            child: index,
        },
    };
    Ok((key, extra))
}

/// Try indices `start..start + MAX_ITER_DERIVE_KEY` until one yields a valid child
pub fn derive_child_with_retry(master: &KeyPair, start: u32) -> Result<(KeyPair, KeyExtraInfo)> {
    let mut last = Error::InvalidChild(start);
    for i in 0..MAX_ITER_DERIVE_KEY {
        let Some(index) = start.checked_add(i) else {
            break;
        };
        match derive_child(master, index) {
            Ok(derived) => return Ok(derived),
            Err(e) => last = e,
        }
    }
    Err(last)
}
