//! Curve25519 key types: X25519 agreement and XEdDSA signatures.
//!
//! Public keys are carried in the 33-byte "type-prefixed" form used by every
//! wire-facing structure: a leading [`DJB_TYPE`] byte followed by the X25519
//! u-coordinate. Private keys are clamped 32-byte scalars.

use crate::error::{Error, Result};
use crate::xeddsa::{XEdDsaPrivateKey, XEdDsaPublicKey};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand_core::CryptoRngCore;
use serde::de::Error as _;
use serde::Deserialize as _;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key-type prefix byte for curve25519 public keys
pub const DJB_TYPE: u8 = 0x05;

/// Serialized public key length (type byte + u-coordinate)
pub const PUBLIC_KEY_LENGTH: usize = 33;

/// Private key length
pub const PRIVATE_KEY_LENGTH: usize = 32;

/// XEdDSA signature length
pub const SIGNATURE_LENGTH: usize = 64;

/// X25519 shared-secret length
pub const AGREEMENT_LENGTH: usize = 32;

/// A type-prefixed curve25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Parse a serialized public key.
    ///
    /// Only the 33-byte form with a [`DJB_TYPE`] prefix is accepted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match <[u8; PUBLIC_KEY_LENGTH]>::try_from(bytes) {
            Ok(arr) if arr[0] == DJB_TYPE => Ok(Self(arr)),
            _ => Err(Error::InvalidArgument("bad public key encoding")),
        }
    }

    /// Wrap a raw u-coordinate with the type prefix.
    #[must_use]
    pub fn from_montgomery(u: &[u8; 32]) -> Self {
        let mut bytes = [0u8; PUBLIC_KEY_LENGTH];
        bytes[0] = DJB_TYPE;
        bytes[1..].copy_from_slice(u);
        Self(bytes)
    }

    /// The 33-byte wire form.
    #[must_use]
    pub fn serialize(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0
    }

    /// The u-coordinate without the type prefix.
    #[must_use]
    pub fn montgomery(&self) -> [u8; 32] {
        let mut u = [0u8; 32];
        u.copy_from_slice(&self.0[1..]);
        u
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&BASE64.encode(self.0))
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(encoded).map_err(D::Error::custom)?;
        PublicKey::from_bytes(&bytes).map_err(D::Error::custom)
    }
}

/// A clamped X25519 private key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; PRIVATE_KEY_LENGTH]);

impl PrivateKey {
    /// Build a private key from raw bytes, applying X25519 clamping.
    #[must_use]
    pub fn from_bytes(mut bytes: [u8; PRIVATE_KEY_LENGTH]) -> Self {
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    /// Generate a fresh random private key.
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// The corresponding type-prefixed public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_montgomery(&x25519(self.0, X25519_BASEPOINT_BYTES))
    }

    /// X25519 agreement with a type-prefixed public key.
    #[must_use]
    pub fn calculate_agreement(&self, their: &PublicKey) -> [u8; AGREEMENT_LENGTH] {
        x25519(self.0, their.montgomery())
    }

    pub(crate) fn as_scalar_bytes(&self) -> &[u8; PRIVATE_KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl serde::Serialize for PrivateKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&BASE64.encode(self.0))
    }
}

impl<'de> serde::Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(encoded).map_err(D::Error::custom)?;
        let arr = <[u8; PRIVATE_KEY_LENGTH]>::try_from(bytes.as_slice())
            .map_err(|_| D::Error::custom("private key must be 32 bytes"))?;
        Ok(PrivateKey::from_bytes(arr))
    }
}

/// An X25519 key pair.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct KeyPair {
    /// Type-prefixed public half
    pub public_key: PublicKey,
    /// Clamped private half
    pub private_key: PrivateKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let private_key = PrivateKey::generate(rng);
        let public_key = private_key.public_key();
        Self {
            public_key,
            private_key,
        }
    }
}

/// Sign `message` with an XEdDSA signature over the X25519 private key.
pub fn calculate_signature<R: CryptoRngCore>(
    rng: &mut R,
    private: &PrivateKey,
    message: &[u8],
) -> Result<[u8; SIGNATURE_LENGTH]> {
    let mut random = [0u8; 64];
    rng.fill_bytes(&mut random);
    let signing = XEdDsaPrivateKey::from_private(private)?;
    Ok(signing.sign(message, &random))
}

/// Verify an XEdDSA signature against a type-prefixed public key.
///
/// Fails closed: any decoding or verification error yields `false`.
#[must_use]
pub fn verify_signature(public: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
        return false;
    };
    let Ok(verifier) = XEdDsaPublicKey::from_public(public) else {
        return false;
    };
    verifier.verify(message, &signature).is_ok()
}
