//! Key schedule for the Double Ratchet: root keys, chain keys and the
//! per-message key expansion.
//!
//! The symmetric step is the single-byte-HMAC form: the next chain key is
//! `HMAC(ck, 0x02)` and the message-key seed is `HMAC(ck, 0x01)`. The DH
//! step folds an X25519 agreement into the root key through HKDF with the
//! `"WhisperRatchet"` label.

use crate::crypto::{hkdf_derive, hmac_sha256};
use crate::curve::{PrivateKey, PublicKey};
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) const WHISPER_TEXT: &[u8] = b"WhisperText";
pub(crate) const WHISPER_RATCHET: &[u8] = b"WhisperRatchet";
pub(crate) const WHISPER_MESSAGE_KEYS: &[u8] = b"WhisperMessageKeys";

const MESSAGE_KEY_SEED: [u8; 1] = [0x01];
const CHAIN_KEY_SEED: [u8; 1] = [0x02];

/// Maximum number of cached per-message keys per chain, and the furthest a
/// single fill may jump past the current chain counter.
pub(crate) const MAX_MESSAGE_KEYS: usize = 2000;

/// Base64 serde helpers for fixed-width key material.
pub(crate) mod b64_key {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(
        bytes: &[u8; 32],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(encoded).map_err(D::Error::custom)?;
        <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| D::Error::custom("key material must be 32 bytes"))
    }
}

/// Base64 serde helpers for erasable key material.
pub(crate) mod b64_opt_key {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(
        bytes: &Option<[u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<[u8; 32]>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            None => Ok(None),
            Some(encoded) => {
                let bytes = BASE64.decode(encoded).map_err(D::Error::custom)?;
                <[u8; 32]>::try_from(bytes.as_slice())
                    .map(Some)
                    .map_err(|_| D::Error::custom("key material must be 32 bytes"))
            }
        }
    }
}

/// Input to the next DH ratchet step.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct RootKey(#[serde(with = "b64_key")] [u8; 32]);

impl RootKey {
    pub(crate) fn new(key: [u8; 32]) -> Self {
        Self(key)
    }

    /// Derive the initial root key from an X3DH master secret via the
    /// `"WhisperText"` schedule. The second output block is reserved by the
    /// schedule but unused; the first sending chain comes from a
    /// [`RootKey::create_chain`] step.
    pub(crate) fn derive_initial(master: &[u8]) -> Result<Self> {
        let mut derived = hkdf_derive(master, &[0u8; 32], WHISPER_TEXT, 2)?;
        let root = Self(derived[0]);
        for block in &mut derived {
            block.zeroize();
        }
        Ok(root)
    }

    /// One DH ratchet step: agree with the remote ratchet key and fold the
    /// result into a new root key and a fresh chain.
    pub(crate) fn create_chain(
        &self,
        their_ratchet: &PublicKey,
        our_ratchet: &PrivateKey,
    ) -> Result<(RootKey, ChainKey)> {
        let mut shared = our_ratchet.calculate_agreement(their_ratchet);
        let mut derived = hkdf_derive(&shared, &self.0, WHISPER_RATCHET, 2)?;
        shared.zeroize();

        let root = RootKey(derived[0]);
        let chain = ChainKey::fresh(derived[1]);
        for block in &mut derived {
            block.zeroize();
        }
        Ok((root, chain))
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RootKey([REDACTED])")
    }
}

/// Current symmetric state of a sending or receiving chain.
///
/// The counter starts at −1; a chain whose key has been erased is closed
/// and can no longer be advanced.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct ChainKey {
    pub(crate) counter: i32,
    #[serde(with = "b64_opt_key")]
    pub(crate) key: Option<[u8; 32]>,
}

impl ChainKey {
    pub(crate) fn fresh(key: [u8; 32]) -> Self {
        Self {
            counter: -1,
            key: Some(key),
        }
    }

    /// Advance the chain one step, returning the message-key seed for the
    /// new counter value.
    pub(crate) fn step(&mut self) -> Result<MessageKeySeed> {
        let key = self.key.as_ref().ok_or(Error::session("Chain closed"))?;
        let seed = hmac_sha256(key, &MESSAGE_KEY_SEED);
        let next = hmac_sha256(key, &CHAIN_KEY_SEED);
        self.key = Some(next);
        self.counter += 1;
        Ok(MessageKeySeed(seed))
    }

    /// Erase the chain key. Fills past this point fail.
    pub(crate) fn close(&mut self) {
        if let Some(mut key) = self.key.take() {
            key.zeroize();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.key.is_none()
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey")
            .field("counter", &self.counter)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One-time 32-byte seed cached per counter until its message arrives.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop, PartialEq)]
pub(crate) struct MessageKeySeed(#[serde(with = "b64_key")] [u8; 32]);

impl MessageKeySeed {
    /// Expand into the cipher key, MAC key and IV for one message.
    pub(crate) fn expand(&self) -> Result<MessageKeys> {
        let mut derived = hkdf_derive(&self.0, &[0u8; 32], WHISPER_MESSAGE_KEYS, 3)?;
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&derived[2][..16]);
        let keys = MessageKeys {
            cipher_key: derived[0],
            mac_key: derived[1],
            iv,
        };
        for block in &mut derived {
            block.zeroize();
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for MessageKeySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageKeySeed([REDACTED])")
    }
}

/// Expanded per-message keys, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct MessageKeys {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
    iv: [u8; 16],
}

impl MessageKeys {
    pub(crate) fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    pub(crate) fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }

    pub(crate) fn iv(&self) -> &[u8; 16] {
        &self.iv
    }
}

impl std::fmt::Debug for MessageKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageKeys([REDACTED])")
    }
}
