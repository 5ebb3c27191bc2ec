//! Wire message records and version framing.
//!
//! Field numbers are fixed by deployed clients and must not change. The
//! records use proto2-style optional fields; presence is validated at the
//! call sites that consume them.

use crate::error::{Error, Result};

/// Protocol version carried in every frame's version byte
pub const CIPHERTEXT_MESSAGE_CURRENT_VERSION: u8 = 3;

/// Number of MAC bytes appended to a WhisperMessage frame
pub const MAC_LENGTH: usize = 8;

/// The version byte for outgoing frames: current version in both nibbles.
#[must_use]
pub fn current_version_byte() -> u8 {
    (CIPHERTEXT_MESSAGE_CURRENT_VERSION << 4) | CIPHERTEXT_MESSAGE_CURRENT_VERSION
}

/// Validate an incoming version byte.
///
/// The high nibble is the sender's version, the low nibble the minimum
/// version the sender will accept. Rejected before any cryptographic work.
pub fn check_version_byte(byte: u8) -> Result<()> {
    let sender = byte >> 4;
    let minimum = byte & 0x0F;
    if minimum > CIPHERTEXT_MESSAGE_CURRENT_VERSION
        || sender < CIPHERTEXT_MESSAGE_CURRENT_VERSION
    {
        return Err(Error::InvalidMessage("incompatible protocol version"));
    }
    Ok(())
}

/// Ratcheting message body. On the wire it is wrapped as
/// `version byte || encoded record || mac[0..8]`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WhisperMessage {
    /// Sender's current ratchet public key (33 bytes, type-prefixed)
    #[prost(bytes = "vec", optional, tag = "1")]
    pub ephemeral_key: Option<Vec<u8>>,
    /// Position in the sending chain
    #[prost(uint32, optional, tag = "2")]
    pub counter: Option<u32>,
    /// Length of the sender's previous sending chain
    #[prost(uint32, optional, tag = "3")]
    pub previous_counter: Option<u32>,
    /// AES-256-CBC ciphertext
    #[prost(bytes = "vec", optional, tag = "4")]
    pub ciphertext: Option<Vec<u8>>,
}

/// First-contact wrapper carrying everything the receiver needs to
/// reconstruct the session. On the wire: `version byte || encoded record`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreKeyWhisperMessage {
    /// Sender's registration id
    #[prost(uint32, optional, tag = "5")]
    pub registration_id: Option<u32>,
    /// One-time prekey id consumed by this session, if one was available
    #[prost(uint32, optional, tag = "1")]
    pub pre_key_id: Option<u32>,
    /// Signed prekey id the session was based on
    #[prost(uint32, optional, tag = "6")]
    pub signed_pre_key_id: Option<u32>,
    /// Sender's ephemeral base key (33 bytes, type-prefixed)
    #[prost(bytes = "vec", optional, tag = "2")]
    pub base_key: Option<Vec<u8>>,
    /// Sender's identity key (33 bytes, type-prefixed)
    #[prost(bytes = "vec", optional, tag = "3")]
    pub identity_key: Option<Vec<u8>>,
    /// Embedded full WhisperMessage frame
    #[prost(bytes = "vec", optional, tag = "4")]
    pub message: Option<Vec<u8>>,
}

/// Legacy key-exchange record, retained for wire compatibility.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyExchangeMessage {
    /// Exchange sequence id
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    /// Base key (33 bytes, type-prefixed)
    #[prost(bytes = "vec", optional, tag = "2")]
    pub base_key: Option<Vec<u8>>,
    /// Ratchet key (33 bytes, type-prefixed)
    #[prost(bytes = "vec", optional, tag = "3")]
    pub ephemeral_key: Option<Vec<u8>>,
    /// Identity key (33 bytes, type-prefixed)
    #[prost(bytes = "vec", optional, tag = "4")]
    pub identity_key: Option<Vec<u8>>,
    /// XEdDSA signature over the base key
    #[prost(bytes = "vec", optional, tag = "5")]
    pub base_key_signature: Option<Vec<u8>>,
}
