//! Error types for protocol operations.

use crate::curve::PublicKey;
use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building sessions or processing messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Session-level failure (no usable session, closed chain, counter too
    /// far ahead). The current operation fails; the stored record is left
    /// untouched.
    #[error("session error: {message}")]
    Session {
        /// Short diagnostic
        message: &'static str,
        /// First underlying failure when several sessions were tried
        #[source]
        source: Option<Box<Error>>,
    },

    /// The remote identity key is no longer trusted by storage
    #[error("untrusted identity key for {name}")]
    UntrustedIdentity {
        /// Remote identifier the key belongs to
        name: String,
        /// The identity key that failed the trust check
        key: PublicKey,
    },

    /// A per-message key was already consumed or never derived
    #[error("message counter error: {0}")]
    MessageCounter(&'static str),

    /// Signed-prekey signature verification failed
    #[error("invalid signature")]
    InvalidSignature,

    /// No signed prekey stored under the requested id
    #[error("unknown signed prekey id {0}")]
    InvalidKeyId(u32),

    /// MAC verification failed
    #[error("bad mac")]
    Mac,

    /// AES-CBC decryption or padding failure
    #[error("decryption failed")]
    Decrypt,

    /// One-time prekey lookup or consumption failure
    #[error("prekey error: {0}")]
    PreKey(&'static str),

    /// A caller-supplied value was structurally invalid
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An incoming frame could not be decoded or carries an incompatible
    /// protocol version
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Session error with no underlying cause.
    pub(crate) fn session(message: &'static str) -> Self {
        Error::Session {
            message,
            source: None,
        }
    }
}
