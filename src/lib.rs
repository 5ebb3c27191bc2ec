//! # Whisper Session
//!
//! Client-side Signal protocol sessions: X3DH-style initial key agreement
//! from prekey bundles, the Double Ratchet for message encryption, and the
//! multi-session records that tie them together.
//!
//! ## Security Properties
//!
//! - **Forward secrecy**: per-message keys are deleted as they are used
//! - **Post-compromise security**: a DH ratchet step heals a compromised
//!   chain as soon as either party refreshes its ratchet key
//! - **Identity binding**: every frame's truncated MAC covers both parties'
//!   identity keys and the protocol version
//! - **Asynchronous**: a sender can establish a session from a published
//!   prekey bundle while the receiver is offline
//!
//! ## Architecture
//!
//! Storage is a capability set behind [`ProtocolStore`]; the core holds no
//! process-wide state. All crypto is synchronous; the only suspension
//! points are storage calls. Mutation of a remote address's
//! [`SessionRecord`] is serialized through a shared [`JobQueue`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rand_core::OsRng;
//! use whisper_session::{
//!     key_helper, InMemoryProtocolStore, JobQueue, ProtocolAddress, SessionCipher,
//! };
//!
//! # async fn demo() -> whisper_session::Result<()> {
//! let identity = key_helper::generate_identity_key_pair(&mut OsRng);
//! let registration_id = key_helper::generate_registration_id(&mut OsRng);
//! let store = Arc::new(InMemoryProtocolStore::new(identity, registration_id));
//! let queue = Arc::new(JobQueue::new());
//!
//! let bob = ProtocolAddress::new("bob", 1);
//! let cipher = SessionCipher::new(store, queue, bob);
//! // ... build a session with SessionBuilder, then:
//! let message = cipher.encrypt(b"hi").await?;
//! # let _ = message;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]

pub mod address;
pub mod builder;
pub mod cipher;
pub mod crypto;
pub mod curve;
pub mod error;
pub mod key_helper;
pub mod proto;
pub mod queue;
pub mod record;
pub mod storage;

mod ratchet;
mod state;
mod xeddsa;

// Re-export main types
pub use address::ProtocolAddress;
pub use builder::{PreKeyBundle, SessionBuilder};
pub use cipher::{CiphertextMessage, CiphertextMessageType, SessionCipher};
pub use curve::{KeyPair, PrivateKey, PublicKey};
pub use error::{Error, Result};
pub use queue::JobQueue;
pub use record::SessionRecord;
pub use storage::{InMemoryProtocolStore, PreKeyRecord, ProtocolStore, SignedPreKeyRecord};
