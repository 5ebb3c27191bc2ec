//! Encrypt/decrypt orchestration over one remote address.
//!
//! Every call loads the session record, runs the ratchet synchronously,
//! and publishes all mutation with a single terminal `store_session`. Trial
//! decryption works on clones of candidate sessions, so a failed attempt
//! never leaks partial state into the record.

use crate::address::ProtocolAddress;
use crate::builder::{self, IncomingPreKeyMessage};
use crate::crypto::{aes256_cbc_decrypt, aes256_cbc_encrypt, constant_time_eq, hmac_sha256};
use crate::curve::{KeyPair, PublicKey};
use crate::error::{Error, Result};
use crate::proto::{
    check_version_byte, current_version_byte, PreKeyWhisperMessage, WhisperMessage, MAC_LENGTH,
};
use crate::queue::JobQueue;
use crate::record::SessionRecord;
use crate::state::{now_millis, ChainType, SessionState};
use crate::storage::ProtocolStore;

use prost::Message as _;
use rand_core::CryptoRngCore;
use std::sync::Arc;

/// Outer frame type of an encrypted message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CiphertextMessageType {
    /// A plain WhisperMessage frame on an established session
    Whisper = 1,
    /// A PreKeyWhisperMessage wrapper, sent until the peer's first reply
    PreKey = 3,
}

impl From<CiphertextMessageType> for u8 {
    fn from(value: CiphertextMessageType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for CiphertextMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CiphertextMessageType::Whisper),
            3 => Ok(CiphertextMessageType::PreKey),
            _ => Err(Error::InvalidArgument("unknown ciphertext message type")),
        }
    }
}

/// An encrypted message ready for transport.
#[derive(Clone, Debug)]
pub struct CiphertextMessage {
    /// Frame type of `body`
    pub message_type: CiphertextMessageType,
    /// The complete wire frame
    pub body: Vec<u8>,
    /// The peer's registration id, when the session knows it
    pub registration_id: Option<u32>,
}

/// Encrypts and decrypts messages for one remote address.
pub struct SessionCipher {
    store: Arc<dyn ProtocolStore>,
    queue: Arc<JobQueue>,
    remote_address: ProtocolAddress,
}

impl SessionCipher {
    /// Create a cipher for `remote_address`.
    ///
    /// The queue must be the instance shared by every cipher and builder
    /// over the same storage; it serializes all record mutation per
    /// address.
    pub fn new(
        store: Arc<dyn ProtocolStore>,
        queue: Arc<JobQueue>,
        remote_address: ProtocolAddress,
    ) -> Self {
        Self {
            store,
            queue,
            remote_address,
        }
    }

    /// Encrypt `plaintext` on the open session.
    ///
    /// No fresh randomness is needed: the cipher key, MAC key and IV all
    /// come from the chain's one-time message key.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<CiphertextMessage> {
        self.queue
            .run(&self.remote_address, self.encrypt_job(plaintext))
            .await
    }

    async fn encrypt_job(&self, plaintext: &[u8]) -> Result<CiphertextMessage> {
        let mut record = self
            .store
            .load_session(&self.remote_address)
            .await?
            .ok_or_else(|| Error::session("No sessions"))?;
        let our_identity = self.store.get_our_identity().await?;

        let (remote_identity, has_pending) = {
            let session = record
                .open_session()
                .ok_or_else(|| Error::session("No sessions"))?;
            (
                session.index_info.remote_identity_key,
                session.pending_pre_key.is_some(),
            )
        };

        if !self
            .store
            .is_trusted_identity(self.remote_address.name(), &remote_identity)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                name: self.remote_address.name().to_string(),
                key: remote_identity,
            });
        }
        // Only the PreKey wrapper carries our registration id.
        let our_registration_id = if has_pending {
            Some(self.store.get_our_registration_id().await?)
        } else {
            None
        };

        let result = {
            let session = record
                .open_session_mut()
                .ok_or_else(|| Error::session("No sessions"))?;

            let our_ephemeral = session.current_ratchet.ephemeral_key_pair.public_key;
            let previous_counter = session.current_ratchet.previous_counter;

            let chain = session
                .sending_chain_mut()
                .ok_or_else(|| Error::session("Missing sending chain"))?;
            if chain.chain_type == ChainType::Receiving {
                return Err(Error::session("Tried to encrypt on a receiving chain"));
            }

            let target = chain.chain_key.counter + 1;
            chain.fill_message_keys(target)?;
            let counter = u32::try_from(chain.chain_key.counter)
                .map_err(|_| Error::session("Corrupt sending chain counter"))?;
            let seed = chain
                .take_message_key(counter)
                .ok_or(Error::MessageCounter("Key used already or never filled"))?;
            let keys = seed.expand()?;

            let ciphertext = aes256_cbc_encrypt(keys.cipher_key(), keys.iv(), plaintext);
            let message = WhisperMessage {
                ephemeral_key: Some(our_ephemeral.serialize().to_vec()),
                counter: Some(counter),
                previous_counter: Some(previous_counter),
                ciphertext: Some(ciphertext),
            };
            let encoded = message.encode_to_vec();
            let version = current_version_byte();
            let mac = message_mac(
                keys.mac_key(),
                &our_identity.public_key,
                &remote_identity,
                version,
                &encoded,
            );

            let mut body = Vec::with_capacity(1 + encoded.len() + MAC_LENGTH);
            body.push(version);
            body.extend_from_slice(&encoded);
            body.extend_from_slice(&mac[..MAC_LENGTH]);

            let registration_id = session.registration_id;
            if let Some(pending) = &session.pending_pre_key {
                let wrapper = PreKeyWhisperMessage {
                    registration_id: our_registration_id,
                    pre_key_id: pending.pre_key_id,
                    signed_pre_key_id: Some(pending.signed_key_id),
                    base_key: Some(pending.base_key.serialize().to_vec()),
                    identity_key: Some(our_identity.public_key.serialize().to_vec()),
                    message: Some(body),
                };
                let encoded_wrapper = wrapper.encode_to_vec();
                let mut outer = Vec::with_capacity(1 + encoded_wrapper.len());
                outer.push(version);
                outer.extend_from_slice(&encoded_wrapper);
                CiphertextMessage {
                    message_type: CiphertextMessageType::PreKey,
                    body: outer,
                    registration_id,
                }
            } else {
                CiphertextMessage {
                    message_type: CiphertextMessageType::Whisper,
                    body,
                    registration_id,
                }
            }
        };

        self.store
            .store_session(&self.remote_address, &record)
            .await?;
        Ok(result)
    }

    /// Decrypt a WhisperMessage frame, trying sessions most-recently-used
    /// first.
    pub async fn decrypt_whisper_message<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        self.queue
            .run(&self.remote_address, self.decrypt_whisper_job(rng, body))
            .await
    }

    async fn decrypt_whisper_job<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let version = *body
            .first()
            .ok_or(Error::InvalidMessage("empty message frame"))?;
        check_version_byte(version)?;

        let mut record = self
            .store
            .load_session(&self.remote_address)
            .await?
            .ok_or_else(|| Error::session("No session record"))?;
        let our_identity = self.store.get_our_identity().await?;

        let mut first_error = None;
        let mut outcome = None;
        for session in record.sessions_mru() {
            let mut candidate = session.clone();
            match do_decrypt(rng, &our_identity, &mut candidate, body) {
                Ok(plaintext) => {
                    outcome = Some((candidate, plaintext));
                    break;
                }
                Err(error) => {
                    log::info!("Trial decryption failed, trying older session: {error}");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        let Some((mut winner, plaintext)) = outcome else {
            return Err(Error::Session {
                message: "No matching sessions",
                source: first_error.map(Box::new),
            });
        };

        winner.index_info.used = now_millis();
        let remote_identity = winner.index_info.remote_identity_key;
        record.update_session(winner);

        if !self
            .store
            .is_trusted_identity(self.remote_address.name(), &remote_identity)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                name: self.remote_address.name().to_string(),
                key: remote_identity,
            });
        }

        self.store
            .store_session(&self.remote_address, &record)
            .await?;
        Ok(plaintext)
    }

    /// Decrypt a PreKeyWhisperMessage frame, building the session first if
    /// this is the peer's first contact.
    pub async fn decrypt_pre_key_whisper_message<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        self.queue
            .run(&self.remote_address, self.decrypt_pre_key_job(rng, body))
            .await
    }

    async fn decrypt_pre_key_job<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let (version, rest) = body
            .split_first()
            .ok_or(Error::InvalidMessage("empty message frame"))?;
        check_version_byte(*version)?;

        let message = PreKeyWhisperMessage::decode(rest)
            .map_err(|_| Error::InvalidMessage("bad PreKeyWhisperMessage encoding"))?;
        let base_key = PublicKey::from_bytes(
            message
                .base_key
                .as_deref()
                .ok_or(Error::InvalidMessage("missing base key"))?,
        )?;
        let identity_key = PublicKey::from_bytes(
            message
                .identity_key
                .as_deref()
                .ok_or(Error::InvalidMessage("missing identity key"))?,
        )?;
        let signed_pre_key_id = message
            .signed_pre_key_id
            .ok_or(Error::InvalidMessage("missing signed prekey id"))?;
        let inner = message
            .message
            .as_deref()
            .ok_or(Error::InvalidMessage("missing embedded message"))?;

        let mut record = match self.store.load_session(&self.remote_address).await? {
            Some(record) => record,
            None => {
                if message.registration_id.is_none() {
                    return Err(Error::InvalidMessage("missing registration id"));
                }
                SessionRecord::new()
            }
        };

        let incoming = IncomingPreKeyMessage {
            identity_key,
            base_key,
            registration_id: message.registration_id,
            pre_key_id: message.pre_key_id,
            signed_pre_key_id,
        };
        let consumed_pre_key = builder::process_pre_key_message(
            &*self.store,
            &self.remote_address,
            &mut record,
            &incoming,
        )
        .await?;

        let our_identity = self.store.get_our_identity().await?;
        let mut candidate = record
            .get_session(&base_key)
            .ok_or_else(|| Error::session("No session for base key"))?
            .clone();
        let plaintext = do_decrypt(rng, &our_identity, &mut candidate, inner)?;
        candidate.index_info.used = now_millis();
        record.update_session(candidate);

        self.store
            .store_session(&self.remote_address, &record)
            .await?;
        if let Some(id) = consumed_pre_key {
            self.store.remove_pre_key(id).await?;
        }
        Ok(plaintext)
    }

    /// Whether an open session exists for this address.
    pub async fn has_open_session(&self) -> Result<bool> {
        self.queue
            .run(&self.remote_address, async {
                Ok(self
                    .store
                    .load_session(&self.remote_address)
                    .await?
                    .is_some_and(|record| record.has_open_session()))
            })
            .await
    }

    /// Close the open session, keeping it for trial decryption.
    pub async fn close_open_session(&self) -> Result<()> {
        self.queue
            .run(&self.remote_address, async {
                if let Some(mut record) = self.store.load_session(&self.remote_address).await? {
                    record.close_open_session(now_millis());
                    self.store
                        .store_session(&self.remote_address, &record)
                        .await?;
                }
                Ok(())
            })
            .await
    }

    /// Drop every session for this address.
    pub async fn delete_all_sessions(&self) -> Result<()> {
        self.queue
            .run(&self.remote_address, async {
                if let Some(mut record) = self.store.load_session(&self.remote_address).await? {
                    record.delete_all_sessions();
                    self.store
                        .store_session(&self.remote_address, &record)
                        .await?;
                }
                Ok(())
            })
            .await
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("remote_address", &self.remote_address)
            .finish_non_exhaustive()
    }
}

/// The MAC binds the ciphertext to both identities and the version byte:
/// `HMAC(mac_key, sender identity || receiver identity || version || encoded)`.
fn message_mac(
    mac_key: &[u8; 32],
    sender_identity: &PublicKey,
    receiver_identity: &PublicKey,
    version: u8,
    encoded: &[u8],
) -> [u8; 32] {
    let mut input = Vec::with_capacity(33 + 33 + 1 + encoded.len());
    input.extend_from_slice(&sender_identity.serialize());
    input.extend_from_slice(&receiver_identity.serialize());
    input.push(version);
    input.extend_from_slice(encoded);
    hmac_sha256(mac_key, &input)
}

/// Decrypt one WhisperMessage frame against a single session.
///
/// Mutates only the passed-in session; callers hand in a clone and commit
/// it on success.
fn do_decrypt<R: CryptoRngCore>(
    rng: &mut R,
    our_identity: &KeyPair,
    session: &mut SessionState,
    frame: &[u8],
) -> Result<Vec<u8>> {
    if frame.len() <= 1 + MAC_LENGTH {
        return Err(Error::InvalidMessage("message frame too short"));
    }
    let version = frame[0];
    check_version_byte(version)?;
    let encoded = &frame[1..frame.len() - MAC_LENGTH];
    let their_mac = &frame[frame.len() - MAC_LENGTH..];

    let message = WhisperMessage::decode(encoded)
        .map_err(|_| Error::InvalidMessage("bad WhisperMessage encoding"))?;
    let ephemeral_key = PublicKey::from_bytes(
        message
            .ephemeral_key
            .as_deref()
            .ok_or(Error::InvalidMessage("missing ratchet key"))?,
    )?;
    let counter = i32::try_from(
        message
            .counter
            .ok_or(Error::InvalidMessage("missing counter"))?,
    )
    .map_err(|_| Error::InvalidMessage("counter out of range"))?;
    let previous_counter = i32::try_from(message.previous_counter.unwrap_or(0))
        .map_err(|_| Error::InvalidMessage("counter out of range"))?;
    let ciphertext = message
        .ciphertext
        .as_deref()
        .ok_or(Error::InvalidMessage("missing ciphertext"))?;

    session.maybe_step_ratchet(rng, &ephemeral_key, previous_counter)?;

    let remote_identity = session.index_info.remote_identity_key;
    let chain = session
        .chain_mut(&ephemeral_key)
        .ok_or_else(|| Error::session("Missing receiving chain"))?;
    if chain.chain_type == ChainType::Sending {
        return Err(Error::session("Tried to decrypt on a sending chain"));
    }

    chain.fill_message_keys(counter)?;
    #[allow(clippy::cast_sign_loss)]
    let seed = chain
        .take_message_key(counter as u32)
        .ok_or(Error::MessageCounter("Key used already or never filled"))?;
    let keys = seed.expand()?;

    let mac = message_mac(
        keys.mac_key(),
        &remote_identity,
        &our_identity.public_key,
        version,
        encoded,
    );
    if !constant_time_eq(&mac[..MAC_LENGTH], their_mac) {
        return Err(Error::Mac);
    }

    let plaintext = aes256_cbc_decrypt(keys.cipher_key(), keys.iv(), ciphertext)?;
    session.pending_pre_key = None;
    Ok(plaintext)
}
