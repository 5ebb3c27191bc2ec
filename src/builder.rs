//! Initial session construction.
//!
//! The sender builds a session unilaterally from a published prekey bundle;
//! the receiver reconstructs the same session from the first incoming
//! PreKey message. Both sides derive the master secret from the same DH
//! quadruple, prefixed with 32 discontinuity bytes.

use crate::address::ProtocolAddress;
use crate::curve::{verify_signature, KeyPair, PublicKey, SIGNATURE_LENGTH};
use crate::error::{Error, Result};
use crate::queue::JobQueue;
use crate::record::SessionRecord;
use crate::state::{
    now_millis, BaseKeyType, CurrentRatchet, IndexInfo, PendingPreKey, SessionState,
};
use crate::ratchet::RootKey;
use crate::storage::ProtocolStore;

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroize;

/// A publishable prekey bundle: everything a sender needs to open a
/// session with us while we are offline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Owner's registration id
    pub registration_id: u32,
    /// Owner's identity key
    pub identity_key: PublicKey,
    /// Signed prekey id
    pub signed_pre_key_id: u32,
    /// Signed prekey
    pub signed_pre_key: PublicKey,
    /// XEdDSA signature by the identity key over the signed prekey
    #[serde(with = "serde_arrays")]
    pub signed_pre_key_signature: [u8; SIGNATURE_LENGTH],
    /// One-time prekey id, if one was attached
    pub pre_key_id: Option<u32>,
    /// One-time prekey, if one was attached
    pub pre_key: Option<PublicKey>,
}

/// Parsed fields of an incoming PreKey message that session construction
/// needs.
pub(crate) struct IncomingPreKeyMessage {
    pub(crate) identity_key: PublicKey,
    pub(crate) base_key: PublicKey,
    pub(crate) registration_id: Option<u32>,
    pub(crate) pre_key_id: Option<u32>,
    pub(crate) signed_pre_key_id: u32,
}

/// Builds sessions toward one remote address.
pub struct SessionBuilder {
    store: Arc<dyn ProtocolStore>,
    queue: Arc<JobQueue>,
    remote_address: ProtocolAddress,
}

impl SessionBuilder {
    /// Create a builder for `remote_address`.
    ///
    /// The queue must be the same instance every cipher and builder for
    /// this storage shares; it is what serializes record mutation.
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

    /// Build and persist an outbound session from a prekey bundle.
    ///
    /// Verifies the signed-prekey signature and the identity's trust, runs
    /// the X3DH agreement with a fresh base key, and replaces any open
    /// session in the record (the old one is closed, not dropped).
    pub async fn process_pre_key_bundle<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        bundle: &PreKeyBundle,
    ) -> Result<()> {
        self.queue
            .run(&self.remote_address, self.pre_key_bundle_job(rng, bundle))
            .await
    }

    async fn pre_key_bundle_job<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        bundle: &PreKeyBundle,
    ) -> Result<()> {
        if !verify_signature(
            &bundle.identity_key,
            &bundle.signed_pre_key.serialize(),
            &bundle.signed_pre_key_signature,
        ) {
            return Err(Error::InvalidSignature);
        }
        if bundle.pre_key.is_some() != bundle.pre_key_id.is_some() {
            return Err(Error::InvalidArgument(
                "bundle prekey and prekey id must come together",
            ));
        }

        if !self
            .store
            .is_trusted_identity(self.remote_address.name(), &bundle.identity_key)
            .await?
        {
            return Err(Error::UntrustedIdentity {
                name: self.remote_address.name().to_string(),
                key: bundle.identity_key,
            });
        }

        let our_identity = self.store.get_our_identity().await?;
        let mut record = self
            .store
            .load_session(&self.remote_address)
            .await?
            .unwrap_or_default();

        let session = initialize_outgoing_session(rng, &our_identity, bundle)?;

        record.close_open_session(now_millis());
        record.update_session(session);
        self.store
            .store_session(&self.remote_address, &record)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("remote_address", &self.remote_address)
            .finish_non_exhaustive()
    }
}

/// Sender-side X3DH and session layout.
fn initialize_outgoing_session<R: CryptoRngCore>(
    rng: &mut R,
    our_identity: &KeyPair,
    bundle: &PreKeyBundle,
) -> Result<SessionState> {
    let base_key = KeyPair::generate(rng);

    let mut master = Vec::with_capacity(32 * 5);
    master.extend_from_slice(&[0xFFu8; 32]);
    master.extend_from_slice(
        &our_identity
            .private_key
            .calculate_agreement(&bundle.signed_pre_key),
    );
    master.extend_from_slice(&base_key.private_key.calculate_agreement(&bundle.identity_key));
    master.extend_from_slice(
        &base_key
            .private_key
            .calculate_agreement(&bundle.signed_pre_key),
    );
    if let Some(one_time) = &bundle.pre_key {
        master.extend_from_slice(&base_key.private_key.calculate_agreement(one_time));
    }

    let root_key = RootKey::derive_initial(&master)?;
    master.zeroize();

    let now = now_millis();
    let mut session = SessionState::new(
        Some(bundle.registration_id),
        CurrentRatchet {
            ephemeral_key_pair: KeyPair::generate(rng),
            last_remote_ephemeral_key: bundle.signed_pre_key,
            previous_counter: 0,
            root_key,
        },
        IndexInfo {
            base_key: base_key.public_key,
            base_key_type: BaseKeyType::Ours,
            closed: -1,
            used: now,
            created: now,
            remote_identity_key: bundle.identity_key,
        },
    );

    // First DH ratchet against the signed prekey installs our sending chain.
    session.calculate_ratchet(&bundle.signed_pre_key, true)?;
    session.pending_pre_key = Some(PendingPreKey {
        base_key: base_key.public_key,
        signed_key_id: bundle.signed_pre_key_id,
        pre_key_id: bundle.pre_key_id,
    });
    Ok(session)
}

/// Receiver-side session construction from an incoming PreKey message.
///
/// Returns the one-time prekey id to consume, or `None` when the session
/// already existed (duplicate first message) or the bundle carried no
/// one-time prekey.
pub(crate) async fn process_pre_key_message(
    store: &dyn ProtocolStore,
    remote_address: &ProtocolAddress,
    record: &mut SessionRecord,
    message: &IncomingPreKeyMessage,
) -> Result<Option<u32>> {
    if !store
        .is_trusted_identity(remote_address.name(), &message.identity_key)
        .await?
    {
        return Err(Error::UntrustedIdentity {
            name: remote_address.name().to_string(),
            key: message.identity_key,
        });
    }

    if record.get_session(&message.base_key).is_some() {
        log::info!("Duplicate PreKey message for an already known base key");
        return Ok(None);
    }

    let signed_pre_key = store
        .load_signed_pre_key(message.signed_pre_key_id)
        .await?
        .ok_or(Error::InvalidKeyId(message.signed_pre_key_id))?;

    let one_time = match message.pre_key_id {
        Some(id) => Some(
            store
                .load_pre_key(id)
                .await?
                .ok_or(Error::PreKey("one-time prekey not found"))?,
        ),
        None => None,
    };

    let our_identity = store.get_our_identity().await?;
    let session = initialize_incoming_session(
        &our_identity,
        &signed_pre_key.key_pair,
        one_time.as_ref(),
        message,
    )?;

    record.close_open_session(now_millis());
    record.update_session(session);

    Ok(one_time.and(message.pre_key_id))
}

/// Receiver-side X3DH, mirroring the sender's concatenation order.
fn initialize_incoming_session(
    our_identity: &KeyPair,
    signed_pre_key: &KeyPair,
    one_time: Option<&KeyPair>,
    message: &IncomingPreKeyMessage,
) -> Result<SessionState> {
    let mut master = Vec::with_capacity(32 * 5);
    master.extend_from_slice(&[0xFFu8; 32]);
    master.extend_from_slice(
        &signed_pre_key
            .private_key
            .calculate_agreement(&message.identity_key),
    );
    master.extend_from_slice(
        &our_identity
            .private_key
            .calculate_agreement(&message.base_key),
    );
    master.extend_from_slice(
        &signed_pre_key
            .private_key
            .calculate_agreement(&message.base_key),
    );
    if let Some(one_time) = one_time {
        master.extend_from_slice(&one_time.private_key.calculate_agreement(&message.base_key));
    }

    let root_key = RootKey::derive_initial(&master)?;
    master.zeroize();

    // No chains yet: the first inbound frame triggers the DH ratchet that
    // installs them. Until then our ratchet key is the signed prekey.
    let now = now_millis();
    Ok(SessionState::new(
        message.registration_id,
        CurrentRatchet {
            ephemeral_key_pair: signed_pre_key.clone(),
            last_remote_ephemeral_key: message.base_key,
            previous_counter: 0,
            root_key,
        },
        IndexInfo {
            base_key: message.base_key,
            base_key_type: BaseKeyType::Theirs,
            closed: -1,
            used: now,
            created: now,
            remote_identity_key: message.identity_key,
        },
    ))
}
