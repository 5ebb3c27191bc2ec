//! Per-session ratchet state.
//!
//! A session holds the current ratchet block (our ephemeral pair, the last
//! remote ratchet key, the root key), the symmetric chains addressed by the
//! ephemeral public key that produced them, the cached per-message key
//! seeds, and the index metadata the record files it under.

use crate::curve::{KeyPair, PublicKey};
use crate::error::{Error, Result};
use crate::ratchet::{ChainKey, MessageKeySeed, RootKey, MAX_MESSAGE_KEYS};

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the epoch, for session index timestamps.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Who generated the basing secret that identifies this session.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum BaseKeyType {
    Ours,
    Theirs,
}

/// Direction of a symmetric chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ChainType {
    Sending,
    Receiving,
}

/// One symmetric chain and its cached message-key seeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Chain {
    pub(crate) chain_key: ChainKey,
    pub(crate) chain_type: ChainType,
    pub(crate) message_keys: BTreeMap<u32, MessageKeySeed>,
}

impl Chain {
    pub(crate) fn new(chain_key: ChainKey, chain_type: ChainType) -> Self {
        Self {
            chain_key,
            chain_type,
            message_keys: BTreeMap::new(),
        }
    }

    /// Advance the chain until its counter reaches `target`, caching each
    /// derived message-key seed under its counter.
    pub(crate) fn fill_message_keys(&mut self, target: i32) -> Result<()> {
        if self.chain_key.counter >= target {
            return Ok(());
        }
        if target - self.chain_key.counter > MAX_MESSAGE_KEYS as i32 {
            return Err(Error::session("Over 2000 messages into the future"));
        }
        if self.chain_key.is_closed() {
            return Err(Error::session("Chain closed"));
        }

        while self.chain_key.counter < target {
            let seed = self.chain_key.step()?;
            #[allow(clippy::cast_sign_loss)]
            self.message_keys.insert(self.chain_key.counter as u32, seed);
        }

        // Keep the cache bounded across repeated partial fills.
        while self.message_keys.len() > MAX_MESSAGE_KEYS {
            self.message_keys.pop_first();
        }
        Ok(())
    }

    /// Remove and return the seed cached for `counter`.
    pub(crate) fn take_message_key(&mut self, counter: u32) -> Option<MessageKeySeed> {
        self.message_keys.remove(&counter)
    }
}

/// The sender's memo of which prekey bundle built this session, echoed on
/// every outbound frame until the peer's first reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PendingPreKey {
    pub(crate) base_key: PublicKey,
    pub(crate) signed_key_id: u32,
    pub(crate) pre_key_id: Option<u32>,
}

/// Index metadata: identifies the session within its record and drives the
/// open/closed lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct IndexInfo {
    pub(crate) base_key: PublicKey,
    pub(crate) base_key_type: BaseKeyType,
    /// −1 while open, otherwise the closing timestamp in ms
    pub(crate) closed: i64,
    pub(crate) used: i64,
    pub(crate) created: i64,
    pub(crate) remote_identity_key: PublicKey,
}

/// The DH half of the ratchet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CurrentRatchet {
    pub(crate) ephemeral_key_pair: KeyPair,
    pub(crate) last_remote_ephemeral_key: PublicKey,
    pub(crate) previous_counter: u32,
    pub(crate) root_key: RootKey,
}

/// One Double-Ratchet session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SessionState {
    pub(crate) registration_id: Option<u32>,
    pub(crate) current_ratchet: CurrentRatchet,
    pub(crate) index_info: IndexInfo,
    pub(crate) pending_pre_key: Option<PendingPreKey>,
    chains: BTreeMap<PublicKey, Chain>,
}

impl SessionState {
    pub(crate) fn new(
        registration_id: Option<u32>,
        current_ratchet: CurrentRatchet,
        index_info: IndexInfo,
    ) -> Self {
        Self {
            registration_id,
            current_ratchet,
            index_info,
            pending_pre_key: None,
            chains: BTreeMap::new(),
        }
    }

    pub(crate) fn chain(&self, key: &PublicKey) -> Option<&Chain> {
        self.chains.get(key)
    }

    pub(crate) fn chain_mut(&mut self, key: &PublicKey) -> Option<&mut Chain> {
        self.chains.get_mut(key)
    }

    /// The chain we encrypt on, addressed by our current ratchet key.
    pub(crate) fn sending_chain_mut(&mut self) -> Option<&mut Chain> {
        let key = self.current_ratchet.ephemeral_key_pair.public_key;
        self.chains.get_mut(&key)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.index_info.closed == -1
    }

    /// Close this session. It stays in the record until retired.
    pub(crate) fn close(&mut self, now: i64) {
        if self.is_open() {
            self.index_info.closed = now;
        }
    }

    /// Install a new chain from one DH ratchet step against `remote_key`.
    ///
    /// A sending chain is filed under our ratchet public key, a receiving
    /// chain under the remote's.
    pub(crate) fn calculate_ratchet(&mut self, remote_key: &PublicKey, sending: bool) -> Result<()> {
        let ratchet = &mut self.current_ratchet;
        let (root_key, chain_key) = ratchet
            .root_key
            .create_chain(remote_key, &ratchet.ephemeral_key_pair.private_key)?;
        ratchet.root_key = root_key;

        let (index_key, chain_type) = if sending {
            (ratchet.ephemeral_key_pair.public_key, ChainType::Sending)
        } else {
            (*remote_key, ChainType::Receiving)
        };
        self.chains
            .insert(index_key, Chain::new(chain_key, chain_type));
        Ok(())
    }

    /// Run the DH ratchet if the peer's ratchet key changed.
    ///
    /// Closes the previous receiving chain after filling it up to the
    /// peer's previous counter, installs the receiving chain for the new
    /// remote key, rotates our ephemeral pair and installs the matching
    /// sending chain.
    pub(crate) fn maybe_step_ratchet<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        remote_key: &PublicKey,
        previous_counter: i32,
    ) -> Result<()> {
        if self.chains.contains_key(remote_key) {
            return Ok(());
        }

        let last_remote = self.current_ratchet.last_remote_ephemeral_key;
        if let Some(previous) = self.chains.get_mut(&last_remote) {
            previous.fill_message_keys(previous_counter)?;
            previous.chain_key.close();
        }

        self.calculate_ratchet(remote_key, false)?;

        let our_ratchet_key = self.current_ratchet.ephemeral_key_pair.public_key;
        if let Some(old_sending) = self.chains.remove(&our_ratchet_key) {
            self.current_ratchet.previous_counter = old_sending.chain_key.counter.max(0) as u32;
        }

        self.current_ratchet.ephemeral_key_pair = KeyPair::generate(rng);
        self.calculate_ratchet(remote_key, true)?;
        self.current_ratchet.last_remote_ephemeral_key = *remote_key;
        Ok(())
    }
}
