//! Storage abstractions: the capability set the session layer needs from
//! its persistence backend.
//!
//! The trait is async so implementations may sit on databases or IPC; the
//! in-memory implementation is suitable for tests and single-process use.
//! Thread-safe by design with interior mutability.

use crate::address::ProtocolAddress;
use crate::curve::{KeyPair, PublicKey, SIGNATURE_LENGTH};
use crate::error::{Error, Result};
use crate::record::SessionRecord;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// A numbered one-time prekey.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyRecord {
    /// Bundle-visible prekey id
    pub id: u32,
    /// The prekey pair
    pub key_pair: KeyPair,
}

/// A numbered signed prekey with its identity signature, kept so bundles
/// can be republished.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// Bundle-visible signed prekey id
    pub id: u32,
    /// The signed prekey pair
    pub key_pair: KeyPair,
    /// XEdDSA signature by the identity key over the public half
    #[serde(with = "serde_arrays")]
    pub signature: [u8; SIGNATURE_LENGTH],
}

/// The capability set the protocol core requires from storage.
///
/// All methods are suspension points; the core performs no other awaits
/// while holding a per-address queue slot.
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    /// Load the session record for an address. Absence is normal.
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>>;

    /// Persist the session record for an address.
    async fn store_session(&self, address: &ProtocolAddress, record: &SessionRecord)
        -> Result<()>;

    /// Whether `identity_key` is (still) trusted for `name`. Trust policy
    /// lives entirely behind this call.
    async fn is_trusted_identity(&self, name: &str, identity_key: &PublicKey) -> Result<bool>;

    /// Fetch a one-time prekey by id.
    async fn load_pre_key(&self, id: u32) -> Result<Option<KeyPair>>;

    /// Remove a consumed one-time prekey.
    async fn remove_pre_key(&self, id: u32) -> Result<()>;

    /// Fetch a signed prekey by id.
    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>>;

    /// Our long-term identity key pair.
    async fn get_our_identity(&self) -> Result<KeyPair>;

    /// Our 14-bit registration id.
    async fn get_our_registration_id(&self) -> Result<u32>;
}

/// In-memory [`ProtocolStore`].
///
/// Session records are held in their serialized form, so every load runs
/// the same deserialization path a persistent backend would.
#[derive(Debug)]
pub struct InMemoryProtocolStore {
    identity: KeyPair,
    registration_id: u32,
    sessions: Mutex<HashMap<String, Vec<u8>>>,
    pre_keys: Mutex<HashMap<u32, KeyPair>>,
    signed_pre_keys: Mutex<HashMap<u32, SignedPreKeyRecord>>,
    known_identities: Mutex<HashMap<String, PublicKey>>,
}

impl InMemoryProtocolStore {
    /// Create a store for the given local identity.
    #[must_use]
    pub fn new(identity: KeyPair, registration_id: u32) -> Self {
        Self {
            identity,
            registration_id,
            sessions: Mutex::new(HashMap::new()),
            pre_keys: Mutex::new(HashMap::new()),
            signed_pre_keys: Mutex::new(HashMap::new()),
            known_identities: Mutex::new(HashMap::new()),
        }
    }

    /// Register a one-time prekey.
    pub fn store_pre_key(&self, record: PreKeyRecord) -> Result<()> {
        let mut pre_keys = self.pre_keys.lock().map_err(poisoned)?;
        pre_keys.insert(record.id, record.key_pair);
        Ok(())
    }

    /// Register a signed prekey.
    pub fn store_signed_pre_key(&self, record: SignedPreKeyRecord) -> Result<()> {
        let mut signed = self.signed_pre_keys.lock().map_err(poisoned)?;
        signed.insert(record.id, record);
        Ok(())
    }

    /// Pin the identity key expected for `name`. Later trust checks compare
    /// against the pin; unpinned names are trusted on first use.
    pub fn save_identity(&self, name: &str, identity_key: &PublicKey) -> Result<()> {
        let mut known = self.known_identities.lock().map_err(poisoned)?;
        known.insert(name.to_string(), *identity_key);
        Ok(())
    }

    /// Number of unconsumed one-time prekeys.
    pub fn pre_key_count(&self) -> Result<usize> {
        Ok(self.pre_keys.lock().map_err(poisoned)?.len())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Storage("store mutex poisoned".into())
}

#[async_trait]
impl ProtocolStore for InMemoryProtocolStore {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>> {
        let sessions = self.sessions.lock().map_err(poisoned)?;
        sessions
            .get(&address.to_string())
            .map(|bytes| SessionRecord::deserialize(bytes))
            .transpose()
    }

    async fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<()> {
        let bytes = record.serialize()?;
        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        sessions.insert(address.to_string(), bytes);
        Ok(())
    }

    async fn is_trusted_identity(&self, name: &str, identity_key: &PublicKey) -> Result<bool> {
        let known = self.known_identities.lock().map_err(poisoned)?;
        Ok(match known.get(name) {
            Some(pinned) => pinned == identity_key,
            None => true,
        })
    }

    async fn load_pre_key(&self, id: u32) -> Result<Option<KeyPair>> {
        let pre_keys = self.pre_keys.lock().map_err(poisoned)?;
        Ok(pre_keys.get(&id).cloned())
    }

    async fn remove_pre_key(&self, id: u32) -> Result<()> {
        let mut pre_keys = self.pre_keys.lock().map_err(poisoned)?;
        pre_keys.remove(&id);
        Ok(())
    }

    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>> {
        let signed = self.signed_pre_keys.lock().map_err(poisoned)?;
        Ok(signed.get(&id).cloned())
    }

    async fn get_our_identity(&self) -> Result<KeyPair> {
        Ok(self.identity.clone())
    }

    async fn get_our_registration_id(&self) -> Result<u32> {
        Ok(self.registration_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[tokio::test]
    async fn test_session_blobs_roundtrip() {
        let store = InMemoryProtocolStore::new(KeyPair::generate(&mut OsRng), 42);
        let addr = ProtocolAddress::new("alice", 1);

        assert!(store.load_session(&addr).await.unwrap().is_none());

        let record = SessionRecord::new();
        store.store_session(&addr, &record).await.unwrap();
        let loaded = store.load_session(&addr).await.unwrap().unwrap();
        assert_eq!(loaded.session_count(), 0);
    }

    #[tokio::test]
    async fn test_prekeys_consume() {
        let store = InMemoryProtocolStore::new(KeyPair::generate(&mut OsRng), 42);
        store
            .store_pre_key(PreKeyRecord {
                id: 7,
                key_pair: KeyPair::generate(&mut OsRng),
            })
            .unwrap();

        assert!(store.load_pre_key(7).await.unwrap().is_some());
        store.remove_pre_key(7).await.unwrap();
        assert!(store.load_pre_key(7).await.unwrap().is_none());
        assert_eq!(store.pre_key_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_identity_pinning() {
        let store = InMemoryProtocolStore::new(KeyPair::generate(&mut OsRng), 42);
        let key_a = KeyPair::generate(&mut OsRng).public_key;
        let key_b = KeyPair::generate(&mut OsRng).public_key;

        // trust on first use
        assert!(store.is_trusted_identity("alice", &key_a).await.unwrap());

        store.save_identity("alice", &key_a).unwrap();
        assert!(store.is_trusted_identity("alice", &key_a).await.unwrap());
        assert!(!store.is_trusted_identity("alice", &key_b).await.unwrap());
    }
}
