//! Provisioning helpers: the key material a client generates at
//! registration time and republishes as prekey bundles.

use crate::curve::{calculate_signature, KeyPair};
use crate::error::Result;
use crate::storage::{PreKeyRecord, SignedPreKeyRecord};

use rand_core::CryptoRngCore;

/// Generate a long-term identity key pair.
pub fn generate_identity_key_pair<R: CryptoRngCore>(rng: &mut R) -> KeyPair {
    KeyPair::generate(rng)
}

/// Generate a 14-bit registration id.
pub fn generate_registration_id<R: CryptoRngCore>(rng: &mut R) -> u32 {
    rng.next_u32() & 0x3FFF
}

/// Generate a numbered one-time prekey.
pub fn generate_pre_key<R: CryptoRngCore>(rng: &mut R, id: u32) -> PreKeyRecord {
    PreKeyRecord {
        id,
        key_pair: KeyPair::generate(rng),
    }
}

/// Generate a numbered signed prekey, signed by the identity key.
pub fn generate_signed_pre_key<R: CryptoRngCore>(
    rng: &mut R,
    identity: &KeyPair,
    id: u32,
) -> Result<SignedPreKeyRecord> {
    let key_pair = KeyPair::generate(rng);
    let signature = calculate_signature(
        rng,
        &identity.private_key,
        &key_pair.public_key.serialize(),
    )?;
    Ok(SignedPreKeyRecord {
        id,
        key_pair,
        signature,
    })
}
