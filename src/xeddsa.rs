//! XEdDSA signatures over X25519 keys.
//!
//! Implements the scheme from "The XEdDSA and VXEdDSA Signature Schemes"
//! (Perrin, revision 1): an Ed25519-shaped signature computed from an X25519
//! private scalar, verifiable against the birationally-mapped Edwards point
//! of the X25519 public key.

use crate::curve::{PrivateKey, PublicKey, SIGNATURE_LENGTH};
use crate::error::{Error, Result};

use curve25519_dalek::{
    constants::ED25519_BASEPOINT_TABLE,
    edwards::{CompressedEdwardsY, EdwardsPoint},
    montgomery::MontgomeryPoint,
    scalar::Scalar,
};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Signing key derived from an X25519 private key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct XEdDsaPrivateKey {
    /// Ed25519 private scalar, sign-adjusted so the public point has a zero
    /// sign bit
    a: Scalar,
    #[zeroize(skip)]
    public: XEdDsaPublicKey,
}

/// Verifying key derived from an X25519 public key.
#[derive(Clone, Copy, Debug)]
pub(crate) struct XEdDsaPublicKey {
    compressed: CompressedEdwardsY,
}

impl XEdDsaPrivateKey {
    /// Derive the signing key from a clamped X25519 private key.
    pub(crate) fn from_private(private: &PrivateKey) -> Result<Self> {
        let public = XEdDsaPublicKey::from_public(&private.public_key())?;

        let k = Scalar::from_bytes_mod_order(*private.as_scalar_bytes());

        // E = kB; the sign bit of E decides whether to negate the scalar so
        // that the published point A always has sign 0.
        let e_compressed = (&k * ED25519_BASEPOINT_TABLE).compress();
        let sign_bit = (e_compressed.as_bytes()[31] >> 7) & 1;
        let a = if sign_bit == 1 { -k } else { k };

        Ok(Self { a, public })
    }

    /// Sign a message, mixing in 64 bytes of caller-supplied randomness.
    pub(crate) fn sign(&self, message: &[u8], random: &[u8; 64]) -> [u8; SIGNATURE_LENGTH] {
        // r = hash1(a || M || Z) (mod q)
        let r = self.nonce_scalar(message, random);

        // R = rB
        let r_compressed = (&r * ED25519_BASEPOINT_TABLE).compress();

        // h = hash(R || A || M) (mod q)
        let h = challenge_scalar(&r_compressed, &self.public.compressed, message);

        // s = r + ha (mod q)
        let s = r + (h * self.a);

        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature[..32].copy_from_slice(r_compressed.as_bytes());
        signature[32..].copy_from_slice(s.as_bytes());
        signature
    }

    /// hash1(a || M || Z) mod q, with the 0xFE || 0xFF^31 domain prefix.
    fn nonce_scalar(&self, message: &[u8], random: &[u8; 64]) -> Scalar {
        let mut hasher = Sha512::new();
        hasher.update([0xFEu8]);
        hasher.update([0xFFu8; 31]);
        hasher.update(self.a.as_bytes());
        hasher.update(message);
        hasher.update(random);
        Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
    }
}

impl std::fmt::Debug for XEdDsaPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XEdDsaPrivateKey([REDACTED])")
    }
}

impl XEdDsaPublicKey {
    /// Map a type-prefixed X25519 public key to its Edwards verifying key.
    pub(crate) fn from_public(public: &PublicKey) -> Result<Self> {
        let mut u = public.montgomery();
        u[31] &= 0x7F;

        // Birational map y = (u - 1) / (u + 1), sign bit forced to 0
        let edwards = MontgomeryPoint(u)
            .to_edwards(0)
            .ok_or(Error::InvalidArgument("public key is not a curve point"))?;

        let mut bytes = *edwards.compress().as_bytes();
        bytes[31] &= 0x7F;

        Ok(Self {
            compressed: CompressedEdwardsY(bytes),
        })
    }

    /// Verify a signature. Any malformed component fails closed.
    pub(crate) fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> Result<()> {
        let mut r_bytes = [0u8; 32];
        let mut s_bytes = [0u8; 32];
        r_bytes.copy_from_slice(&signature[..32]);
        s_bytes.copy_from_slice(&signature[32..]);

        let r_compressed = CompressedEdwardsY(r_bytes);
        if r_compressed.decompress().is_none() {
            return Err(Error::InvalidSignature);
        }

        // s must be fully reduced: reject s >= 2^253
        if (s_bytes[31] & 0xE0) != 0 {
            return Err(Error::InvalidSignature);
        }
        let s = Scalar::from_bytes_mod_order(s_bytes);

        let a_point = self
            .compressed
            .decompress()
            .ok_or(Error::InvalidArgument("public key is not a curve point"))?;
        if !a_point.is_torsion_free() {
            return Err(Error::InvalidArgument("public key has torsion"));
        }

        let h = challenge_scalar(&r_compressed, &self.compressed, message);

        // Rcheck = sB - hA
        let r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-a_point, &s);

        if r_check.compress().as_bytes().ct_eq(&r_bytes).into() {
            Ok(())
        } else {
            Err(Error::InvalidSignature)
        }
    }
}

/// hash(R || A || M) mod q
fn challenge_scalar(
    r_point: &CompressedEdwardsY,
    public: &CompressedEdwardsY,
    message: &[u8],
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(r_point.as_bytes());
    hasher.update(public.as_bytes());
    hasher.update(message);
    Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::KeyPair;
    use rand_core::{OsRng, RngCore};

    #[test]
    fn test_sign_verify() {
        let pair = KeyPair::generate(&mut OsRng);
        let signing = XEdDsaPrivateKey::from_private(&pair.private_key).unwrap();
        let verifying = XEdDsaPublicKey::from_public(&pair.public_key).unwrap();

        let mut random = [0u8; 64];
        OsRng.fill_bytes(&mut random);
        let signature = signing.sign(b"prekey to publish", &random);

        verifying.verify(b"prekey to publish", &signature).unwrap();
        assert!(verifying.verify(b"something else", &signature).is_err());
    }

    #[test]
    fn test_randomized_signatures_all_verify() {
        let pair = KeyPair::generate(&mut OsRng);
        let signing = XEdDsaPrivateKey::from_private(&pair.private_key).unwrap();
        let verifying = XEdDsaPublicKey::from_public(&pair.public_key).unwrap();

        let mut random = [0u8; 64];
        OsRng.fill_bytes(&mut random);
        let sig1 = signing.sign(b"message", &random);
        OsRng.fill_bytes(&mut random);
        let sig2 = signing.sign(b"message", &random);

        // Different nonces, both valid
        assert_ne!(sig1, sig2);
        verifying.verify(b"message", &sig1).unwrap();
        verifying.verify(b"message", &sig2).unwrap();
    }

    #[test]
    fn test_unreduced_s_rejected() {
        let pair = KeyPair::generate(&mut OsRng);
        let verifying = XEdDsaPublicKey::from_public(&pair.public_key).unwrap();

        let mut bad = [0u8; SIGNATURE_LENGTH];
        bad[31] = 0x20;
        bad[63] = 0xFF;
        assert_eq!(
            verifying.verify(b"message", &bad),
            Err(Error::InvalidSignature)
        );
    }
}
