//! Cryptographic primitives: AES-256-CBC, HMAC-SHA-256, SHA-512 and a
//! bounded HKDF-SHA-256.

use crate::error::{Error, Result};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// HKDF output block size in bytes
pub const HKDF_BLOCK_SIZE: usize = 32;

/// Maximum number of HKDF output blocks a single derivation may request
pub const HKDF_MAX_BLOCKS: usize = 3;

/// Encrypt with AES-256-CBC and PKCS#7 padding.
#[must_use]
pub fn aes256_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt AES-256-CBC with PKCS#7 padding.
///
/// Fails with [`Error::Decrypt`] on a malformed length or bad padding.
pub fn aes256_cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::Decrypt);
    }
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decrypt)
}

/// HMAC-SHA-256 over `data`.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// SHA-512 digest.
#[must_use]
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HKDF-SHA-256 (RFC 5869) bounded to at most [`HKDF_MAX_BLOCKS`] output
/// blocks of 32 bytes each.
///
/// The salt must be exactly 32 bytes; the key schedules in this crate never
/// use any other width, so a mismatch is a caller bug surfaced as
/// [`Error::InvalidArgument`].
pub fn hkdf_derive(input: &[u8], salt: &[u8], info: &[u8], blocks: usize) -> Result<Vec<[u8; 32]>> {
    if salt.len() != HKDF_BLOCK_SIZE {
        return Err(Error::InvalidArgument("hkdf salt must be 32 bytes"));
    }
    if !(1..=HKDF_MAX_BLOCKS).contains(&blocks) {
        return Err(Error::InvalidArgument("hkdf block count out of range"));
    }

    let mut okm = [0u8; HKDF_BLOCK_SIZE * HKDF_MAX_BLOCKS];
    Hkdf::<Sha256>::new(Some(salt), input)
        .expand(info, &mut okm[..HKDF_BLOCK_SIZE * blocks])
        .expect("output size is valid");

    Ok(okm[..HKDF_BLOCK_SIZE * blocks]
        .chunks_exact(HKDF_BLOCK_SIZE)
        .map(|chunk| chunk.try_into().expect("exact chunk"))
        .collect())
}

/// Constant-time equality of two byte strings.
///
/// Returns `false` for mismatched lengths. All MAC comparisons go through
/// here.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbc_roundtrip() {
        let key = [7u8; 32];
        let iv = [3u8; 16];
        let plaintext = b"attack at dawn";

        let ciphertext = aes256_cbc_encrypt(&key, &iv, plaintext);
        assert_eq!(ciphertext.len() % AES_BLOCK_SIZE, 0);

        let decrypted = aes256_cbc_decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_cbc_rejects_bad_padding() {
        let key = [7u8; 32];
        let iv = [3u8; 16];

        let mut ciphertext = aes256_cbc_encrypt(&key, &iv, b"attack at dawn");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xA5;

        assert_eq!(
            aes256_cbc_decrypt(&key, &iv, &ciphertext),
            Err(Error::Decrypt)
        );
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let key = [7u8; 32];
        let iv = [3u8; 16];
        assert_eq!(
            aes256_cbc_decrypt(&key, &iv, &[0u8; 17]),
            Err(Error::Decrypt)
        );
    }

    #[test]
    fn test_hkdf_block_count() {
        let out = hkdf_derive(b"input", &[0u8; 32], b"info", 3).unwrap();
        assert_eq!(out.len(), 3);
        assert_ne!(out[0], out[1]);
        assert_ne!(out[1], out[2]);

        assert!(hkdf_derive(b"input", &[0u8; 32], b"info", 0).is_err());
        assert!(hkdf_derive(b"input", &[0u8; 32], b"info", 4).is_err());
    }

    #[test]
    fn test_hkdf_salt_width() {
        assert_eq!(
            hkdf_derive(b"input", &[0u8; 16], b"info", 2),
            Err(Error::InvalidArgument("hkdf salt must be 32 bytes"))
        );
    }

    #[test]
    fn test_hkdf_rfc5869_shape() {
        // Extract-then-expand must match a manual HMAC expansion.
        let input = [0x0bu8; 22];
        let salt = [0u8; 32];
        let info = b"whisper test";

        let prk = hmac_sha256(&salt, &input);
        let mut t1_input = info.to_vec();
        t1_input.push(0x01);
        let t1 = hmac_sha256(&prk, &t1_input);

        let out = hkdf_derive(&input, &salt, info, 1).unwrap();
        assert_eq!(out[0], t1);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"same", b"longer input"));
    }
}
