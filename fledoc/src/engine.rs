//! Authenticated field encryption with AES-256-CBC and HMAC-SHA-512.
//!
//! Both algorithms share one construction (encrypt-then-MAC):
//!
//! ```text
//! A   = algorithm_id || len32(collection) || collection || len32(path) || path || key_id
//! IV  = random(16)                                   (randomized)
//! IV  = HMAC-SHA-512(mac_key, A || plaintext)[..16]  (deterministic)
//! C   = AES-256-CBC-PKCS7(aes_key, IV, plaintext)
//! T   = HMAC-SHA-512(mac_key, A || IV || C)[..32]
//! ```
//!
//! # Security Warning
//!
//! Deterministic encryption reveals which values are equal within one field.
//! Use it only for fields that need equality queries.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::context::EncryptionContext;
use crate::data_key::{fill_random, DataKey};
use crate::envelope::{Algorithm, CipherEnvelope, IV_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

type HmacSha512 = Hmac<Sha512>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Encrypts `plaintext` for the field described by `context`.
///
/// # Errors
///
/// Returns `Error::Entropy` if the OS random source fails (randomized only).
/// The caller must pass the key resolved for `context.key_id()`.
///
/// # Example
///
/// ```rust,ignore
/// let envelope = engine::encrypt(b"\x02123456", &key, Algorithm::Deterministic, &context)?;
/// let plaintext = engine::decrypt(&envelope, &key, &context)?;
/// ```
pub fn encrypt(
    plaintext: &[u8],
    key: &DataKey,
    algorithm: Algorithm,
    context: &EncryptionContext,
) -> Result<CipherEnvelope> {
    let aad = associated_data(algorithm, context);

    let mut iv = [0u8; IV_SIZE];
    match algorithm {
        Algorithm::Randomized => fill_random(&mut iv)?,
        Algorithm::Deterministic => {
            let mut mac = new_mac(key)?;
            mac.update(&aad);
            mac.update(plaintext);
            iv.copy_from_slice(&mac.finalize().into_bytes()[..IV_SIZE]);
        }
    }

    let ciphertext = Aes256CbcEnc::new_from_slices(key.aes_key(), &iv)
        .map_err(|_| Error::InvalidKeyLength {
            expected: 32,
            actual: key.aes_key().len(),
        })?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let tag = compute_tag(key, &aad, &iv, &ciphertext)?;

    Ok(CipherEnvelope::new(algorithm, context.key_id(), iv, ciphertext, tag))
}

/// Decrypts an envelope for the field described by `context`.
///
/// The tag is verified in constant time before any decryption happens.
///
/// # Errors
///
/// Returns `Error::Integrity` if:
/// - The envelope was produced for a different field, collection or key
/// - Any bit of the IV, ciphertext or tag was altered
/// - `key` is not the key the envelope was encrypted with
pub fn decrypt(
    envelope: &CipherEnvelope,
    key: &DataKey,
    context: &EncryptionContext,
) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.key_id() != context.key_id() {
        return Err(Error::Integrity);
    }

    let aad = associated_data(envelope.algorithm(), context);

    let mut mac = new_mac(key)?;
    mac.update(&aad);
    mac.update(envelope.iv());
    mac.update(envelope.ciphertext());
    mac.verify_truncated_left(envelope.tag()).map_err(|_| Error::Integrity)?;

    let plaintext = Aes256CbcDec::new_from_slices(key.aes_key(), envelope.iv())
        .map_err(|_| Error::Integrity)?
        .decrypt_padded_vec_mut::<Pkcs7>(envelope.ciphertext())
        .map_err(|_| Error::Integrity)?;

    Ok(Zeroizing::new(plaintext))
}

fn associated_data(algorithm: Algorithm, context: &EncryptionContext) -> Vec<u8> {
    let collection = context.collection().as_bytes();
    let path = context.field_path().as_bytes();

    let mut aad = Vec::with_capacity(1 + 4 + collection.len() + 4 + path.len() + 16);
    aad.push(algorithm.id());
    append_prefixed(&mut aad, collection);
    append_prefixed(&mut aad, path);
    aad.extend_from_slice(context.key_id().as_bytes());
    aad
}

fn append_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    // Collection names and paths are far below 4 GiB.
    #[allow(clippy::cast_possible_truncation)]
    let len = bytes.len() as u32;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
}

fn new_mac(key: &DataKey) -> Result<HmacSha512> {
    HmacSha512::new_from_slice(key.mac_key()).map_err(|_| Error::InvalidKeyLength {
        expected: 32,
        actual: key.mac_key().len(),
    })
}

fn compute_tag(key: &DataKey, aad: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<[u8; TAG_SIZE]> {
    let mut mac = new_mac(key)?;
    mac.update(aad);
    mac.update(iv);
    mac.update(ciphertext);

    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&mac.finalize().into_bytes()[..TAG_SIZE]);
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_key::KeyId;
    use secrecy::SecretVec;

    fn test_key(fill: u8) -> DataKey {
        DataKey::from_secret(SecretVec::new(vec![fill; 96])).unwrap()
    }

    fn test_context() -> EncryptionContext {
        EncryptionContext::new("user", "accountNumber", KeyId::from_bytes([0x42; 16]))
    }

    #[test]
    fn test_deterministic_encryption_is_repeatable() {
        let key = test_key(1);
        let context = test_context();

        let e1 = encrypt(b"123456", &key, Algorithm::Deterministic, &context).unwrap();
        let e2 = encrypt(b"123456", &key, Algorithm::Deterministic, &context).unwrap();

        assert_eq!(
            e1.to_bytes().unwrap(),
            e2.to_bytes().unwrap(),
            "Encryption must be deterministic"
        );
    }

    #[test]
    fn test_randomized_encryption_differs() {
        let key = test_key(1);
        let context = test_context();

        let e1 = encrypt(b"123456", &key, Algorithm::Randomized, &context).unwrap();
        let e2 = encrypt(b"123456", &key, Algorithm::Randomized, &context).unwrap();

        assert_ne!(e1, e2);
        assert_eq!(decrypt(&e1, &key, &context).unwrap().as_slice(), b"123456");
        assert_eq!(decrypt(&e2, &key, &context).unwrap().as_slice(), b"123456");
    }

    #[test]
    fn test_round_trip_both_algorithms() {
        let key = test_key(9);
        let context = test_context();
        let long = vec![0xAA; 1000];
        let plaintexts: [&[u8]; 4] = [b"", b"x", b"exactly sixteen!", &long];

        for algorithm in [Algorithm::Deterministic, Algorithm::Randomized] {
            for plaintext in plaintexts {
                let envelope = encrypt(plaintext, &key, algorithm, &context).unwrap();
                assert_eq!(envelope.algorithm(), algorithm);
                assert_eq!(envelope.ciphertext().len() % 16, 0);
                let decrypted = decrypt(&envelope, &key, &context).unwrap();
                assert_eq!(decrypted.as_slice(), plaintext);
            }
        }
    }

    #[test]
    fn test_different_fields_produce_different_ciphertexts() {
        let key = test_key(1);
        let key_id = KeyId::from_bytes([0x42; 16]);
        let ctx1 = EncryptionContext::new("user", "email", key_id);
        let ctx2 = EncryptionContext::new("user", "phone", key_id);

        let e1 = encrypt(b"same", &key, Algorithm::Deterministic, &ctx1).unwrap();
        let e2 = encrypt(b"same", &key, Algorithm::Deterministic, &ctx2).unwrap();

        assert_ne!(e1, e2, "Different contexts must produce different ciphertexts");
    }

    #[test]
    fn test_replay_into_other_field_fails() {
        let key = test_key(1);
        let key_id = KeyId::from_bytes([0x42; 16]);
        let ctx1 = EncryptionContext::new("user", "email", key_id);
        let ctx2 = EncryptionContext::new("user", "phone", key_id);
        let ctx3 = EncryptionContext::new("admin", "email", key_id);

        let envelope = encrypt(b"alice@example.com", &key, Algorithm::Randomized, &ctx1).unwrap();

        assert!(matches!(decrypt(&envelope, &key, &ctx2), Err(Error::Integrity)));
        assert!(matches!(decrypt(&envelope, &key, &ctx3), Err(Error::Integrity)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let context = test_context();
        let envelope =
            encrypt(b"secret", &test_key(1), Algorithm::Deterministic, &context).unwrap();

        let result = decrypt(&envelope, &test_key(2), &context);
        assert!(matches!(result, Err(Error::Integrity)));
    }

    #[test]
    fn test_context_key_id_must_match_envelope() {
        let key = test_key(1);
        let envelope = encrypt(b"secret", &key, Algorithm::Randomized, &test_context()).unwrap();
        let other = EncryptionContext::new("user", "accountNumber", KeyId::from_bytes([0x43; 16]));

        assert!(matches!(decrypt(&envelope, &key, &other), Err(Error::Integrity)));
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let key = test_key(5);
        let context = test_context();
        let envelope = encrypt(b"123456", &key, Algorithm::Deterministic, &context).unwrap();
        let bytes = envelope.to_bytes().unwrap();

        // Skip subtype, algorithm, key id and length: those fail parsing or
        // context checks instead. IV, ciphertext and tag must fail the MAC.
        let iv_start = 1 + 1 + 16;
        let ct_start = iv_start + 16 + 4;
        let regions = (iv_start..iv_start + 16).chain(ct_start..bytes.len());

        for index in regions {
            for bit in 0..8 {
                let mut tampered = bytes.clone();
                tampered[index] ^= 1 << bit;
                let parsed = CipherEnvelope::from_bytes(&tampered).unwrap();
                assert!(
                    matches!(decrypt(&parsed, &key, &context), Err(Error::Integrity)),
                    "flip at byte {index} bit {bit} not detected"
                );
            }
        }
    }

    #[test]
    fn test_known_deterministic_vector_is_stable() {
        let key = DataKey::from_secret(SecretVec::new((0..96u8).collect())).unwrap();
        let context = EncryptionContext::new("c", "f", KeyId::from_bytes([0; 16]));

        let envelope = encrypt(b"\x02abc", &key, Algorithm::Deterministic, &context).unwrap();

        let mut mac = HmacSha512::new_from_slice(&(32..64u8).collect::<Vec<_>>()).unwrap();
        mac.update(&associated_data(Algorithm::Deterministic, &context));
        mac.update(b"\x02abc");
        let expected_iv = mac.finalize().into_bytes();

        assert_eq!(hex::encode(envelope.iv()), hex::encode(&expected_iv[..16]));
        assert_eq!(envelope.ciphertext().len(), 16);
    }
}
