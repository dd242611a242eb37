//! AES-CBC transport codec
//!
//! Encrypted frames on the link carry an explicit big-endian plaintext length
//! followed by an optional 4-byte IV seed and the ciphertext:
//!
//! ```text
//! [plaintext_len_hi plaintext_len_lo] ([iv_seed:4])? [ciphertext...]
//! ```
//!
//! When the caller supplies an IV (the handshake's challenge round) no seed
//! is prefixed; otherwise a random 4-byte seed is generated and its MD5
//! digest becomes the 16-byte IV. The plaintext is zero-padded to the AES
//! block boundary; the recorded length recovers the real size on decrypt, so
//! no padding scheme travels on the wire.

use aes::cipher::block_padding::{NoPadding, ZeroPadding};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

use crate::error::{BleError, BleResult};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// Length of the plaintext-length prefix
const LEN_PREFIX_SIZE: usize = 2;

/// Length of the optional IV seed
const IV_SEED_SIZE: usize = 4;

/// An AES-CBC key of either width used on the link
///
/// The challenge round derives a 128-bit key from the shared secret; the
/// ECDH exchange yields a 256-bit session key.
#[derive(Clone, PartialEq, Eq)]
pub enum CipherKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

// Key material must never reach logs
impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherKey::Aes128(_) => write!(f, "CipherKey::Aes128(..)"),
            CipherKey::Aes256(_) => write!(f, "CipherKey::Aes256(..)"),
        }
    }
}

impl CipherKey {
    fn encrypt_blocks(&self, iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
        match self {
            CipherKey::Aes128(key) => Aes128CbcEnc::new(key.into(), iv.into())
                .encrypt_padded_vec_mut::<ZeroPadding>(plaintext),
            CipherKey::Aes256(key) => Aes256CbcEnc::new(key.into(), iv.into())
                .encrypt_padded_vec_mut::<ZeroPadding>(plaintext),
        }
    }

    fn decrypt_blocks(&self, iv: &[u8; 16], ciphertext: &[u8]) -> BleResult<Vec<u8>> {
        let result = match self {
            CipherKey::Aes128(key) => Aes128CbcDec::new(key.into(), iv.into())
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
            CipherKey::Aes256(key) => Aes256CbcDec::new(key.into(), iv.into())
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        };
        result.map_err(|e| BleError::cipher_auth(format!("CBC decrypt failed: {e}")))
    }
}

/// Derive a 16-byte IV from a 4-byte seed
#[inline]
pub fn derive_iv(seed: &[u8; 4]) -> [u8; 16] {
    Md5::digest(seed).into()
}

/// Encrypt a plaintext into a link frame
///
/// With `iv` supplied the frame is `[len][ciphertext]`; without it a random
/// seed is generated and the frame is `[len][seed][ciphertext]`.
pub fn encrypt_frame(plaintext: &[u8], key: &CipherKey, iv: Option<&[u8; 16]>) -> BleResult<Vec<u8>> {
    if plaintext.len() > u16::MAX as usize {
        return Err(BleError::cipher_format(format!(
            "plaintext too long for length prefix: {}",
            plaintext.len()
        )));
    }

    let mut frame = Vec::with_capacity(
        LEN_PREFIX_SIZE + IV_SEED_SIZE + plaintext.len() + AES_BLOCK_SIZE,
    );
    frame.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());

    let ciphertext = match iv {
        Some(iv) => key.encrypt_blocks(iv, plaintext),
        None => {
            let seed: [u8; 4] = rand::random();
            frame.extend_from_slice(&seed);
            key.encrypt_blocks(&derive_iv(&seed), plaintext)
        }
    };
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypt a link frame produced by [`encrypt_frame`]
///
/// `iv` must mirror the encrypt-side choice: when absent, the 4-byte seed is
/// read from the frame and hashed into the IV.
pub fn decrypt_frame(frame: &[u8], key: &CipherKey, iv: Option<&[u8; 16]>) -> BleResult<Vec<u8>> {
    if frame.len() < LEN_PREFIX_SIZE {
        return Err(BleError::cipher_format(format!(
            "frame shorter than length prefix: {} bytes",
            frame.len()
        )));
    }
    let plaintext_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;

    let (iv, ciphertext) = match iv {
        Some(iv) => (*iv, &frame[LEN_PREFIX_SIZE..]),
        None => {
            if frame.len() < LEN_PREFIX_SIZE + IV_SEED_SIZE {
                return Err(BleError::cipher_format("frame truncated before IV seed"));
            }
            let mut seed = [0u8; 4];
            seed.copy_from_slice(&frame[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + IV_SEED_SIZE]);
            (derive_iv(&seed), &frame[LEN_PREFIX_SIZE + IV_SEED_SIZE..])
        }
    };

    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(BleError::cipher_format(format!(
            "ciphertext length {} is not a multiple of the AES block",
            ciphertext.len()
        )));
    }
    if plaintext_len > ciphertext.len() {
        return Err(BleError::cipher_format(format!(
            "length prefix {} exceeds ciphertext length {}",
            plaintext_len,
            ciphertext.len()
        )));
    }

    let mut plaintext = key.decrypt_blocks(&iv, ciphertext)?;
    plaintext.truncate(plaintext_len);
    Ok(plaintext)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn key128() -> CipherKey {
        CipherKey::Aes128(*b"0123456789abcdef")
    }

    fn key256() -> CipherKey {
        CipherKey::Aes256(*b"0123456789abcdef0123456789abcdef")
    }

    #[test]
    fn test_derive_iv_is_md5() {
        // MD5("\x00\x01\x02\x03") reference digest
        let iv = derive_iv(&[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(hex::encode(iv), "37b59afd592725f9305e484a5d7f5168");
    }

    #[test]
    fn test_roundtrip_with_explicit_iv() {
        let iv = [0x42u8; 16];
        for len in [1usize, 15, 16, 17, 31, 32, 134] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = encrypt_frame(&plaintext, &key128(), Some(&iv)).unwrap();

            // No seed prefix, ciphertext rounded up to the block boundary
            let expected_ct = plaintext.len().div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
            assert_eq!(frame.len(), 2 + expected_ct);
            assert_eq!(
                u16::from_be_bytes([frame[0], frame[1]]) as usize,
                plaintext.len()
            );

            let decrypted = decrypt_frame(&frame, &key128(), Some(&iv)).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_roundtrip_with_random_seed() {
        let plaintext = b"register map discovery".to_vec();
        let frame = encrypt_frame(&plaintext, &key256(), None).unwrap();

        // Seed rides between the length prefix and the ciphertext
        assert_eq!(frame.len(), 2 + 4 + 32);
        let decrypted = decrypt_frame(&frame, &key256(), None).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_seeded_frames_differ_between_calls() {
        let plaintext = [0xAAu8; 16];
        let a = encrypt_frame(&plaintext, &key128(), None).unwrap();
        let b = encrypt_frame(&plaintext, &key128(), None).unwrap();
        // 32 bits of seed make a collision vanishingly unlikely
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_input_is_format_error() {
        let err = decrypt_frame(&[0x00], &key128(), None).unwrap_err();
        assert!(matches!(err, BleError::CipherFormat(_)));

        let err = decrypt_frame(&[], &key128(), Some(&[0u8; 16])).unwrap_err();
        assert!(matches!(err, BleError::CipherFormat(_)));
    }

    #[test]
    fn test_truncated_seed_is_format_error() {
        let err = decrypt_frame(&[0x00, 0x04, 0x01, 0x02], &key128(), None).unwrap_err();
        assert!(matches!(err, BleError::CipherFormat(_)));
    }

    #[test]
    fn test_partial_block_is_format_error() {
        let iv = [0u8; 16];
        let mut frame = encrypt_frame(&[0x11u8; 16], &key128(), Some(&iv)).unwrap();
        frame.pop();
        let err = decrypt_frame(&frame, &key128(), Some(&iv)).unwrap_err();
        assert!(matches!(err, BleError::CipherFormat(_)));
    }

    #[test]
    fn test_length_prefix_exceeding_ciphertext_is_format_error() {
        let iv = [0u8; 16];
        let mut frame = encrypt_frame(&[0x11u8; 8], &key128(), Some(&iv)).unwrap();
        frame[0] = 0x00;
        frame[1] = 0x40;
        let err = decrypt_frame(&frame, &key128(), Some(&iv)).unwrap_err();
        assert!(matches!(err, BleError::CipherFormat(_)));
    }

    #[test]
    fn test_wrong_key_yields_garbage_not_panic() {
        let iv = [0u8; 16];
        let frame = encrypt_frame(b"secret", &key128(), Some(&iv)).unwrap();
        let other = CipherKey::Aes128(*b"fedcba9876543210");
        let decrypted = decrypt_frame(&frame, &other, Some(&iv)).unwrap();
        assert_ne!(decrypted, b"secret");
    }

    #[test]
    fn test_key_debug_does_not_leak() {
        let rendered = format!("{:?}", key256());
        assert!(!rendered.contains("0123"));
    }
}
