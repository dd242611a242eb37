//! Key bundle handling
//!
//! The pairing material is distributed as three hex strings: a raw P-256
//! signing scalar (64 hex chars), a DER-encoded SubjectPublicKeyInfo verify
//! key, and a 16-byte shared secret. Signing and verification use
//! ECDSA-SHA256; the shared secret keys the handshake's challenge round.

use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use p256::{PublicKey, SecretKey};

use crate::error::{BleError, BleResult};

/// Length of the shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 16;

/// Pairing material for an encrypted session
#[derive(Clone)]
pub struct KeyBundle {
    signing_key: SigningKey,
    verify_key: VerifyingKey,
    shared_secret: [u8; SHARED_SECRET_SIZE],
}

// The signing key and shared secret must never reach logs
impl std::fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBundle")
            .field("verify_key", &self.verify_key)
            .finish_non_exhaustive()
    }
}

impl KeyBundle {
    /// Build a bundle from typed key material
    pub fn new(
        signing_key: SigningKey,
        verify_key: VerifyingKey,
        shared_secret: [u8; SHARED_SECRET_SIZE],
    ) -> Self {
        Self {
            signing_key,
            verify_key,
            shared_secret,
        }
    }

    /// Parse a bundle from its hex-encoded wire form
    ///
    /// * `signing_key_hex` - 64 hex chars, raw big-endian P-256 scalar
    /// * `verify_key_hex` - DER SubjectPublicKeyInfo
    /// * `shared_secret_hex` - 32 hex chars
    pub fn from_hex(
        signing_key_hex: &str,
        verify_key_hex: &str,
        shared_secret_hex: &str,
    ) -> BleResult<Self> {
        let scalar = hex::decode(signing_key_hex.trim())?;
        if scalar.len() != 32 {
            return Err(BleError::config(format!(
                "signing key must be 32 bytes, got {}",
                scalar.len()
            )));
        }
        let secret_key = SecretKey::from_slice(&scalar)
            .map_err(|e| BleError::config(format!("invalid signing key scalar: {e}")))?;
        let signing_key = SigningKey::from(&secret_key);

        let spki = hex::decode(verify_key_hex.trim())?;
        let public_key = PublicKey::from_public_key_der(&spki)
            .map_err(|e| BleError::config(format!("invalid verify key DER: {e}")))?;
        let verify_key = VerifyingKey::from(public_key);

        let secret = hex::decode(shared_secret_hex.trim())?;
        let shared_secret: [u8; SHARED_SECRET_SIZE] = secret.as_slice().try_into().map_err(|_| {
            BleError::config(format!(
                "shared secret must be {} bytes, got {}",
                SHARED_SECRET_SIZE,
                secret.len()
            ))
        })?;

        Ok(Self::new(signing_key, verify_key, shared_secret))
    }

    /// Generate a fresh self-consistent bundle
    ///
    /// The verify key is the signing key's public half, so two peers holding
    /// the same generated bundle can authenticate each other. Intended for
    /// tests and the mock device.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let verify_key = *signing_key.verifying_key();
        let shared_secret: [u8; SHARED_SECRET_SIZE] = rand::random();
        Self::new(signing_key, verify_key, shared_secret)
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verify_key(&self) -> &VerifyingKey {
        &self.verify_key
    }

    pub fn shared_secret(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.shared_secret
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use p256::pkcs8::EncodePublicKey;

    fn bundle_as_hex(bundle: &KeyBundle) -> (String, String, String) {
        let scalar = hex::encode(bundle.signing_key().to_bytes());
        let spki = bundle
            .verify_key()
            .to_encoded_point(false)
            .to_bytes()
            .to_vec();
        // Re-encode through the typed public key to get canonical DER
        let public = PublicKey::from_sec1_bytes(&spki).unwrap();
        let der = public.to_public_key_der().unwrap();
        let secret = hex::encode(bundle.shared_secret());
        (scalar, hex::encode(der.as_bytes()), secret)
    }

    #[test]
    fn test_hex_roundtrip() {
        let original = KeyBundle::generate();
        let (scalar, spki, secret) = bundle_as_hex(&original);

        let parsed = KeyBundle::from_hex(&scalar, &spki, &secret).unwrap();
        assert_eq!(parsed.verify_key(), original.verify_key());
        assert_eq!(parsed.shared_secret(), original.shared_secret());
        assert_eq!(
            parsed.signing_key().to_bytes(),
            original.signing_key().to_bytes()
        );
    }

    #[test]
    fn test_wrong_scalar_length_rejected() {
        let err = KeyBundle::from_hex("abcd", "3059", "00112233445566778899aabbccddeeff")
            .unwrap_err();
        assert!(matches!(err, BleError::Config(_)));
    }

    #[test]
    fn test_wrong_secret_length_rejected() {
        let original = KeyBundle::generate();
        let (scalar, spki, _) = bundle_as_hex(&original);
        let err = KeyBundle::from_hex(&scalar, &spki, "0011").unwrap_err();
        assert!(matches!(err, BleError::Config(_)));
    }

    #[test]
    fn test_garbage_der_rejected() {
        let original = KeyBundle::generate();
        let (scalar, _, secret) = bundle_as_hex(&original);
        let err = KeyBundle::from_hex(&scalar, "deadbeef", &secret).unwrap_err();
        assert!(matches!(err, BleError::Config(_)));
    }

    #[test]
    fn test_non_hex_input_rejected() {
        let err = KeyBundle::from_hex("zz", "3059", "00").unwrap_err();
        assert!(matches!(err, BleError::Config(_)));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let bundle = KeyBundle::generate();
        let rendered = format!("{bundle:?}");
        assert!(!rendered.contains(&hex::encode(bundle.shared_secret())));
    }
}
