use enrolld_domain::KeyId;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::KeystoreError;

/// Production key length.
pub const DEFAULT_KEY_BITS: usize = 4096;

/// Hard floor. Tests may tune the length down to this, never below.
pub const MIN_KEY_BITS: usize = 1024;

/// A long-lived RSA device signing key.
///
/// The key id is the lowercase SHA-256 hex digest of the public half's
/// SubjectPublicKeyInfo DER, computed once at construction.
#[derive(Clone)]
pub struct DeviceKey {
    key: RsaPrivateKey,
    public_der: Vec<u8>,
    key_id: KeyId,
}

impl std::fmt::Debug for DeviceKey {
    // Never derive Debug here: it would print private key material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl DeviceKey {
    pub fn generate(bits: usize) -> Result<Self, KeystoreError> {
        if bits < MIN_KEY_BITS {
            return Err(KeystoreError::KeyTooShort {
                bits,
                min: MIN_KEY_BITS,
            });
        }
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| KeystoreError::Crypto(format!("generate: {}", e)))?;
        Self::from_private(key)
    }

    /// Load a key from its PKCS#8 DER encoding (the on-disk format).
    pub fn from_der(der: &[u8]) -> Result<Self, KeystoreError> {
        let key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| KeystoreError::Crypto(format!("decode: {}", e)))?;
        Self::from_private(key)
    }

    fn from_private(key: RsaPrivateKey) -> Result<Self, KeystoreError> {
        let public_der = key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| KeystoreError::Crypto(format!("encode public: {}", e)))?
            .into_vec();
        let key_id = KeyId::new(fingerprint(&public_der));
        Ok(DeviceKey {
            key,
            public_der,
            key_id,
        })
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// PKCS#8 DER of the private key, for persistence.
    pub fn to_der(&self) -> Result<Vec<u8>, KeystoreError> {
        Ok(self
            .key
            .to_pkcs8_der()
            .map_err(|e| KeystoreError::Crypto(format!("encode: {}", e)))?
            .as_bytes()
            .to_vec())
    }

    /// SubjectPublicKeyInfo DER of the public half, as embedded in
    /// assertions.
    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    /// PKCS#1 v1.5 signature over `msg` with SHA-256.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha256>::new(self.key.clone());
        signing_key.sign(msg).to_vec()
    }
}

/// Key id for an arbitrary public key DER (e.g. an authority's account-key).
pub fn fingerprint(public_der: &[u8]) -> String {
    format!("{:x}", Sha256::digest(public_der))
}

/// Verify a PKCS#1 v1.5 SHA-256 signature against a public key DER.
pub fn verify(public_der: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), KeystoreError> {
    let public = RsaPublicKey::from_public_key_der(public_der)
        .map_err(|e| KeystoreError::Crypto(format!("decode public: {}", e)))?;
    let verifying_key = VerifyingKey::<Sha256>::new(public);
    let sig = Signature::try_from(sig).map_err(|_| KeystoreError::BadSignature)?;
    verifying_key
        .verify(msg, &sig)
        .map_err(|_| KeystoreError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_rejects_short_keys() {
        let err = DeviceKey::generate(512).unwrap_err();
        assert!(matches!(err, KeystoreError::KeyTooShort { bits: 512, .. }));
    }

    #[test]
    fn der_round_trip_preserves_key_id() {
        let key = DeviceKey::generate(MIN_KEY_BITS).unwrap();
        let der = key.to_der().unwrap();
        let back = DeviceKey::from_der(&der).unwrap();
        assert_eq!(key.key_id(), back.key_id());
        assert_eq!(key.public_der(), back.public_der());
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = DeviceKey::generate(MIN_KEY_BITS).unwrap();
        let sig = key.sign(b"serial-request");
        verify(key.public_der(), b"serial-request", &sig).unwrap();

        let err = verify(key.public_der(), b"tampered", &sig).unwrap_err();
        assert!(matches!(err, KeystoreError::BadSignature));
    }

    #[test]
    fn fingerprint_is_lowercase_hex() {
        let key = DeviceKey::generate(MIN_KEY_BITS).unwrap();
        let id = key.key_id().as_str();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
