//! Pluggable cryptography provider.
//!
//! Higher layers depend only on the [`CryptoProvider`] trait so wire-level
//! encryption can slot in later without touching the protocols. The default
//! provider composes XChaCha20-Poly1305 for authenticated encryption, X25519
//! with HKDF-SHA256 for the asymmetric box, Ed25519 for detached signatures,
//! and SHA-256 for hashing. Every fallible operation reports an error value;
//! nothing in this module panics.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::aead::KeyInit;
use chacha20poly1305::Key;
use chacha20poly1305::XChaCha20Poly1305;
use chacha20poly1305::XNonce;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;

/// Symmetric and asymmetric keys are 32 bytes.
pub const KEY_LENGTH: usize = 32;

/// XChaCha20-Poly1305 nonce length.
pub const NONCE_LENGTH: usize = 24;

/// Poly1305 authentication tag length.
pub const TAG_LENGTH: usize = 16;

/// Detached Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 keypair encoding (seed plus public key).
pub const SIGNING_PRIVATE_KEY_LENGTH: usize = 64;

pub type SymmetricKey = [u8; KEY_LENGTH];
pub type Nonce = [u8; NONCE_LENGTH];

/// X25519 keypair for the asymmetric box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionKeyPair {
    pub public_key: [u8; KEY_LENGTH],
    pub private_key: [u8; KEY_LENGTH],
}

/// Ed25519 keypair for detached signatures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningKeyPair {
    pub public_key: [u8; KEY_LENGTH],
    pub private_key: [u8; SIGNING_PRIVATE_KEY_LENGTH],
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("ciphertext too short")]
    CiphertextTooShort,
    #[error("invalid key material")]
    InvalidKey,
}

/// Interface for all cryptographic operations used by the stack.
pub trait CryptoProvider: Send + Sync {
    /// Fresh random 32-byte symmetric key.
    fn generate_key(&self) -> SymmetricKey;

    /// Fresh X25519 keypair.
    fn generate_keypair(&self) -> EncryptionKeyPair;

    /// Fresh Ed25519 signing keypair.
    fn generate_signing_keypair(&self) -> SigningKeyPair;

    /// Fresh random 24-byte nonce.
    fn generate_nonce(&self) -> Nonce;

    /// SHA-256 of `data`.
    fn hash(&self, data: &[u8]) -> [u8; KEY_LENGTH];

    /// Authenticated symmetric encryption. Output is ciphertext plus tag.
    fn encrypt(
        &self,
        plaintext: &[u8],
        key: &SymmetricKey,
        nonce: &Nonce,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Inverse of [`encrypt`](Self::encrypt); fails on any tampering.
    fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &SymmetricKey,
        nonce: &Nonce,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Authenticated encryption to a peer: X25519 agreement between the
    /// sender's private and receiver's public key, HKDF-SHA256 key
    /// derivation, then symmetric encryption under a fresh nonce. The
    /// 24-byte nonce is prepended to the returned ciphertext so the
    /// receiver can recover it.
    fn asymmetric_encrypt(
        &self,
        plaintext: &[u8],
        receiver_public_key: &[u8; KEY_LENGTH],
        sender_private_key: &[u8; KEY_LENGTH],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Inverse of [`asymmetric_encrypt`](Self::asymmetric_encrypt), given
    /// the sender's public and receiver's private key.
    fn asymmetric_decrypt(
        &self,
        data: &[u8],
        sender_public_key: &[u8; KEY_LENGTH],
        receiver_private_key: &[u8; KEY_LENGTH],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Detached Ed25519 signature over `message`.
    fn sign(
        &self,
        message: &[u8],
        private_key: &[u8; SIGNING_PRIVATE_KEY_LENGTH],
    ) -> Result<[u8; SIGNATURE_LENGTH], CryptoError>;

    /// Verify a detached signature. Malformed keys or signatures verify as
    /// false rather than erroring.
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8; KEY_LENGTH]) -> bool;
}

/// Default software provider.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCryptoProvider;

impl DefaultCryptoProvider {
    pub fn new() -> Self {
        Self
    }

    /// Key agreement plus derivation shared by both asymmetric directions.
    fn derive_box_key(
        private_key: &[u8; KEY_LENGTH],
        public_key: &[u8; KEY_LENGTH],
    ) -> Result<SymmetricKey, CryptoError> {
        let secret = x25519_dalek::StaticSecret::from(*private_key);
        let public = x25519_dalek::PublicKey::from(*public_key);
        let shared = secret.diffie_hellman(&public);

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; KEY_LENGTH];
        hkdf.expand(b"linknet asymmetric box", &mut key)
            .map_err(|_| CryptoError::InvalidKey)?;
        Ok(key)
    }
}

impl CryptoProvider for DefaultCryptoProvider {
    fn generate_key(&self) -> SymmetricKey {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        key
    }

    fn generate_keypair(&self) -> EncryptionKeyPair {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        EncryptionKeyPair {
            public_key: public.to_bytes(),
            private_key: secret.to_bytes(),
        }
    }

    fn generate_signing_keypair(&self) -> SigningKeyPair {
        let signing_key = SigningKey::generate(&mut OsRng);
        SigningKeyPair {
            public_key: signing_key.verifying_key().to_bytes(),
            private_key: signing_key.to_keypair_bytes(),
        }
    }

    fn generate_nonce(&self) -> Nonce {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    fn hash(&self, data: &[u8]) -> [u8; KEY_LENGTH] {
        Sha256::digest(data).into()
    }

    fn encrypt(
        &self,
        plaintext: &[u8],
        key: &SymmetricKey,
        nonce: &Nonce,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &SymmetricKey,
        nonce: &Nonce,
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LENGTH {
            return Err(CryptoError::CiphertextTooShort);
        }
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn asymmetric_encrypt(
        &self,
        plaintext: &[u8],
        receiver_public_key: &[u8; KEY_LENGTH],
        sender_private_key: &[u8; KEY_LENGTH],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = Self::derive_box_key(sender_private_key, receiver_public_key)?;
        let nonce = self.generate_nonce();
        let ciphertext = self.encrypt(plaintext, &key, &nonce)?;

        let mut result = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn asymmetric_decrypt(
        &self,
        data: &[u8],
        sender_public_key: &[u8; KEY_LENGTH],
        receiver_private_key: &[u8; KEY_LENGTH],
    ) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LENGTH);
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(nonce_bytes);

        let key = Self::derive_box_key(receiver_private_key, sender_public_key)?;
        self.decrypt(ciphertext, &key, &nonce)
    }

    fn sign(
        &self,
        message: &[u8],
        private_key: &[u8; SIGNING_PRIVATE_KEY_LENGTH],
    ) -> Result<[u8; SIGNATURE_LENGTH], CryptoError> {
        let signing_key =
            SigningKey::from_keypair_bytes(private_key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(signing_key.sign(message).to_bytes())
    }

    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8; KEY_LENGTH]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify(message, &signature).is_ok()
    }
}
