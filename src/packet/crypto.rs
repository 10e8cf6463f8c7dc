//! Signing and encryption policies for the frame protocol.
//!
//! The codec only depends on the `Signer`/`Cryptor` traits; the concrete
//! policies here are the ones session negotiation hands out today:
//! HMAC-SHA256 or Ed25519 signatures, AES-256-GCM payload encryption.
//! Encryption wire format: nonce (12 bytes) || ciphertext (includes GCM tag).

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Errors from a `Cryptor` implementation.
#[derive(Debug)]
pub enum CryptoError {
    /// Ciphertext shorter than the nonce prefix.
    CiphertextTooShort,
    /// AEAD failure (bad key, corrupted ciphertext, tag mismatch).
    Cipher(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CiphertextTooShort => write!(f, "Ciphertext too short (< 12 bytes)"),
            Self::Cipher(e) => write!(f, "Cipher error: {}", e),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Detached-signature policy over raw frame bytes.
pub trait Signer: Send + Sync {
    /// Length in bytes of the signatures this signer produces.
    fn signature_len(&self) -> usize;
    fn sign(&self, data: &[u8]) -> Vec<u8>;
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
}

/// Symmetric payload encryption policy.
pub trait Cryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// HMAC-SHA256 signer keyed with a shared session secret.
pub struct HmacSha256Signer {
    key: Vec<u8>,
}

impl HmacSha256Signer {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

impl Signer for HmacSha256Signer {
    fn signature_len(&self) -> usize {
        32
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.verify_slice(signature).is_ok()
    }
}

/// Ed25519 signer holding the session keypair.
pub struct Ed25519Signer {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519Signer {
    pub fn new(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(seed))
    }
}

impl Signer for Ed25519Signer {
    fn signature_len(&self) -> usize {
        64
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.verifying_key.verify(data, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// AES-256-GCM cryptor with a random 12-byte nonce per frame.
pub struct AesGcmCryptor {
    cipher: Aes256Gcm,
}

impl AesGcmCryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from(*key);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }
}

impl Cryptor for AesGcmCryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes: [u8; 12] = rand::rng().random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < 12 {
            return Err(CryptoError::CiphertextTooShort);
        }
        let nonce = Nonce::from_slice(&ciphertext[..12]);
        self.cipher
            .decrypt(nonce, &ciphertext[12..])
            .map_err(|e| CryptoError::Cipher(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sign_verify() {
        let signer = HmacSha256Signer::new(b"session-secret".to_vec());
        let sig = signer.sign(b"frame bytes");
        assert_eq!(sig.len(), signer.signature_len());
        assert!(signer.verify(b"frame bytes", &sig));
        assert!(!signer.verify(b"other bytes", &sig));
    }

    #[test]
    fn test_hmac_wrong_key_fails() {
        let a = HmacSha256Signer::new(b"key-a".to_vec());
        let b = HmacSha256Signer::new(b"key-b".to_vec());
        let sig = a.sign(b"frame");
        assert!(!b.verify(b"frame", &sig));
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let signer = Ed25519Signer::from_seed(&[7u8; 32]);
        let sig = signer.sign(b"frame bytes");
        assert_eq!(sig.len(), 64);
        assert!(signer.verify(b"frame bytes", &sig));
        assert!(!signer.verify(b"frame bytes!", &sig));
    }

    #[test]
    fn test_ed25519_garbage_signature_rejected() {
        let signer = Ed25519Signer::from_seed(&[9u8; 32]);
        assert!(!signer.verify(b"frame", &[0u8; 64]));
        assert!(!signer.verify(b"frame", &[0u8; 3]));
    }

    #[test]
    fn test_aes_gcm_roundtrip() {
        let cryptor = AesGcmCryptor::new(&[42u8; 32]);
        let plaintext = b"hello hub";
        let encrypted = cryptor.encrypt(plaintext).unwrap();
        // nonce (12) + plaintext + GCM tag (16)
        assert_eq!(encrypted.len(), 12 + plaintext.len() + 16);
        assert_eq!(cryptor.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_aes_gcm_wrong_key_fails() {
        let a = AesGcmCryptor::new(&[1u8; 32]);
        let b = AesGcmCryptor::new(&[2u8; 32]);
        let encrypted = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_aes_gcm_too_short_fails() {
        let cryptor = AesGcmCryptor::new(&[1u8; 32]);
        assert!(matches!(
            cryptor.decrypt(&[0u8; 5]),
            Err(CryptoError::CiphertextTooShort)
        ));
    }
}
