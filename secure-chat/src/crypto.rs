//! Cryptographic primitives used by the secure channel handshake.
//!
//! The session code never touches a cipher directly; it calls into a
//! [`CryptoProvider`] shared as `Arc<dyn CryptoProvider>`. The production
//! provider is [`RsaAesProvider`]:
//! - RSA (PKCS#1 v1.5) wraps the symmetric session key and signs its digest
//! - SHA-256 is the digest the signature covers
//! - AES-128-GCM encrypts chat lines, output is `nonce (12 bytes) || ciphertext`
//!
//! Binary material travels inside a text protocol, so everything that leaves
//! this module for the wire goes through [`encode_hex`].

use std::fmt;

use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::{RngCore, rngs::OsRng};
use rsa::{
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::{DecodePublicKey, EncodePublicKey},
    signature::{SignatureEncoding, Signer, Verifier},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of the symmetric session key in bytes (AES-128).
pub const SESSION_KEY_LEN: usize = 16;

/// Modulus size used when nothing else is configured.
pub const DEFAULT_KEY_BITS: usize = 2048;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("public key encoding failed: {0}")]
    KeyEncoding(String),

    #[error("public key decoding failed: {0}")]
    KeyDecoding(String),

    #[error("session key wrapping failed: {0}")]
    Wrap(String),

    #[error("session key unwrapping failed: {0}")]
    Unwrap(String),

    #[error("signing failed: {0}")]
    Sign(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Local asymmetric key pair, generated once per endpoint.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").finish_non_exhaustive()
    }
}

/// Public key learned from the remote endpoint's `[public_key]` offer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerPublicKey(RsaPublicKey);

/// Symmetric key shared by both ends of a secured channel.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; SESSION_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::Unwrap(format!("expected {SESSION_KEY_LEN} key bytes, got {}", bytes.len())))?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// The primitives the handshake and the chat relay depend on.
pub trait CryptoProvider: Send + Sync {
    fn generate_key_pair(&self) -> Result<KeyPair, CryptoError>;

    fn generate_session_key(&self) -> SessionKey;

    /// DER (SubjectPublicKeyInfo) encoding of the local public key.
    fn export_public_key(&self, keys: &KeyPair) -> Result<Vec<u8>, CryptoError>;

    fn import_public_key(&self, der: &[u8]) -> Result<PeerPublicKey, CryptoError>;

    fn wrap_session_key(
        &self,
        peer: &PeerPublicKey,
        key: &SessionKey,
    ) -> Result<Vec<u8>, CryptoError>;

    fn unwrap_session_key(&self, keys: &KeyPair, blob: &[u8]) -> Result<SessionKey, CryptoError>;

    fn digest(&self, data: &[u8]) -> Vec<u8>;

    /// Signs `digest(key)` with the local private key.
    fn sign_session_key(&self, keys: &KeyPair, key: &SessionKey) -> Result<Vec<u8>, CryptoError>;

    fn verify_session_key(&self, peer: &PeerPublicKey, key: &SessionKey, signature: &[u8]) -> bool;

    fn encrypt(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// RSA + SHA-256 + AES-128-GCM.
#[derive(Debug, Clone)]
pub struct RsaAesProvider {
    key_bits: usize,
}

impl RsaAesProvider {
    pub fn new(key_bits: usize) -> Self {
        Self { key_bits }
    }
}

impl Default for RsaAesProvider {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_BITS)
    }
}

impl CryptoProvider for RsaAesProvider {
    fn generate_key_pair(&self) -> Result<KeyPair, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, self.key_bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(KeyPair { private, public })
    }

    fn generate_session_key(&self) -> SessionKey {
        let mut raw = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut raw);
        SessionKey(raw)
    }

    fn export_public_key(&self, keys: &KeyPair) -> Result<Vec<u8>, CryptoError> {
        let document = keys
            .public
            .to_public_key_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(document.as_bytes().to_vec())
    }

    fn import_public_key(&self, der: &[u8]) -> Result<PeerPublicKey, CryptoError> {
        RsaPublicKey::from_public_key_der(der)
            .map(PeerPublicKey)
            .map_err(|e| CryptoError::KeyDecoding(e.to_string()))
    }

    fn wrap_session_key(
        &self,
        peer: &PeerPublicKey,
        key: &SessionKey,
    ) -> Result<Vec<u8>, CryptoError> {
        peer.0
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, key.as_bytes())
            .map_err(|e| CryptoError::Wrap(e.to_string()))
    }

    fn unwrap_session_key(&self, keys: &KeyPair, blob: &[u8]) -> Result<SessionKey, CryptoError> {
        let raw = keys
            .private
            .decrypt(Pkcs1v15Encrypt, blob)
            .map_err(|e| CryptoError::Unwrap(e.to_string()))?;
        SessionKey::from_bytes(&raw)
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn sign_session_key(&self, keys: &KeyPair, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
        let signing_key = SigningKey::<Sha256>::new(keys.private.clone());
        let signature = signing_key
            .try_sign(&self.digest(key.as_bytes()))
            .map_err(|e| CryptoError::Sign(e.to_string()))?;
        Ok(signature.to_vec())
    }

    fn verify_session_key(&self, peer: &PeerPublicKey, key: &SessionKey, signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        let verifying_key = VerifyingKey::<Sha256>::new(peer.0.clone());
        verifying_key
            .verify(&self.digest(key.as_bytes()), &signature)
            .is_ok()
    }

    fn encrypt(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Encrypt)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() <= NONCE_LEN {
            return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        let cipher = Aes128Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Decrypt)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::Decrypt)
    }
}

pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn decode_hex(text: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(hex::decode(text.trim())?)
}
