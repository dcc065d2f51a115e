//! Per-connection secure channel state for both ends of the key exchange.
//!
//! The exchange, seen from the server:
//!
//! 1. a `/secure` line starts (or restarts) the handshake
//! 2. both ends offer their public key as `[public_key]<hex DER>`
//! 3. the server wraps its session key with the client's public key and sends
//!    `[session_key]<hex>`
//! 4. the client unwraps it and proves possession of its private key with
//!    `[signed_key]<hex signature over digest(session key)>`
//! 5. the server verifies and answers `[verify_key]OK` or `[verify_key]FAIL`
//!
//! No step fails the connection. Cryptographic errors turn into `FAIL`
//! payloads or tagged chat lines and the channel keeps running in clear text.
//! The client takes the final `[verify_key]` answer on trust.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    crypto::{
        CryptoError, CryptoProvider, KeyPair, PeerPublicKey, SessionKey, decode_hex, encode_hex,
    },
    protocol::{ENCRYPTED_SUFFIX, FAIL, KeyOffer, Line, UNENCRYPTED_SUFFIX},
};

/// Generates the local key pair off the async executor.
async fn generate_keys(crypto: &Arc<dyn CryptoProvider>) -> Option<KeyPair> {
    let worker = Arc::clone(crypto);
    match tokio::task::spawn_blocking(move || worker.generate_key_pair()).await {
        Ok(Ok(keys)) => Some(keys),
        Ok(Err(err)) => {
            warn!(error = %err, "key pair generation failed, secure mode unavailable");
            None
        }
        Err(err) => {
            warn!(error = ?err, "key generation task failed, secure mode unavailable");
            None
        }
    }
}

fn public_offer(crypto: &dyn CryptoProvider, keys: Option<&KeyPair>) -> KeyOffer {
    let Some(keys) = keys else {
        return KeyOffer::Failed;
    };
    match crypto.export_public_key(keys) {
        Ok(der) => KeyOffer::Key(encode_hex(&der)),
        Err(err) => {
            warn!(error = %err, "could not encode local public key");
            KeyOffer::Failed
        }
    }
}

fn seal_with(crypto: &dyn CryptoProvider, key: &SessionKey, text: &str) -> Result<String, CryptoError> {
    crypto.encrypt(key, text.as_bytes()).map(|sealed| encode_hex(&sealed))
}

fn open_with(crypto: &dyn CryptoProvider, key: &SessionKey, hex: &str) -> Result<String, CryptoError> {
    let plain = crypto.decrypt(key, &decode_hex(hex)?)?;
    String::from_utf8(plain).map_err(|_| CryptoError::Decrypt)
}

/// Server side of the handshake, owned by exactly one session.
pub struct SecureChannel {
    crypto: Arc<dyn CryptoProvider>,
    keys: Option<KeyPair>,
    session_key: SessionKey,
    requested: bool,
    peer_key: Option<PeerPublicKey>,
    verified: bool,
}

impl SecureChannel {
    /// Builds the channel with keys generated eagerly. Without a key pair
    /// every `/secure` is answered with `[public_key]FAIL`.
    pub fn new(crypto: Arc<dyn CryptoProvider>, keys: Option<KeyPair>) -> Self {
        let session_key = crypto.generate_session_key();
        Self {
            crypto,
            keys,
            session_key,
            requested: false,
            peer_key: None,
            verified: false,
        }
    }

    pub async fn generate(crypto: Arc<dyn CryptoProvider>) -> Self {
        let keys = generate_keys(&crypto).await;
        Self::new(crypto, keys)
    }

    /// Chat is encrypted only once the peer asked for it and proved it holds
    /// the session key.
    pub fn is_secured(&self) -> bool {
        self.requested && self.verified
    }

    pub fn active_key(&self) -> Option<&SessionKey> {
        self.is_secured().then_some(&self.session_key)
    }

    /// Handles `/secure`. Every attempt starts from fresh state with a newly
    /// minted session key. When no public key can be offered the attempt is
    /// over at once and the rest of its messages are ignored.
    pub fn begin(&mut self) -> Line {
        self.verified = false;
        self.peer_key = None;
        self.session_key = self.crypto.generate_session_key();
        let offer = public_offer(self.crypto.as_ref(), self.keys.as_ref());
        self.requested = offer != KeyOffer::Failed;
        Line::PublicKey(offer)
    }

    /// Handles the peer's `[public_key]` offer. Returns the `[session_key]`
    /// reply, or nothing when there is nothing to answer.
    pub fn accept_peer_key(&mut self, offer: KeyOffer) -> Option<Line> {
        if !self.requested {
            debug!("public key offered without /secure, ignoring");
            return None;
        }
        if self.peer_key.is_some() {
            debug!("peer public key already set for this handshake, ignoring");
            return None;
        }
        let KeyOffer::Key(hex) = offer else {
            debug!("peer could not provide a public key");
            return None;
        };

        let peer = match decode_hex(&hex).and_then(|der| self.crypto.import_public_key(&der)) {
            Ok(peer) => peer,
            Err(err) => {
                warn!(error = %err, "rejecting peer public key");
                return Some(Line::SessionKey(FAIL.to_string()));
            }
        };

        let reply = match self.crypto.wrap_session_key(&peer, &self.session_key) {
            Ok(blob) => encode_hex(&blob),
            Err(err) => {
                warn!(error = %err, "could not wrap session key");
                FAIL.to_string()
            }
        };
        self.peer_key = Some(peer);
        Some(Line::SessionKey(reply))
    }

    /// Handles `[signed_key]`: verifies the signature over the session key
    /// digest with the peer's stored public key.
    pub fn check_signature(&mut self, hex: &str) -> Option<Line> {
        if !self.requested {
            debug!("signature received without an open handshake, ignoring");
            return None;
        }
        if self.verified {
            debug!("handshake already verified, ignoring signature");
            return None;
        }
        let verified = match (&self.peer_key, decode_hex(hex)) {
            (Some(peer), Ok(signature)) => {
                self.crypto
                    .verify_session_key(peer, &self.session_key, &signature)
            }
            (None, _) => {
                debug!("signature received before any peer public key");
                false
            }
            (_, Err(err)) => {
                debug!(error = %err, "signature payload is not hex");
                false
            }
        };
        self.verified = verified;
        Some(Line::VerifyKey(verified))
    }

    pub fn seal(&self, text: &str) -> Result<String, CryptoError> {
        seal_with(self.crypto.as_ref(), &self.session_key, text)
    }

    pub fn open(&self, hex: &str) -> Result<String, CryptoError> {
        open_with(self.crypto.as_ref(), &self.session_key, hex)
    }

    /// Decodes a received line. On a secured channel the line is decrypted
    /// first; a line that fails to decrypt is parsed as sent, and if it turns
    /// out to be chat it carries the ` [UNENCRYPTED]` marker.
    pub fn decode_inbound(&self, raw: &str) -> Line {
        if !self.is_secured() {
            return Line::parse(raw);
        }
        match self.open(raw) {
            Ok(plain) => Line::parse(&plain),
            Err(_) => match Line::parse(raw) {
                Line::Chat(text) => Line::Chat(format!("{text}{UNENCRYPTED_SUFFIX}")),
                control => control,
            },
        }
    }
}

/// Client side of the handshake.
pub struct ClientChannel {
    crypto: Arc<dyn CryptoProvider>,
    keys: Option<KeyPair>,
    requested: bool,
    server_key: Option<PeerPublicKey>,
    session_key: Option<SessionKey>,
    verified: bool,
}

impl ClientChannel {
    pub fn new(crypto: Arc<dyn CryptoProvider>, keys: Option<KeyPair>) -> Self {
        Self {
            crypto,
            keys,
            requested: false,
            server_key: None,
            session_key: None,
            verified: false,
        }
    }

    pub async fn generate(crypto: Arc<dyn CryptoProvider>) -> Self {
        let keys = generate_keys(&crypto).await;
        Self::new(crypto, keys)
    }

    pub fn is_secured(&self) -> bool {
        self.requested && self.verified && self.session_key.is_some()
    }

    pub fn has_server_key(&self) -> bool {
        self.server_key.is_some()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Resets the handshake and returns this client's `[public_key]` offer.
    pub fn begin(&mut self) -> Line {
        self.requested = true;
        self.verified = false;
        self.server_key = None;
        self.session_key = None;
        Line::PublicKey(public_offer(self.crypto.as_ref(), self.keys.as_ref()))
    }

    /// Stores the server's public key. It is kept for reference only.
    pub fn note_server_key(&mut self, offer: KeyOffer) {
        let KeyOffer::Key(hex) = offer else {
            debug!("server could not provide a public key");
            return;
        };
        match decode_hex(&hex).and_then(|der| self.crypto.import_public_key(&der)) {
            Ok(key) => self.server_key = Some(key),
            Err(err) => debug!(error = %err, "ignoring unreadable server public key"),
        }
    }

    /// Handles `[session_key]`: unwraps the key and answers with the
    /// `[signed_key]` proof, or `[signed_key]FAIL`.
    pub fn accept_session_key(&mut self, payload: &str) -> Option<Line> {
        if !self.requested {
            debug!("session key received without /secure, ignoring");
            return None;
        }
        if self.session_key.is_some() {
            debug!("session key already set for this handshake, ignoring");
            return None;
        }
        if payload.starts_with(FAIL) {
            debug!("server could not send a session key");
            return None;
        }
        let Some(keys) = self.keys.as_ref() else {
            return Some(Line::SignedKey(FAIL.to_string()));
        };

        let signed = decode_hex(payload)
            .and_then(|blob| self.crypto.unwrap_session_key(keys, &blob))
            .and_then(|key| {
                let signature = self.crypto.sign_session_key(keys, &key)?;
                Ok((key, signature))
            });

        match signed {
            Ok((key, signature)) => {
                self.session_key = Some(key);
                Some(Line::SignedKey(encode_hex(&signature)))
            }
            Err(err) => {
                warn!(error = %err, "could not accept session key");
                Some(Line::SignedKey(FAIL.to_string()))
            }
        }
    }

    /// Handles `[verify_key]`. The server's word is final.
    pub fn confirm(&mut self, ok: bool) -> bool {
        self.verified = ok && self.session_key.is_some();
        self.verified
    }

    /// Wire form of an outgoing line: hex ciphertext when secured, the text
    /// itself otherwise.
    pub fn seal(&self, text: &str) -> Result<String, CryptoError> {
        match self.session_key.as_ref().filter(|_| self.is_secured()) {
            Some(key) => seal_with(self.crypto.as_ref(), key, text),
            None => Ok(text.to_string()),
        }
    }

    /// Display form of a received non-control line. On a secured channel the
    /// result says whether the line really arrived encrypted.
    pub fn open_incoming(&self, raw: &str) -> String {
        let Some(key) = self.session_key.as_ref().filter(|_| self.is_secured()) else {
            return raw.to_string();
        };
        match open_with(self.crypto.as_ref(), key, raw) {
            Ok(plain) => format!("{plain}{ENCRYPTED_SUFFIX}"),
            Err(_) => format!("{raw}{UNENCRYPTED_SUFFIX}"),
        }
    }
}
