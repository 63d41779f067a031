//! RSA-wrapped symmetric key exchange.
//!
//! The listening side owns an RSA key pair and announces its public half in
//! [`Hello`]. The initiator generates a fresh 32-byte session key, wraps it
//! with RSA-OAEP (SHA-256) and returns it in [`KeyExchange`]. The listener
//! unwraps it and confirms with [`LineSecured`] carrying the SHA-256 digest
//! of what it unwrapped; the initiator accepts the line only when that digest
//! matches its own key.
//!
//! The step functions here are pure: they take the received body and return
//! the body to send plus whatever state the caller has to keep. The connection
//! decides what a failure means (it kills the line).

use crate::core::packet::ReplyCode;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::messages::{Hello, KeyExchange, LineSecured};
use crate::utils::crypto::Crypto;
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[allow(unused_imports)]
use tracing::{debug, instrument, warn};

/// Symmetric key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// The symmetric key protecting a line. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Generate a key from the OS random source.
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; SESSION_KEY_LEN];
        getrandom::fill(&mut key).map_err(|_| ProtocolError::Custom(constants::ERR_RANDOM.into()))?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    pub fn digest(&self) -> [u8; 32] {
        hash_key(&self.0)
    }

    /// Body cipher keyed with this session key.
    pub fn cipher(&self) -> Crypto {
        Crypto::new(&self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

fn hash_key(key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.finalize().into()
}

/// RSA key pair used to receive wrapped session keys.
///
/// Generation is slow; listeners create one identity and share it across
/// every connection they accept.
pub struct RsaIdentity {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl RsaIdentity {
    #[instrument]
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|_| ProtocolError::HandshakeError(constants::ERR_RSA_KEYGEN.into()))?;
        Self::from_private(private)
    }

    pub fn from_private(private: RsaPrivateKey) -> Result<Self> {
        let public_der = RsaPublicKey::from(&private)
            .to_pkcs1_der()
            .map_err(|_| ProtocolError::HandshakeError(constants::ERR_RSA_ENCODE.into()))?
            .as_bytes()
            .to_vec();
        debug!(public_key_len = public_der.len(), "RSA identity ready");
        Ok(Self {
            private,
            public_der,
        })
    }

    /// PKCS#1 DER encoding of the public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Recover a session key wrapped for this identity.
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<SessionKey> {
        let mut plain = self
            .private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| ProtocolError::HandshakeError(constants::ERR_RSA_UNWRAP.into()))?;

        if plain.len() != SESSION_KEY_LEN {
            plain.zeroize();
            return Err(ProtocolError::HandshakeError(constants::ERR_KEY_LENGTH.into()));
        }

        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&plain);
        plain.zeroize();
        Ok(SessionKey(key))
    }
}

impl fmt::Debug for RsaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaIdentity")
            .field("public_key_len", &self.public_der.len())
            .finish_non_exhaustive()
    }
}

/// Decode a peer's PKCS#1 DER public key.
pub fn decode_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(der)
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_RSA_DECODE.into()))
}

/// Wrap `key` for the holder of `public`.
pub fn wrap_key(public: &RsaPublicKey, key: &SessionKey) -> Result<Vec<u8>> {
    public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_RSA_WRAP.into()))
}

/// Listener step 1: the greeting carrying the listener's public key.
pub fn listener_hello(identity: &RsaIdentity, connection_id: u64) -> Hello {
    Hello {
        connection_id,
        public_key: identity.public_key_der().to_vec(),
    }
}

/// Initiator step: answer a [`Hello`] with a freshly generated, wrapped key.
///
/// `own_public_key` is sent along for the listener's records and may be empty
/// when the initiator has no RSA identity of its own.
///
/// The returned key must be kept until [`initiator_verify`] succeeds.
#[instrument(skip(hello, own_public_key), fields(connection_id = hello.connection_id))]
pub fn initiator_key_exchange(hello: &Hello, own_public_key: &[u8]) -> Result<(SessionKey, KeyExchange)> {
    let listener_key = decode_public_key(&hello.public_key)?;
    let key = SessionKey::generate()?;
    let encrypted_key = wrap_key(&listener_key, &key)?;

    debug!("Initiator wrapped session key");

    Ok((
        key,
        KeyExchange {
            encrypted_key,
            public_key: own_public_key.to_vec(),
        },
    ))
}

/// Listener step 2: unwrap the initiator's key and build the confirmation.
///
/// A key that cannot be unwrapped still yields a [`LineSecured`] with a
/// failure result so the initiator learns why the line is going down; the
/// error is returned alongside for the caller to act on.
#[instrument(skip(identity, exchange))]
pub fn listener_accept_key(
    identity: &RsaIdentity,
    exchange: &KeyExchange,
) -> std::result::Result<(SessionKey, LineSecured), (ProtocolError, LineSecured)> {
    match identity.unwrap_key(&exchange.encrypted_key) {
        Ok(key) => {
            let secured = LineSecured {
                result: ReplyCode::Ok,
                key_digest: key.digest(),
            };
            debug!("Listener unwrapped session key");
            Ok((key, secured))
        }
        Err(e) => {
            warn!(error = %e, "Key exchange rejected");
            Err((
                e,
                LineSecured {
                    result: ReplyCode::Failure,
                    key_digest: [0u8; 32],
                },
            ))
        }
    }
}

/// Initiator step 3: accept the line only if the listener confirms the exact
/// key we sent.
#[instrument(skip(pending, secured))]
pub fn initiator_verify(pending: &SessionKey, secured: &LineSecured) -> Result<()> {
    if !secured.result.is_ok() {
        return Err(ProtocolError::HandshakeError(constants::ERR_LINE_REJECTED.into()));
    }

    if secured.key_digest != pending.digest() {
        warn!("Line secured digest does not match the exchanged key");
        return Err(ProtocolError::HandshakeError(constants::ERR_KEY_MISMATCH.into()));
    }

    debug!("Initiator verified line secured confirmation");
    Ok(())
}
