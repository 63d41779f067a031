//! Body cipher: XChaCha20-Poly1305 with a random 24-byte nonce prefixed to
//! every sealed body.

use crate::error::{constants, ProtocolError, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

pub const NONCE_LEN: usize = 24;

pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce)
            .map_err(|_| ProtocolError::Custom(constants::ERR_RANDOM.into()))?;
        Ok(nonce)
    }

    pub fn encrypt(&self, data: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), data)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }

    /// Encrypt under a fresh nonce and return `nonce || ciphertext`.
    pub fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::generate_nonce()?;
        let ciphertext = self.encrypt(data, &nonce)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        self.decrypt(ciphertext, &nonce)
    }
}

impl std::fmt::Debug for Crypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Crypto(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let crypto = Crypto::new(&[7u8; 32]);
        let sealed = crypto.seal(b"payload").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 7 + 16);
        assert_eq!(crypto.open(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = Crypto::new(&[1u8; 32]).seal(b"secret").unwrap();
        assert!(matches!(
            Crypto::new(&[2u8; 32]).open(&sealed),
            Err(ProtocolError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_truncated_input_fails() {
        let crypto = Crypto::new(&[1u8; 32]);
        assert!(crypto.open(&[0u8; 10]).is_err());
    }
}
