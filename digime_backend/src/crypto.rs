//! At-rest encryption for message bodies.
//!
//! The key is SHA-256 of the operator secret, so the same secret always opens
//! the same database. Each ciphertext carries its own random nonce and is
//! stored as base64(nonce || ciphertext).

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{DecryptionFault, StorageFault};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct MessageCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageCipher(..)")
    }
}

impl MessageCipher {
    /// Derive the cipher from an operator secret. An empty secret is refused.
    pub fn from_secret(secret: &str) -> Result<Self, StorageFault> {
        if secret.trim().is_empty() {
            return Err(StorageFault::MissingSecret);
        }
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| StorageFault::Encryption)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, StorageFault> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| StorageFault::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, DecryptionFault> {
        let sealed = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|_| DecryptionFault::Encoding)?;
        if sealed.len() <= NONCE_LEN {
            return Err(DecryptionFault::Truncated);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| DecryptionFault::Authentication)?;
        String::from_utf8(plaintext).map_err(|_| DecryptionFault::Utf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_text() {
        let cipher = MessageCipher::from_secret("correct horse").expect("cipher");
        for text in ["", "hi", "how are you?", "emoji 🎉 and ünïcode", "line\nbreak"] {
            let sealed = cipher.encrypt(text).expect("encrypt");
            assert_eq!(cipher.decrypt(&sealed).expect("decrypt"), text);
        }
    }

    #[test]
    fn ciphertext_differs_per_call_and_hides_plaintext() {
        let cipher = MessageCipher::from_secret("correct horse").expect("cipher");
        let a = cipher.encrypt("hello there").expect("encrypt");
        let b = cipher.encrypt("hello there").expect("encrypt");
        assert_ne!(a, b);
        assert!(!a.contains("hello"));
    }

    #[test]
    fn same_secret_derives_same_key() {
        let writer = MessageCipher::from_secret("shared").expect("cipher");
        let reader = MessageCipher::from_secret("shared").expect("cipher");
        let sealed = writer.encrypt("persisted").expect("encrypt");
        assert_eq!(reader.decrypt(&sealed).expect("decrypt"), "persisted");
    }

    #[test]
    fn wrong_key_and_garbage_are_reported() {
        let writer = MessageCipher::from_secret("one").expect("cipher");
        let reader = MessageCipher::from_secret("two").expect("cipher");
        let sealed = writer.encrypt("secret").expect("encrypt");

        assert_eq!(reader.decrypt(&sealed), Err(DecryptionFault::Authentication));
        assert_eq!(reader.decrypt("%%%"), Err(DecryptionFault::Encoding));
        assert_eq!(reader.decrypt("AAAA"), Err(DecryptionFault::Truncated));
    }

    #[test]
    fn empty_secret_is_refused() {
        assert!(matches!(
            MessageCipher::from_secret("   "),
            Err(StorageFault::MissingSecret)
        ));
    }
}
