/*!
 * Token Encryption
 *
 * Calendar tokens are encrypted at rest with AES-256-GCM. The key is derived
 * once from the service secret via SHA-256 and the cipher is process-wide:
 * initialize it during startup, then encrypt/decrypt through the global
 * handle. A fresh random nonce is generated per encryption and stored in
 * front of the ciphertext.
 */

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};

use crate::calendar::error::{CalendarError, CalendarResult};

const NONCE_LEN: usize = 12;

static GLOBAL_CIPHER: OnceCell<TokenCipher> = OnceCell::new();

/// AES-256-GCM cipher over base64 envelopes `nonce || ciphertext`
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Derive the key from the service secret
    pub fn new(secret: &str) -> CalendarResult<Self> {
        if secret.is_empty() {
            return Err(CalendarError::Configuration {
                message: "token encryption secret must not be empty".to_string(),
            });
        }
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> CalendarResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CalendarError::Crypto {
                message: "token encryption failed".to_string(),
            })?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(envelope))
    }

    pub fn decrypt(&self, encoded: &str) -> CalendarResult<String> {
        let envelope = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CalendarError::Crypto {
                message: "token envelope is not valid base64".to_string(),
            })?;
        if envelope.len() <= NONCE_LEN {
            return Err(CalendarError::Crypto {
                message: "token envelope too short".to_string(),
            });
        }

        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CalendarError::Crypto {
                message: "token decryption failed".to_string(),
            })?;
        String::from_utf8(plaintext).map_err(|_| CalendarError::Crypto {
            message: "decrypted token is not valid UTF-8".to_string(),
        })
    }
}

/// Initialize the process-wide cipher; later calls with the same process are
/// no-ops so tests and multi-engine setups do not fight over it
pub fn init_global_cipher(secret: &str) -> CalendarResult<()> {
    if GLOBAL_CIPHER.get().is_some() {
        return Ok(());
    }
    let cipher = TokenCipher::new(secret)?;
    let _ = GLOBAL_CIPHER.set(cipher);
    Ok(())
}

pub fn global_cipher() -> CalendarResult<&'static TokenCipher> {
    GLOBAL_CIPHER.get().ok_or(CalendarError::Crypto {
        message: "token cipher not initialized".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cipher = TokenCipher::new("service-secret").unwrap();
        let token = "ya29.a0AfH6SMB-example-token";
        let encrypted = cipher.encrypt(token).unwrap();
        assert_ne!(encrypted, token);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), token);
    }

    #[test]
    fn test_nonces_differ_per_encryption() {
        let cipher = TokenCipher::new("service-secret").unwrap();
        let a = cipher.encrypt("token").unwrap();
        let b = cipher.encrypt("token").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = TokenCipher::new("secret-a").unwrap();
        let other = TokenCipher::new("secret-b").unwrap();
        let encrypted = cipher.encrypt("token").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let cipher = TokenCipher::new("service-secret").unwrap();
        let encrypted = cipher.encrypt("token").unwrap();
        let mut bytes = general_purpose::STANDARD.decode(&encrypted).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(bytes);
        assert!(cipher.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(TokenCipher::new("").is_err());
    }
}
