//! Key agreement and password sealing for the login exchange.
//!
//! Each side contributes an ephemeral X25519 key. The shared secret is run
//! through HKDF-SHA256 to produce a ChaCha20-Poly1305 key that protects the
//! password inside the `Login` message.

use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, TransportError};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const LOGIN_KEY_INFO: &[u8] = b"remsh-login";

/// One side of the X25519 exchange.
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

impl KeyExchange {
    /// Fresh ephemeral key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half to send to the peer.
    pub fn public_key_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.public.as_bytes())
    }

    /// Derives the login key shared with the holder of `peer_public`.
    pub fn derive_login_key(&self, peer_public: &[u8]) -> Result<LoginKey> {
        let peer: [u8; KEY_SIZE] = peer_public.try_into().map_err(|_| TransportError::Security {
            reason: format!("public key must be {} bytes, got {}", KEY_SIZE, peer_public.len()),
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(TransportError::Security {
                reason: "peer sent a low-order public key".to_string(),
            });
        }

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hk.expand(LOGIN_KEY_INFO, &mut key)
            .map_err(|e| TransportError::Security {
                reason: format!("key derivation failed: {}", e),
            })?;
        Ok(LoginKey(key))
    }
}

/// Symmetric key protecting the login password.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct LoginKey([u8; KEY_SIZE]);

impl std::fmt::Debug for LoginKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoginKey(..)")
    }
}

impl LoginKey {
    /// Encrypts `plaintext`, returning nonce followed by ciphertext and tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Bytes> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| TransportError::Security {
                reason: "password encryption failed".to_string(),
            })?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(Bytes::from(sealed))
    }

    /// Reverses [`LoginKey::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(TransportError::Security {
                reason: "sealed password too short".to_string(),
            });
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| TransportError::Security {
                reason: "password decryption failed".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair() -> (LoginKey, LoginKey) {
        let client = KeyExchange::generate();
        let server = KeyExchange::generate();
        let client_key = client.derive_login_key(&server.public_key_bytes()).unwrap();
        let server_key = server.derive_login_key(&client.public_key_bytes()).unwrap();
        (client_key, server_key)
    }

    #[test]
    fn test_both_sides_derive_same_key() {
        let (client, server) = pair();
        let sealed = client.seal(b"secret").unwrap();
        assert_eq!(&server.open(&sealed).unwrap()[..], b"secret");
    }

    #[test]
    fn test_sealing_is_randomized() {
        let (client, _) = pair();
        assert_ne!(client.seal(b"secret").unwrap(), client.seal(b"secret").unwrap());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (client, server) = pair();
        let mut sealed = client.seal(b"secret").unwrap().to_vec();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(server.open(&sealed), Err(TransportError::Security { .. })));
        assert!(server.open(&sealed[..10]).is_err());
    }

    #[test]
    fn test_unrelated_key_rejected() {
        let (client, _) = pair();
        let (_, other) = pair();
        let sealed = client.seal(b"secret").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_bad_public_keys_rejected() {
        let exchange = KeyExchange::generate();
        assert!(exchange.derive_login_key(&[1u8; 31]).is_err());
        assert!(exchange.derive_login_key(&[0u8; 32]).is_err());
    }

    proptest! {
        #[test]
        fn prop_seal_open(password in proptest::collection::vec(any::<u8>(), 0..256)) {
            let (client, server) = pair();
            let sealed = client.seal(&password).unwrap();
            prop_assert_eq!(&server.open(&sealed).unwrap()[..], &password[..]);
        }
    }
}
