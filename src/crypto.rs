//! Handshake and channel cryptography.
//!
//! One RSA-2048 keypair per process wraps the per-session channel keys;
//! post-handshake traffic is AES-256-CBC with PKCS#7 padding and a fresh
//! IV per message.

use crate::error::{GateError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::Rng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const CHANNEL_KEY_BYTES: usize = 32;
pub const IV_BYTES: usize = 16;
const RSA_BITS: usize = 2048;

/// Encrypted message envelope: ciphertext plus its per-message IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub data: Vec<u8>,
    pub iv: [u8; IV_BYTES],
}

/// Process-wide RSA keypair. Generated once at startup, never persisted.
pub struct ServerKeypair {
    private: RsaPrivateKey,
    public_pem: String,
}

impl ServerKeypair {
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| GateError::Internal(format!("RSA keygen failed: {}", e)))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| GateError::Internal(format!("Public key encoding failed: {}", e)))?;
        Ok(Self { private, public_pem })
    }

    /// SPKI PEM, pushed to every client on connect.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Recovers a client's channel key from its OAEP-wrapped blob.
    pub fn unwrap_channel_key(&self, wrapped: &[u8]) -> Result<ChannelKey> {
        let key = self
            .private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| GateError::Decryption("Key blob decryption failed".to_string()))?;
        ChannelKey::try_from_slice(&key)
    }
}

/// Wraps a channel key with a server's public key. Client half of the
/// handshake.
pub fn wrap_channel_key(public_key_pem: &str, key: &ChannelKey) -> Result<Vec<u8>> {
    let public = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| GateError::Decryption(format!("Bad public key: {}", e)))?;
    let mut rng = rand::thread_rng();
    public
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &key.0)
        .map_err(|e| GateError::Internal(format!("Key wrap failed: {}", e)))
}

/// 256-bit symmetric channel key. Zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
#[cfg_attr(test, derive(Debug))]
pub struct ChannelKey([u8; CHANNEL_KEY_BYTES]);

impl ChannelKey {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn from_bytes(bytes: [u8; CHANNEL_KEY_BYTES]) -> Self {
        Self(bytes)
    }

    fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; CHANNEL_KEY_BYTES] = bytes.try_into().map_err(|_| {
            GateError::Decryption(format!(
                "Channel key must be {} bytes, got {}",
                CHANNEL_KEY_BYTES,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Encrypts a payload under a fresh random IV.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope> {
        let iv: [u8; IV_BYTES] = rand::thread_rng().gen();
        let cipher = Aes256CbcEnc::new_from_slices(&self.0, &iv)
            .map_err(|e| GateError::Internal(format!("Cipher init failed: {}", e)))?;
        let data = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        Ok(Envelope { data, iv })
    }

    /// Decrypts an envelope and strips padding.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if envelope.data.is_empty() || envelope.data.len() % IV_BYTES != 0 {
            return Err(GateError::Decryption(
                "Ciphertext length is not a whole number of blocks".to_string(),
            ));
        }
        let cipher = Aes256CbcDec::new_from_slices(&self.0, &envelope.iv)
            .map_err(|e| GateError::Internal(format!("Cipher init failed: {}", e)))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&envelope.data)
            .map_err(|_| GateError::Decryption("Invalid padding".to_string()))
    }
}
