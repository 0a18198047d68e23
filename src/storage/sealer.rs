//! Encrypt-then-MAC container for the at-rest index blob.
//!
//! Blob layout: `version (1) ‖ iv (16) ‖ ciphertext ‖ tag (32)` with
//! AES-256-CBC for confidentiality and HMAC-SHA256 over everything before
//! the tag. The 64-byte master key (32 cipher + 32 MAC) lives in a
//! restricted key file created on first use.

use crate::error::{GateError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::io::Write;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const SEAL_VERSION: u8 = 1;
const IV_BYTES: usize = 16;
const TAG_BYTES: usize = 32;
const KEY_FILE_BYTES: usize = 64;

#[derive(Zeroize, ZeroizeOnDrop)]
#[cfg_attr(test, derive(Debug))]
pub struct BlobSealer {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
}

impl BlobSealer {
    /// Loads the master key file, generating one with owner-only
    /// permissions when absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let mut master = [0u8; KEY_FILE_BYTES];
        rand::thread_rng().fill(&mut master[..]);
        let encoded = base64::engine::general_purpose::STANDARD.encode(master);
        match write_new_restricted(path, encoded.as_bytes()) {
            Ok(()) => {}
            // Lost a creation race: the other writer's key is the real one.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Self::load(path),
            Err(e) => return Err(e.into()),
        }
        let sealer = Self::from_master_key(&master);
        master.zeroize();
        Ok(sealer)
    }

    fn load(path: &Path) -> Result<Self> {
        let encoded = std::fs::read_to_string(path)?;
        let mut master = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| GateError::Decryption(format!("Bad key file encoding: {}", e)))?;
        if master.len() != KEY_FILE_BYTES {
            master.zeroize();
            return Err(GateError::Decryption(format!(
                "Key file must hold {} bytes, got {}",
                KEY_FILE_BYTES,
                master.len()
            )));
        }
        let mut fixed = [0u8; KEY_FILE_BYTES];
        fixed.copy_from_slice(&master);
        master.zeroize();
        let sealer = Self::from_master_key(&fixed);
        fixed.zeroize();
        Ok(sealer)
    }

    pub fn from_master_key(master: &[u8; KEY_FILE_BYTES]) -> Self {
        let mut cipher_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        cipher_key.copy_from_slice(&master[..32]);
        mac_key.copy_from_slice(&master[32..]);
        Self { cipher_key, mac_key }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv: [u8; IV_BYTES] = rand::thread_rng().gen();
        let cipher = Aes256CbcEnc::new_from_slices(&self.cipher_key, &iv)
            .map_err(|e| GateError::Internal(format!("Cipher init failed: {}", e)))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut blob = Vec::with_capacity(1 + IV_BYTES + ciphertext.len() + TAG_BYTES);
        blob.push(SEAL_VERSION);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        let tag = self.tag(&blob)?;
        blob.extend_from_slice(&tag);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < 1 + IV_BYTES + TAG_BYTES {
            return Err(GateError::Decryption("Sealed blob too short".to_string()));
        }
        if blob[0] != SEAL_VERSION {
            return Err(GateError::Decryption(format!(
                "Unknown blob version {}",
                blob[0]
            )));
        }

        let body = &blob[..blob.len() - TAG_BYTES];
        let tag = &blob[blob.len() - TAG_BYTES..];
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| GateError::Internal(format!("MAC init failed: {}", e)))?;
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|_| GateError::Decryption("Blob authentication failed".to_string()))?;

        let iv = &body[1..1 + IV_BYTES];
        let ciphertext = &body[1 + IV_BYTES..];
        let cipher = Aes256CbcDec::new_from_slices(&self.cipher_key, iv)
            .map_err(|e| GateError::Internal(format!("Cipher init failed: {}", e)))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| GateError::Decryption("Invalid blob padding".to_string()))
    }

    fn tag(&self, body: &[u8]) -> Result<[u8; TAG_BYTES]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| GateError::Internal(format!("MAC init failed: {}", e)))?;
        mac.update(body);
        Ok(mac.finalize().into_bytes().into())
    }
}

fn write_new_restricted(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    Ok(())
}
