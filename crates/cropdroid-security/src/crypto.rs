//! Sealed configuration values.
//!
//! A sealed value is `enc:` followed by base64 of
//! `AES-256(PKCS7(plaintext)) || HMAC-SHA256(ciphertext)`.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use cropdroid_core::error::{CropDroidError, Result};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Environment variable holding the sealing passphrase.
pub const SECRET_KEY_ENV: &str = "CROPDROID_SECRET_KEY";

const SEALED_PREFIX: &str = "enc:";
const BLOCK: usize = 16;
const TAG_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Cipher and MAC keys derived from one passphrase.
#[derive(Clone)]
pub struct SecretKey {
    cipher: [u8; 32],
    mac: [u8; 32],
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl SecretKey {
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            cipher: derive(passphrase, "cipher"),
            mac: derive(passphrase, "mac"),
        }
    }

    /// Key from `CROPDROID_SECRET_KEY`, if set and non-empty.
    pub fn from_env() -> Option<Self> {
        std::env::var(SECRET_KEY_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| Self::from_passphrase(&v))
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut payload = encrypt_aes256(plaintext.as_bytes(), &self.cipher);
        let tag = self.mac_for(&payload)?.finalize().into_bytes();
        payload.extend_from_slice(&tag);
        Ok(format!("{SEALED_PREFIX}{}", BASE64.encode(&payload)))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let encoded = sealed.strip_prefix(SEALED_PREFIX).unwrap_or(sealed);
        let payload = BASE64
            .decode(encoded.trim())
            .map_err(|e| CropDroidError::Security(format!("Base64 decode failed: {e}")))?;
        if payload.len() < TAG_LEN + BLOCK || (payload.len() - TAG_LEN) % BLOCK != 0 {
            return Err(CropDroidError::Security("sealed value has bad length".into()));
        }
        let (ciphertext, tag) = payload.split_at(payload.len() - TAG_LEN);

        self.mac_for(ciphertext)?
            .verify_slice(tag)
            .map_err(|_| CropDroidError::Security("sealed value failed authentication".into()))?;

        let plain = decrypt_aes256(ciphertext, &self.cipher)?;
        String::from_utf8(plain)
            .map_err(|e| CropDroidError::Security(format!("Decryption produced invalid UTF-8: {e}")))
    }

    fn mac_for(&self, ciphertext: &[u8]) -> Result<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac)
            .map_err(|e| CropDroidError::Security(format!("HMAC key rejected: {e}")))?;
        mac.update(ciphertext);
        Ok(mac)
    }
}

/// Unwrap `enc:` values; plain values pass through.
pub fn reveal(value: &str, key: Option<&SecretKey>) -> Result<String> {
    if !value.starts_with(SEALED_PREFIX) {
        return Ok(value.to_string());
    }
    match key {
        Some(key) => key.open(value),
        None => Err(CropDroidError::Security(format!(
            "sealed value found but {SECRET_KEY_ENV} is not set"
        ))),
    }
}

fn derive(passphrase: &str, purpose: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(format!("cropdroid::{purpose}::{passphrase}").as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// AES-256 block encrypt with PKCS7 padding.
fn encrypt_aes256(data: &[u8], key: &[u8; 32]) -> Vec<u8> {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let padding_len = BLOCK - (data.len() % BLOCK);
    let mut padded = data.to_vec();
    padded.extend(std::iter::repeat_n(padding_len as u8, padding_len));

    let mut out = Vec::with_capacity(padded.len());
    for chunk in padded.chunks(BLOCK) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        out.extend_from_slice(&block);
    }
    out
}

/// Inverse of [`encrypt_aes256`]. Rejects malformed padding.
fn decrypt_aes256(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(BLOCK) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        out.extend_from_slice(&block);
    }

    let pad = out.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > BLOCK || pad > out.len() {
        return Err(CropDroidError::Security("bad padding".into()));
    }
    if !out[out.len() - pad..].iter().all(|&b| b as usize == pad) {
        return Err(CropDroidError::Security("bad padding".into()));
    }
    out.truncate(out.len() - pad);
    Ok(out)
}
