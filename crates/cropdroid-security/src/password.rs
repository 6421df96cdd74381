//! Salted password hashes for user records.
//!
//! Format: `hmac-sha256$<salt b64>$<digest b64>`.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use cropdroid_core::error::{CropDroidError, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

const SCHEME: &str = "hmac-sha256";

fn keyed(salt: &[u8], password: &str) -> Result<Hmac<Sha256>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(salt)
        .map_err(|e| CropDroidError::Security(format!("HMAC key rejected: {e}")))?;
    mac.update(password.as_bytes());
    Ok(mac)
}

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = keyed(&salt, password)?.finalize().into_bytes();
    Ok(format!(
        "{SCHEME}${}${}",
        BASE64.encode(salt),
        BASE64.encode(digest)
    ))
}

/// Constant-time check of `password` against a stored hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(SCHEME), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
    else {
        tracing::warn!("Unrecognised password hash format");
        return false;
    };
    let (Ok(salt), Ok(digest)) = (BASE64.decode(salt), BASE64.decode(digest)) else {
        return false;
    };
    match keyed(&salt, password) {
        Ok(mac) => mac.verify_slice(&digest).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let stored = hash_password("hunter2").unwrap();
        assert!(stored.starts_with("hmac-sha256$"));
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_password("x").unwrap(), hash_password("x").unwrap());
    }

    #[test]
    fn test_garbage_hash_rejected() {
        assert!(!verify_password("x", "plaintext"));
        assert!(!verify_password("x", "hmac-sha256$!!$??"));
    }
}
