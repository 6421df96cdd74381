//! # CropDroid Security
//!
//! Sealing of configuration secrets (SMTP passwords, webhook tokens) and
//! salted password hashes for user records.

pub mod crypto;
pub mod password;

pub use crypto::{SecretKey, reveal, SECRET_KEY_ENV};
pub use password::{hash_password, verify_password};
