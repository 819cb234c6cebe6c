//! Shared-password login.
//!
//! The server sends a random salt and nonce; the client proves it knows
//! the password by answering with `HMAC-SHA256(password, salt || nonce)`.
//! The password itself never crosses the wire, and a fresh nonce per
//! attempt means a captured answer can't be replayed.

use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::{CredentialProvider, LoginValidator, Properties};

type HmacSha256 = Hmac<Sha256>;

const SALT_KEY: &str = "salt";
const NONCE_KEY: &str = "nonce";
const DIGEST_KEY: &str = "digest";

/// Rejection reason for a wrong or missing answer.
pub const INVALID_PASSWORD: &str = "Invalid password";

fn random_hex() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn digest(password: &str, salt: &str, nonce: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(password.as_bytes()).ok()?;
    mac.update(salt.as_bytes());
    mac.update(nonce.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// A [`LoginValidator`] that admits anyone who knows the game password.
pub struct PasswordValidator {
    password: String,
}

impl PasswordValidator {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl LoginValidator for PasswordValidator {
    fn challenge(&self, _username: &str, _remote: SocketAddr) -> Properties {
        let mut challenge = Properties::new();
        challenge.insert(SALT_KEY.to_string(), random_hex());
        challenge.insert(NONCE_KEY.to_string(), random_hex());
        challenge
    }

    fn verify(
        &self,
        challenge: &Properties,
        response: &Properties,
        username: &str,
        _hardware_address: Option<&str>,
        remote: SocketAddr,
    ) -> Result<(), String> {
        let expected = match (challenge.get(SALT_KEY), challenge.get(NONCE_KEY)) {
            (Some(salt), Some(nonce)) => digest(&self.password, salt, nonce),
            _ => None,
        };
        let (Some(expected), Some(answer)) = (expected, response.get(DIGEST_KEY)) else {
            return Err(INVALID_PASSWORD.to_string());
        };

        if subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), answer.as_bytes()).into() {
            Ok(())
        } else {
            tracing::debug!(username, %remote, "wrong game password");
            Err(INVALID_PASSWORD.to_string())
        }
    }
}

/// The client half of [`PasswordValidator`].
pub struct PasswordCredentials {
    password: String,
}

impl PasswordCredentials {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl CredentialProvider for PasswordCredentials {
    fn respond(&self, challenge: &Properties) -> Option<Properties> {
        let salt = challenge.get(SALT_KEY)?;
        let nonce = challenge.get(NONCE_KEY)?;
        let mut response = Properties::new();
        response.insert(DIGEST_KEY.to_string(), digest(&self.password, salt, nonce)?);
        Some(response)
    }
}
