//! The standard MySQL authentication plugins.
//!
//! Scramble algorithms:
//!
//! `mysql_native_password`:
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! `caching_sha2_password` fast path:
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! The caching_sha2 full path needs a secure channel: the password
//! goes out in clear over TLS, or RSA-encrypted against the server's
//! public key over cleartext.

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Status bytes of the caching_sha2_password sub-protocol.
mod caching_sha2 {
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// One authentication mechanism's view of the login round-trips.
///
/// The orchestrator calls [`scramble`](Self::scramble) once for the
/// handshake response (and again after an auth-switch), then feeds
/// every auth-more-data payload to [`next_payload`](Self::next_payload)
/// until the server settles on OK or ERR.
pub trait AuthPlugin: Send {
    fn name(&self) -> &'static str;

    /// The client proof derived from the server's challenge.
    fn scramble(
        &mut self,
        challenge: &[u8],
        password: Option<&str>,
        channel_secure: bool,
    ) -> Result<Vec<u8>>;

    /// The next client payload for an extra server round-trip, or
    /// `None` when the plugin has nothing to add and the terminal
    /// packet should simply be awaited.
    fn next_payload(
        &mut self,
        data: &[u8],
        password: Option<&str>,
        channel_secure: bool,
    ) -> Result<Option<Vec<u8>>>;
}

/// Looks a plugin up by the name the server announced.
pub fn resolve_plugin(name: &str) -> Option<Box<dyn AuthPlugin>> {
    match name {
        plugins::MYSQL_NATIVE_PASSWORD => Some(Box::new(NativePassword)),
        plugins::CACHING_SHA2_PASSWORD => Some(Box::new(CachingSha2Password::default())),
        plugins::MYSQL_CLEAR_PASSWORD => Some(Box::new(ClearPassword)),
        _ => None,
    }
}

/// SHA1-based plugin, the default below MySQL 8.0.
struct NativePassword;

impl AuthPlugin for NativePassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_NATIVE_PASSWORD
    }

    fn scramble(
        &mut self,
        challenge: &[u8],
        password: Option<&str>,
        _channel_secure: bool,
    ) -> Result<Vec<u8>> {
        Ok(native_scramble(password.unwrap_or(""), challenge))
    }

    fn next_payload(
        &mut self,
        _data: &[u8],
        _password: Option<&str>,
        _channel_secure: bool,
    ) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// SHA256-based plugin, the default from MySQL 8.0.
#[derive(Default)]
struct CachingSha2Password {
    /// Requested the server's RSA key; the next payload is its PEM.
    awaiting_public_key: bool,
    challenge: Vec<u8>,
}

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &'static str {
        plugins::CACHING_SHA2_PASSWORD
    }

    fn scramble(
        &mut self,
        challenge: &[u8],
        password: Option<&str>,
        _channel_secure: bool,
    ) -> Result<Vec<u8>> {
        self.challenge = challenge.to_vec();
        Ok(sha256_scramble(password.unwrap_or(""), challenge))
    }

    fn next_payload(
        &mut self,
        data: &[u8],
        password: Option<&str>,
        channel_secure: bool,
    ) -> Result<Option<Vec<u8>>> {
        if self.awaiting_public_key {
            self.awaiting_public_key = false;
            let encrypted =
                rsa_encrypt_password(password.unwrap_or(""), &self.challenge, data)?;
            return Ok(Some(encrypted));
        }

        match data.first().copied() {
            Some(caching_sha2::FAST_AUTH_SUCCESS) => Ok(None),
            Some(caching_sha2::PERFORM_FULL_AUTH) => {
                if channel_secure {
                    let mut clear = password.unwrap_or("").as_bytes().to_vec();
                    clear.push(0);
                    Ok(Some(clear))
                } else {
                    self.awaiting_public_key = true;
                    Ok(Some(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
                }
            }
            _ => Err(Error::ProtocolViolation(
                "unexpected caching_sha2 auth data".into(),
            )),
        }
    }
}

/// Sends the password as-is; only usable on an encrypted channel.
struct ClearPassword;

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_CLEAR_PASSWORD
    }

    fn scramble(
        &mut self,
        _challenge: &[u8],
        password: Option<&str>,
        channel_secure: bool,
    ) -> Result<Vec<u8>> {
        if !channel_secure {
            return Err(Error::auth_impossible(
                "mysql_clear_password requires an encrypted connection",
            ));
        }
        let mut clear = password.unwrap_or("").as_bytes().to_vec();
        clear.push(0);
        Ok(clear)
    }

    fn next_payload(
        &mut self,
        _data: &[u8],
        _password: Option<&str>,
        _channel_secure: bool,
    ) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`; empty for
/// an empty password.
pub(crate) fn native_scramble(password: &str, challenge: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let seed = if challenge.len() > 20 {
        &challenge[..20]
    } else {
        challenge
    };

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// `XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))`;
/// empty for an empty password.
pub(crate) fn sha256_scramble(password: &str, challenge: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // Servers append a NUL to the 20-byte seed; it is not part of it.
    let seed = if challenge.len() == 21 && challenge.last() == Some(&0) {
        &challenge[..20]
    } else {
        challenge
    };

    let hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash_hash: [u8; 32] = Sha256::digest(hash).into();

    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    hash.iter().zip(scramble.iter()).map(|(a, b)| a ^ b).collect()
}

/// RSA-encrypts `password XOR seed` against the server's public key,
/// with the OAEP padding MySQL 8.0.5+ expects.
pub(crate) fn rsa_encrypt_password(
    password: &str,
    challenge: &[u8],
    public_key_pem: &[u8],
) -> Result<Vec<u8>> {
    if challenge.is_empty() {
        return Err(Error::auth_impossible("empty auth challenge"));
    }

    let mut clear = password.as_bytes().to_vec();
    clear.push(0);
    for (i, byte) in clear.iter_mut().enumerate() {
        *byte ^= challenge[i % challenge.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| Error::auth_impossible(format!("public key is not valid PEM: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::auth_impossible(format!("cannot parse RSA public key: {e}")))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &clear)
        .map_err(|e| Error::auth_impossible(format!("RSA encryption failed: {e}")))
}
