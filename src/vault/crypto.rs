//! Cryptographic primitives for at-rest secret encryption.
//!
//! Uses:
//! - ChaCha20-Poly1305 for authenticated encryption under the master key
//! - OS entropy for keys, nonces and client secrets

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Master key length in bytes (256 bits)
pub const KEY_LEN: usize = 32;
/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

const TOKEN_PREFIX: &str = "{enc:";
const TOKEN_SUFFIX: &str = "}";

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid master key: {0}")]
    InvalidKey(String),

    #[error("Cannot access key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encryption failed")]
    Encryption,

    #[error("Token integrity check failed - tampered, truncated or encrypted with another key")]
    Integrity,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Server-held symmetric key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Generate a new random key from OS entropy.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key from its base64 text form.
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let decoded = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        );
        if decoded.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                decoded.len()
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.0))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Read a base64 key file, creating it first when allowed.
    pub fn load_or_create(path: &Path, create_if_missing: bool) -> CryptoResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(CryptoError::InvalidKey(format!(
                    "'{}' does not exist",
                    path.display()
                )));
            }
            let key = Self::generate();
            key.save(path)?;
            info!(path = %path.display(), "Generated a new master encryption key");
            return Ok(key);
        }

        let contents = Zeroizing::new(fs::read_to_string(path)?);
        debug!(path = %path.display(), "Loaded master encryption key");
        Self::from_base64(&contents)
    }

    /// Write the key as base64 text, readable by the owner only.
    pub fn save(&self, path: &Path) -> CryptoResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(self.to_base64().as_bytes())?;
        Ok(())
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Encrypt into a self-describing envelope: nonce || ciphertext || tag.
pub fn encrypt_envelope(key: &MasterKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::Encryption)?;

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Open an envelope produced by [`encrypt_envelope`].
pub fn decrypt_envelope(key: &MasterKey, envelope: &[u8]) -> CryptoResult<Vec<u8>> {
    if envelope.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Integrity);
    }
    let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::Integrity)?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Integrity)
}

/// Wrap an envelope into the `{enc:...}` text form embeddable in config files.
pub fn encode_token(envelope: &[u8]) -> String {
    format!("{}{}{}", TOKEN_PREFIX, BASE64.encode(envelope), TOKEN_SUFFIX)
}

/// Extract the envelope bytes from a token. The bare base64 form is accepted too.
pub fn decode_token(token: &str) -> CryptoResult<Vec<u8>> {
    let payload = token
        .strip_prefix(TOKEN_PREFIX)
        .and_then(|rest| rest.strip_suffix(TOKEN_SUFFIX))
        .unwrap_or(token);
    BASE64.decode(payload).map_err(|_| CryptoError::Integrity)
}

/// Position of the next `{enc:...}` token in `text`, as (start, end) byte offsets.
pub(crate) fn find_token(text: &str, from: usize) -> Option<(usize, usize)> {
    let start = from + text[from..].find(TOKEN_PREFIX)?;
    let body = start + TOKEN_PREFIX.len();
    let end = body + text[body..].find(TOKEN_SUFFIX)? + TOKEN_SUFFIX.len();
    Some((start, end))
}

/// Body of a `{enc:...}` match without the delimiters.
pub(crate) fn token_body(token: &str) -> &str {
    &token[TOKEN_PREFIX.len()..token.len() - TOKEN_SUFFIX.len()]
}
