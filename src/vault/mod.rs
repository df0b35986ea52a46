//! Secret vault: client secret issuance and at-rest value encryption.
//!
//! ## Security Model
//!
//! - A single 256-bit master key is loaded (or generated) at startup and is
//!   immutable for the life of the process
//! - Values are sealed with ChaCha20-Poly1305; tokens carry their own nonce
//!   and tag so decryption needs nothing but the key
//! - Any decryption failure is reported as [`CryptoError::Integrity`], never
//!   as an empty value
//! - Client secrets are 256 bits of OS entropy; only an HMAC verifier bound
//!   to the client id is ever stored
//!
//! ## Usage
//!
//! ```ignore
//! let vault = Vault::from_config(&config.vault)?;
//!
//! let token = vault.encrypt(b"s3cr3t")?; // "{enc:...}"
//! assert_eq!(vault.decrypt(&token)?, b"s3cr3t");
//!
//! let served = vault.detokenize("password: {enc:...}")?;
//! ```

pub mod crypto;
pub mod secrets;

pub use crypto::{CryptoError, CryptoResult, MasterKey};
pub use secrets::{ClientSecret, SECRET_LEN};

use crate::config::VaultConfig;
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

/// Holder of the master key. Shared read-only, no locking needed.
#[derive(Debug)]
pub struct Vault {
    key: MasterKey,
}

/// Shared vault handle for use across the application.
pub type SharedVault = Arc<Vault>;

impl Vault {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    /// Resolve the master key from configuration: inline key first, then key file.
    pub fn from_config(config: &VaultConfig) -> CryptoResult<Self> {
        let key = match config.master_key.as_deref().filter(|k| !k.trim().is_empty()) {
            Some(encoded) => {
                info!("Using master key from configuration");
                MasterKey::from_base64(encoded)?
            }
            None => MasterKey::load_or_create(&config.key_file, config.create_key_if_missing)?,
        };
        Ok(Self::new(key))
    }

    /// Mint a new client secret.
    pub fn generate_secret(&self) -> ClientSecret {
        ClientSecret::generate()
    }

    /// Verifier to persist in place of the plaintext secret.
    pub fn secret_verifier(&self, client_id: &str, secret: &str) -> String {
        secrets::secret_verifier(&self.key, client_id, secret)
    }

    pub fn verify_secret(&self, client_id: &str, secret: &str, verifier: &str) -> bool {
        secrets::verify_secret(&self.key, client_id, secret, verifier)
    }

    /// HMAC key for signing access tokens, derived from the master key.
    pub fn token_signing_key(&self) -> Zeroizing<Vec<u8>> {
        secrets::derive_key(&self.key, "access-token")
    }

    /// Seal a value into an `{enc:...}` token.
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<String> {
        let envelope = crypto::encrypt_envelope(&self.key, plaintext)?;
        Ok(crypto::encode_token(&envelope))
    }

    /// Open a token produced by [`Vault::encrypt`].
    pub fn decrypt(&self, token: &str) -> CryptoResult<Vec<u8>> {
        let envelope = crypto::decode_token(token)?;
        crypto::decrypt_envelope(&self.key, &envelope)
    }

    pub fn decrypt_to_string(&self, token: &str) -> CryptoResult<String> {
        String::from_utf8(self.decrypt(token)?).map_err(|_| CryptoError::Integrity)
    }

    /// Replace every `{enc:...}` token in `text` with its plaintext.
    ///
    /// Fails on the first token that does not decrypt; serving the raw token
    /// or an empty value would hand out wrong configuration.
    pub fn detokenize(&self, text: &str) -> CryptoResult<String> {
        let mut output = String::with_capacity(text.len());
        let mut cursor = 0;
        while let Some((start, end)) = crypto::find_token(text, cursor) {
            output.push_str(&text[cursor..start]);
            output.push_str(&self.decrypt_to_string(&text[start..end])?);
            cursor = end;
        }
        output.push_str(&text[cursor..]);
        Ok(output)
    }

    /// Replace every `{enc:<plaintext>}` placeholder in `text` with a token.
    ///
    /// Placeholders that already hold a token this vault can open are kept as is.
    pub fn tokenize(&self, text: &str) -> CryptoResult<String> {
        let mut output = String::with_capacity(text.len() * 2);
        let mut cursor = 0;
        while let Some((start, end)) = crypto::find_token(text, cursor) {
            output.push_str(&text[cursor..start]);
            let placeholder = &text[start..end];
            if self.decrypt(placeholder).is_ok() {
                output.push_str(placeholder);
            } else {
                output.push_str(&self.encrypt(crypto::token_body(placeholder).as_bytes())?);
            }
            cursor = end;
        }
        output.push_str(&text[cursor..]);
        Ok(output)
    }
}
