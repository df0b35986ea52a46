//! Client secret issuance and verification.
//!
//! Plaintext secrets exist only long enough to be returned to the caller and
//! are zeroized on drop. The store keeps an HMAC verifier bound to the client id.

use super::crypto::MasterKey;
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine,
};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

/// Entropy of a generated client secret in bytes (256 bits)
pub const SECRET_BYTES: usize = 32;

/// Length of the encoded secret (URL-safe base64, no padding)
pub const SECRET_LEN: usize = 43;

/// A freshly minted client secret.
pub struct ClientSecret(String);

impl ClientSecret {
    /// Draw a new secret from OS entropy.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let encoded = URL_SAFE_NO_PAD.encode(bytes);
        bytes.zeroize();
        Self(encoded)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Hand the plaintext over, e.g. to serialize it into a response.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }
}

impl Drop for ClientSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientSecret(<redacted>)")
    }
}

fn keyed_mac(key: &MasterKey, client_id: &str, secret: &str) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(client_id.as_bytes());
    mac.update(&[0]);
    mac.update(secret.as_bytes());
    mac
}

/// Derive a purpose-bound subkey so the master key itself never signs anything.
pub fn derive_key(key: &MasterKey, purpose: &str) -> Zeroizing<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(b"configserver/");
    mac.update(purpose.as_bytes());
    Zeroizing::new(mac.finalize().into_bytes().to_vec())
}

/// Derive the stored verifier for a client secret.
pub fn secret_verifier(key: &MasterKey, client_id: &str, secret: &str) -> String {
    BASE64.encode(keyed_mac(key, client_id, secret).finalize().into_bytes())
}

/// Check a presented secret against a stored verifier in constant time.
pub fn verify_secret(key: &MasterKey, client_id: &str, secret: &str, verifier: &str) -> bool {
    let Ok(expected) = BASE64.decode(verifier) else {
        return false;
    };
    keyed_mac(key, client_id, secret)
        .verify_slice(&expected)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_secret_shape() {
        let secret = ClientSecret::generate();
        assert_eq!(secret.expose().len(), SECRET_LEN);
        let decoded = URL_SAFE_NO_PAD.decode(secret.expose()).unwrap();
        assert_eq!(decoded.len(), SECRET_BYTES);
    }

    #[test]
    fn test_secrets_are_unique() {
        let secrets: HashSet<String> = (0..1000)
            .map(|_| ClientSecret::generate().into_inner())
            .collect();
        assert_eq!(secrets.len(), 1000);
    }

    #[test]
    fn test_verifier_roundtrip() {
        let key = MasterKey::generate();
        let secret = ClientSecret::generate();
        let verifier = secret_verifier(&key, "sample-client", secret.expose());

        assert!(verify_secret(&key, "sample-client", secret.expose(), &verifier));
        assert!(!verifier.contains(secret.expose()));
    }

    #[test]
    fn test_verifier_rejects_wrong_client() {
        let key = MasterKey::generate();
        let secret = ClientSecret::generate();
        let verifier = secret_verifier(&key, "sample-client", secret.expose());
        assert!(!verify_secret(&key, "wrong-client", secret.expose(), &verifier));
    }

    #[test]
    fn test_verifier_rejects_wrong_key() {
        let secret = ClientSecret::generate();
        let verifier = secret_verifier(&MasterKey::generate(), "c", secret.expose());
        assert!(!verify_secret(&MasterKey::generate(), "c", secret.expose(), &verifier));
    }

    #[test]
    fn test_verifier_rejects_wrong_secret_and_garbage() {
        let key = MasterKey::generate();
        let verifier = secret_verifier(&key, "c", "right");
        assert!(!verify_secret(&key, "c", "wrong", &verifier));
        assert!(!verify_secret(&key, "c", "right", "%%%"));
        assert!(!verify_secret(&key, "c", "right", ""));
    }

    #[test]
    fn test_derived_keys_are_bound_to_purpose() {
        let key = MasterKey::generate();
        let signing = derive_key(&key, "access-token");
        assert_eq!(signing.len(), 32);
        assert_eq!(signing, derive_key(&key, "access-token"));
        assert_ne!(signing, derive_key(&key, "other"));
        assert_ne!(signing, derive_key(&MasterKey::generate(), "access-token"));
        assert_ne!(signing.as_slice(), key.as_bytes().as_slice());
    }

    #[test]
    fn test_debug_redacts() {
        let secret = ClientSecret::generate();
        assert!(!format!("{:?}", secret).contains(secret.expose()));
    }
}
