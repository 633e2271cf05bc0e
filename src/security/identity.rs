use base64::prelude::*;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

const PRIVATE_KEY_BYTES: usize = 64;
const PUBLIC_KEY_BYTES: usize = 32;
const SIGNATURE_BYTES: usize = 64;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid {0}")]
    BadKey(&'static str),
}

/// Generate a fresh Ed25519 keypair, returned as base64 (private, public).
/// The private key is the 64-byte seed+public form so it round-trips through
/// the config file unchanged.
pub fn generate_key() -> (String, String) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let private = BASE64_STANDARD.encode(signing_key.to_keypair_bytes());
    let public = BASE64_STANDARD.encode(signing_key.verifying_key().to_bytes());
    (private, public)
}

/// Sign `data` with a base64 private key, returning the base64 signature.
pub fn sign(private_key: &str, data: &[u8]) -> Result<String, IdentityError> {
    let key_bytes = BASE64_STANDARD
        .decode(private_key)
        .map_err(|_| IdentityError::BadKey("private key"))?;
    let key_bytes: [u8; PRIVATE_KEY_BYTES] = key_bytes
        .try_into()
        .map_err(|_| IdentityError::BadKey("private key length"))?;
    let signing_key = SigningKey::from_keypair_bytes(&key_bytes)
        .map_err(|_| IdentityError::BadKey("private key"))?;
    Ok(BASE64_STANDARD.encode(signing_key.sign(data).to_bytes()))
}

/// Verify a base64 signature over `data` against a base64 public key.
/// Returns `Ok(false)` for a well-formed signature that does not match.
pub fn verify(public_key: &str, data: &[u8], signature: &str) -> Result<bool, IdentityError> {
    let key_bytes = BASE64_STANDARD
        .decode(public_key)
        .map_err(|_| IdentityError::BadKey("public key"))?;
    let key_bytes: [u8; PUBLIC_KEY_BYTES] = key_bytes
        .try_into()
        .map_err(|_| IdentityError::BadKey("public key length"))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| IdentityError::BadKey("public key"))?;

    let sig_bytes = BASE64_STANDARD
        .decode(signature)
        .map_err(|_| IdentityError::BadKey("signature"))?;
    let sig_bytes: [u8; SIGNATURE_BYTES] = sig_bytes
        .try_into()
        .map_err(|_| IdentityError::BadKey("signature length"))?;
    let signature = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(data, &signature).is_ok())
}
