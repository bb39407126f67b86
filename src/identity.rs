//! # Identity and Signing Keys
//!
//! This module defines the publisher identity used throughout the market:
//!
//! - [`Keypair`]: RSA signing keypair loaded from (or persisted to) a PEM file
//! - Public-key bytes in SPKI DER form, which double as the wire identity
//!   (`User.id`) embedded in every published holder entry
//!
//! ## Identity Model
//!
//! A publisher's identity *is* its RSA public key. The DER-encoded public
//! half is written into each signed entry, so verifiers recover the
//! verification key from the entry itself and no external key registry is
//! needed. The same private key also drives the DHT host identity, keeping
//! the overlay peer and the record signer one and the same.
//!
//! ## Key File Format
//!
//! The private key lives in a PKCS#1 PEM block (`RSA PRIVATE KEY`),
//! 2048-bit by default. A missing file is populated with a fresh key on
//! startup (owner read/write only); a file that exists but is not PKCS#1
//! RSA fails startup.
//!
//! ## Signing Scheme
//!
//! RSA PKCS#1 v1.5 over SHA-256. The verifier hashes the message
//! internally, so callers always pass the raw serialized `User` bytes.

use std::fmt;
use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::info;

/// Default modulus size for freshly generated keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Error type for key loading, generation, and signing failures.
#[derive(Debug)]
pub enum KeyError {
    /// The key file could not be read or written.
    Io(std::io::Error),
    /// The key file exists but does not hold a PKCS#1 RSA private key,
    /// or key material could not be encoded.
    InvalidKey(String),
    /// Key generation failed (CSPRNG or parameter failure).
    Generation(String),
    /// The private key failed to produce a signature.
    Signing(String),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::Io(err) => write!(f, "key file I/O failed: {err}"),
            KeyError::InvalidKey(msg) => write!(f, "InvalidKey: {msg}"),
            KeyError::Generation(msg) => write!(f, "key generation failed: {msg}"),
            KeyError::Signing(msg) => write!(f, "InternalSigningError: {msg}"),
        }
    }
}

impl std::error::Error for KeyError {}

impl From<std::io::Error> for KeyError {
    fn from(err: std::io::Error) -> Self {
        KeyError::Io(err)
    }
}

/// A publisher's long-term RSA keypair.
///
/// The SPKI DER encoding of the public half is cached at construction; it
/// is the byte string that appears as `User.id` in every entry this
/// publisher signs.
#[derive(Clone)]
pub struct Keypair {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl Keypair {
    /// Generate a fresh keypair with the default modulus size.
    pub fn generate() -> Result<Self, KeyError> {
        Self::generate_with_bits(DEFAULT_KEY_BITS)
    }

    /// Generate a keypair with a custom modulus size.
    ///
    /// Smaller keys are useful in tests where 2048-bit generation is too
    /// slow; production nodes use [`DEFAULT_KEY_BITS`].
    pub fn generate_with_bits(bits: usize) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|err| KeyError::Generation(err.to_string()))?;
        Self::from_private_key(private)
    }

    /// Wrap an existing private key, caching its public DER encoding.
    pub fn from_private_key(private: RsaPrivateKey) -> Result<Self, KeyError> {
        let public_der = private
            .to_public_key()
            .to_public_key_der()
            .map_err(|err| KeyError::InvalidKey(err.to_string()))?
            .into_vec();
        Ok(Self { private, public_der })
    }

    /// Load a keypair from a PKCS#1 PEM file, generating and persisting a
    /// new one when the file does not exist.
    ///
    /// A newly written key file is restricted to owner read/write. An
    /// existing file that is not a PKCS#1 RSA private key fails with
    /// [`KeyError::InvalidKey`].
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        if !path.exists() {
            let keypair = Self::generate()?;
            let pem = keypair
                .private
                .to_pkcs1_pem(LineEnding::LF)
                .map_err(|err| KeyError::InvalidKey(err.to_string()))?;
            std::fs::write(path, pem.as_bytes())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
            info!(path = %path.display(), "new private key generated and saved");
            return Ok(keypair);
        }

        let pem = std::fs::read_to_string(path)?;
        let private = RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|err| {
            KeyError::InvalidKey(format!(
                "{} is not a PKCS#1 RSA private key: {err}",
                path.display()
            ))
        })?;
        info!(path = %path.display(), "existing private key loaded");
        Self::from_private_key(private)
    }

    /// The SPKI DER encoding of the public key — the publisher's wire
    /// identity (`User.id`).
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_der
    }

    /// Sign a message with RSA PKCS#1 v1.5 over SHA-256.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        let signing_key = SigningKey::<Sha256>::new(self.private.clone());
        let signature = signing_key
            .try_sign(message)
            .map_err(|err| KeyError::Signing(err.to_string()))?;
        Ok(signature.to_vec())
    }

    /// Export the private key as PKCS#8 DER for the transport layer, which
    /// derives the DHT host identity from it.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, KeyError> {
        Ok(self
            .private
            .to_pkcs8_der()
            .map_err(|err| KeyError::InvalidKey(err.to_string()))?
            .as_bytes()
            .to_vec())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field(
                "public_der",
                &hex::encode(&self.public_der[..8.min(self.public_der.len())]),
            )
            .finish_non_exhaustive()
    }
}

/// Decode an entry's `User.id` bytes into an RSA public key.
///
/// Returns `None` when the bytes are not SPKI DER for an RSA key; the
/// validator maps that to its bad-identity rejection.
pub fn decode_public_key(id: &[u8]) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(id).ok()
}

/// Verify an RSA PKCS#1 v1.5 SHA-256 signature over `message`.
pub fn verify_signature(public: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
    match Signature::try_from(signature) {
        Ok(signature) => verifying_key.verify(message, &signature).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const TEST_KEY_BITS: usize = 1024;

    fn temp_key_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("orcanet-market-{}-{}.pem", name, std::process::id()));
        path
    }

    #[test]
    fn sign_verify_round_trip() {
        let keypair = Keypair::generate_with_bits(TEST_KEY_BITS).unwrap();
        let message = b"holder entry payload";
        let signature = keypair.sign(message).unwrap();

        let public = decode_public_key(keypair.public_key_bytes()).unwrap();
        assert!(verify_signature(&public, message, &signature));
        assert!(!verify_signature(&public, b"different payload", &signature));
    }

    #[test]
    fn tampered_signature_rejected() {
        let keypair = Keypair::generate_with_bits(TEST_KEY_BITS).unwrap();
        let message = b"holder entry payload";
        let mut signature = keypair.sign(message).unwrap();
        let last = signature.len() - 1;
        signature[last] ^= 0xFF;

        let public = decode_public_key(keypair.public_key_bytes()).unwrap();
        assert!(!verify_signature(&public, message, &signature));
    }

    #[test]
    fn garbage_identity_rejected() {
        assert!(decode_public_key(b"not a DER public key").is_none());
        assert!(decode_public_key(&[]).is_none());
    }

    #[test]
    fn load_or_generate_persists_and_reloads() {
        let path = temp_key_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let generated = Keypair::load_or_generate(&path).unwrap();
        assert!(path.exists());

        let reloaded = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(generated.public_key_bytes(), reloaded.public_key_bytes());

        std::fs::remove_file(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn generated_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_key_path("perms");
        let _ = std::fs::remove_file(&path);

        Keypair::load_or_generate(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn invalid_key_file_fails() {
        let path = temp_key_path("invalid");
        std::fs::write(&path, "-----BEGIN GARBAGE-----\nAAAA\n-----END GARBAGE-----\n").unwrap();

        let result = Keypair::load_or_generate(&path);
        assert!(matches!(result, Err(KeyError::InvalidKey(_))));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn pkcs8_export_is_stable() {
        let keypair = Keypair::generate_with_bits(TEST_KEY_BITS).unwrap();
        let a = keypair.to_pkcs8_der().unwrap();
        let b = keypair.to_pkcs8_der().unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }
}
