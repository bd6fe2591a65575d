//! Ed25519 keys used to sign bundle content hashes.
//!
//! Keys travel as lowercase hex in config files and key files; signatures
//! travel as the raw 64 bytes stored in `signature.bin`.

use std::fmt;

use ed25519_dalek::{Signer as _, Verifier as _};
use rand::rngs::OsRng;

use crate::BundleError;

/// Secret half of a publisher key.
pub struct SigningKey(ed25519_dalek::SigningKey);

/// Public half of a publisher key, as listed in a host's trusted keys.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VerifyingKey(ed25519_dalek::VerifyingKey);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey(ed25519_dalek::SigningKey::generate(&mut OsRng)))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }
}

impl SigningKey {
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(secret))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn from_hex(text: &str) -> Result<Self, BundleError> {
        hex_array::<32>(text).map(|secret| Self::from_bytes(&secret))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey(public: {})", self.verifying_key())
    }
}

impl VerifyingKey {
    /// Rejects byte strings that are not a valid curve point.
    pub fn from_bytes(public: &[u8; 32]) -> Result<Self, BundleError> {
        match ed25519_dalek::VerifyingKey::from_bytes(public) {
            Ok(key) => Ok(Self(key)),
            Err(_) => Err(BundleError::InvalidPublicKey),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn from_hex(text: &str) -> Result<Self, BundleError> {
        Self::from_bytes(&hex_array::<32>(text)?)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), BundleError> {
        match self.0.verify(message, &signature.0) {
            Ok(()) => Ok(()),
            Err(_) => Err(BundleError::SignatureInvalid),
        }
    }
}

impl fmt::Display for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKey({self})")
    }
}

impl Signature {
    pub fn from_bytes(raw: &[u8; 64]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(raw))
    }

    /// Parses the contents of `signature.bin`; anything but 64 bytes is invalid.
    pub fn from_slice(raw: &[u8]) -> Result<Self, BundleError> {
        let Ok(raw) = <[u8; 64]>::try_from(raw) else {
            return Err(BundleError::SignatureInvalid);
        };
        Ok(Self::from_bytes(&raw))
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.to_bytes()))
    }
}

fn hex_array<const N: usize>(text: &str) -> Result<[u8; N], BundleError> {
    let decoded =
        hex::decode(text.trim()).map_err(|e| BundleError::InvalidKeyEncoding(e.to_string()))?;
    let len = decoded.len();
    <[u8; N]>::try_from(decoded)
        .map_err(|_| BundleError::InvalidKeyEncoding(format!("expected {N} bytes, got {len}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_binds_message_and_key() {
        let publisher = KeyPair::generate();
        let stranger = KeyPair::generate();
        let hash = b"3f5a0c";
        let sig = publisher.signing_key.sign(hash);

        assert!(publisher.verifying_key.verify(hash, &sig).is_ok());
        assert!(publisher.verifying_key.verify(b"3f5a0d", &sig).is_err());
        assert!(stranger.verifying_key.verify(hash, &sig).is_err());
    }

    #[test]
    fn key_file_contents_reload() {
        let publisher = KeyPair::generate();
        let reloaded = KeyPair::from_signing_key(
            SigningKey::from_hex(&format!("{}\n", publisher.signing_key.to_hex())).unwrap(),
        );
        assert_eq!(reloaded.verifying_key, publisher.verifying_key);
        assert_eq!(
            VerifyingKey::from_hex(&publisher.verifying_key.to_string()).unwrap(),
            publisher.verifying_key
        );
    }

    #[test]
    fn signature_file_bytes_reload() {
        let publisher = KeyPair::generate();
        let sig = publisher.signing_key.sign(b"hash");
        let reloaded = Signature::from_slice(&sig.to_bytes()).unwrap();
        assert!(publisher.verifying_key.verify(b"hash", &reloaded).is_ok());
        assert!(Signature::from_slice(&sig.to_bytes()[..63]).is_err());
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(matches!(
            VerifyingKey::from_hex("abcd"),
            Err(BundleError::InvalidKeyEncoding(_))
        ));
        assert!(matches!(
            SigningKey::from_hex("zz"),
            Err(BundleError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn debug_never_prints_the_secret() {
        let publisher = KeyPair::generate();
        let shown = format!("{:?}", publisher.signing_key);
        assert!(!shown.contains(&publisher.signing_key.to_hex()));
        assert!(shown.contains(&publisher.verifying_key.to_hex()));
    }
}
