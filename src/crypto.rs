//! Cryptographic primitives: key algorithm dispatch and message hashing.

use ed25519_dalek::{Signer as _, Verifier as _};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt::{self, Display, Formatter};

/// A key algorithm, the first half of an `a=` tag value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyType {
    Rsa,
    Ed25519,
}

impl KeyType {
    pub fn canonical_str(self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::Ed25519 => "ed25519",
        }
    }
}

/// A hash algorithm, the second half of an `a=` tag value.
///
/// Only SHA-256 is available: RFC 8301 forbids use of the historic SHA-1
/// algorithm for both signing and verifying.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
}

impl HashAlgorithm {
    pub fn canonical_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }
}

/// An error produced when signing fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SigningFailure;

impl Display for SigningFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "signing failed")
    }
}

impl std::error::Error for SigningFailure {}

/// An error produced when a signature does not verify.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifyingFailure {
    /// The signature data is not well-formed for the key algorithm.
    InvalidSignature,
    /// The signature does not match the computed hash.
    VerificationFailure,
}

impl Display for VerifyingFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSignature => write!(f, "malformed signature data"),
            Self::VerificationFailure => write!(f, "signature mismatch"),
        }
    }
}

impl std::error::Error for VerifyingFailure {}

/// A private key used for signing, tagged with its key algorithm.
///
/// RSA signatures use PKCS#1 v1.5 over the precomputed SHA-256 digest;
/// Ed25519 signs the digest bytes directly (RFC 8463, §4). Both are
/// deterministic.
pub enum SigningKey {
    Rsa(RsaPrivateKey),
    Ed25519(Box<ed25519_dalek::SigningKey>),
}

impl SigningKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Rsa(_) => KeyType::Rsa,
            Self::Ed25519(_) => KeyType::Ed25519,
        }
    }

    pub fn sign(&self, hash: HashAlgorithm, digest: &[u8]) -> Result<Vec<u8>, SigningFailure> {
        match (self, hash) {
            (Self::Rsa(key), HashAlgorithm::Sha256) => key
                .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
                .map_err(|_| SigningFailure),
            (Self::Ed25519(key), HashAlgorithm::Sha256) => Ok(key.sign(digest).to_bytes().to_vec()),
        }
    }
}

impl From<RsaPrivateKey> for SigningKey {
    fn from(key: RsaPrivateKey) -> Self {
        Self::Rsa(key)
    }
}

impl From<ed25519_dalek::SigningKey> for SigningKey {
    fn from(key: ed25519_dalek::SigningKey) -> Self {
        Self::Ed25519(Box::new(key))
    }
}

/// A public key capability obtained from a key record, tagged with its key
/// algorithm. Verifies a signature against a precomputed digest.
#[derive(Clone, Debug)]
pub enum VerifyingKey {
    Rsa(RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl VerifyingKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Rsa(_) => KeyType::Rsa,
            Self::Ed25519(_) => KeyType::Ed25519,
        }
    }

    pub fn verify(
        &self,
        hash: HashAlgorithm,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<(), VerifyingFailure> {
        match (self, hash) {
            (Self::Rsa(key), HashAlgorithm::Sha256) => key
                .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
                .map_err(|_| VerifyingFailure::VerificationFailure),
            (Self::Ed25519(key), HashAlgorithm::Sha256) => {
                let signature = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| VerifyingFailure::InvalidSignature)?;
                key.verify(digest, &signature)
                    .map_err(|_| VerifyingFailure::VerificationFailure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64ct::{Base64, Encoding};
    use sha2::Digest;

    // key pair from the RFC 8463 appendix examples
    const ED25519_SEED_BASE64: &str = "nWGxne/9WmC6hEr0kuwsxERJxWl7MmkZcDusAxyuf2A=";
    const ED25519_PUBLIC_BASE64: &str = "11qYAYKxCrfVS/7TyWQHOg7hcvPapiMlrwIaaPcHURo=";

    #[test]
    fn ed25519_sign_and_verify() {
        let seed: [u8; 32] = Base64::decode_vec(ED25519_SEED_BASE64)
            .unwrap()
            .try_into()
            .unwrap();
        let signing_key = SigningKey::from(ed25519_dalek::SigningKey::from_bytes(&seed));

        let public: [u8; 32] = Base64::decode_vec(ED25519_PUBLIC_BASE64)
            .unwrap()
            .try_into()
            .unwrap();
        let verifying_key =
            VerifyingKey::Ed25519(ed25519_dalek::VerifyingKey::from_bytes(&public).unwrap());

        let digest = Sha256::digest(b"attack at dawn");

        let signature = signing_key.sign(HashAlgorithm::Sha256, &digest).unwrap();

        assert_eq!(signing_key.key_type(), KeyType::Ed25519);
        assert_eq!(
            verifying_key.verify(HashAlgorithm::Sha256, &digest, &signature),
            Ok(())
        );

        let other = Sha256::digest(b"attack at dusk");
        assert_eq!(
            verifying_key.verify(HashAlgorithm::Sha256, &other, &signature),
            Err(VerifyingFailure::VerificationFailure)
        );
    }
}
