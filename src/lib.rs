//! A library for creating and verifying *DomainKeys Identified Mail* (DKIM)
//! signatures, as specified in [RFC 6376].
//!
//! The entry points are [`verify`] (or [`verify_with_options`]) and [`sign`].
//! Both operate on a raw RFC 5322 message byte stream: header fields, a blank
//! separator line, and the body. `verify` returns one [`Verification`] per
//! `DKIM-Signature` header field found in the message; `sign` writes out the
//! original message with a freshly computed, folded `DKIM-Signature` field
//! prepended.
//!
//! Signature algorithms `rsa-sha256` and `ed25519-sha256` ([RFC 8463]) are
//! supported. In accordance with [RFC 8301], `rsa-sha1` signatures are
//! rejected and RSA keys shorter than 1024 bits are not accepted.
//!
//! Public keys are retrieved through the [`LookupTxt`] capability. An
//! implementation for the [Hickory DNS] resolver is provided with the
//! default-enabled **`hickory-resolver`** feature; it is used whenever
//! verification options do not carry an explicit lookup.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), maildkim::Error> {
//! let message = b"From: Joe SixPack <joe@football.example.com>\r\n\
//!     To: Suzie Q <suzie@shopping.example.net>\r\n\
//!     Subject: Is dinner ready?\r\n\
//!     \r\n\
//!     Hi.\r\n";
//!
//! for verification in maildkim::verify(&message[..]).await? {
//!     match &verification.error {
//!         None => println!("valid signature for {}", verification.domain),
//!         Some(e) => println!("broken signature for {}: {e}", verification.domain),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Trace logging
//!
//! This library uses the [tracing] crate for internal trace logging, in the
//! high-level `signer` and `verifier` code only. For insight into library
//! operation, install a tracing subscriber and enable logging at `trace`
//! level.
//!
//! [RFC 6376]: https://www.rfc-editor.org/rfc/rfc6376
//! [RFC 8301]: https://www.rfc-editor.org/rfc/rfc8301
//! [RFC 8463]: https://www.rfc-editor.org/rfc/rfc8463
//! [Hickory DNS]: https://crates.io/crates/hickory-resolver
//! [tracing]: https://crates.io/crates/tracing

pub mod canonicalize;
pub mod crypto;
mod header;
pub mod lookup;
pub mod record;
pub mod signer;
mod tag_list;
pub mod verifier;

pub use crate::{
    canonicalize::Canonicalization,
    crypto::{HashAlgorithm, KeyType, SigningKey, VerifyingKey},
    lookup::LookupTxt,
    signer::{sign, SignOptions},
    verifier::{
        verify, verify_with_options, FailureKind, Verification, VerificationError, VerifyOptions,
    },
};

use std::{
    fmt::{self, Display, Formatter},
    io,
    time::{SystemTime, UNIX_EPOCH},
};

/// An error aborting a [`sign`] or [`verify`] call as a whole.
///
/// Classified per-signature verification failures are not reported here but
/// in [`Verification::error`]; this type covers I/O problems, messages that
/// cannot be processed at all, and invalid signing options.
#[derive(Debug)]
pub enum Error {
    /// An I/O error on the caller's reader or writer.
    Io(io::Error),
    /// The message ended before the blank line separating header and body.
    IncompleteHeader,
    /// More signatures were present than
    /// [`VerifyOptions::max_verifications`] allows. Carries the verifications
    /// for the signatures that were processed.
    TooManySignatures(Vec<Verification>),
    /// No TXT lookup was supplied and no default resolver is available.
    NoTxtLookup,
    /// No signing domain specified.
    MissingDomain,
    /// No selector specified.
    MissingSelector,
    /// The signed header field list does not include `From`.
    FromNotSigned,
    /// The signing operation itself failed.
    SigningFailure,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::IncompleteHeader => write!(f, "message ended before the header/body separator"),
            Self::TooManySignatures(_) => write!(f, "too many signatures"),
            Self::NoTxtLookup => write!(f, "no TXT lookup available"),
            Self::MissingDomain => write!(f, "no domain specified"),
            Self::MissingSelector => write!(f, "no selector specified"),
            Self::FromNotSigned => write!(f, "the From header field must be signed"),
            Self::SigningFailure => write!(f, "signing failed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
