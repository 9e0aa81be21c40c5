//! DKIM public key records (RFC 6376, §3.6.1) and their retrieval.

use crate::{
    crypto::{KeyType, VerifyingKey},
    lookup::LookupTxt,
    tag_list::{parse_colon_separated, parse_tag_map, strip_whitespace},
};
use base64ct::{Base64, Encoding};
use rsa::{pkcs8::DecodePublicKey, traits::PublicKeyParts, RsaPublicKey};
use std::{
    fmt::{self, Display, Formatter},
    io::{self, ErrorKind},
    str::FromStr,
};

/// An error parsing or rejecting a key record. All of these are permanent
/// failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyRecordError {
    /// The record is not a well-formed tag list, or a tag value does not
    /// decode.
    SyntaxError,
    /// The `v=` tag is present but not `DKIM1`.
    IncompatibleVersion,
    /// There is no `p=` tag.
    NoKeyData,
    /// The `p=` tag is empty, which means the key has been revoked.
    RevokedKey,
    /// The `k=` tag names an unknown key algorithm.
    UnsupportedKeyType,
    /// The key data does not decode as a key of the stated algorithm.
    InvalidKey,
    /// The RSA key is shorter than the 1024 bits RFC 8301 requires.
    WeakKey { bits: usize },
}

impl Display for KeyRecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyntaxError => write!(f, "key syntax error"),
            Self::IncompatibleVersion => write!(f, "incompatible public key version"),
            Self::NoKeyData => write!(f, "no public key data"),
            Self::RevokedKey => write!(f, "key revoked"),
            Self::UnsupportedKeyType => write!(f, "unsupported key algorithm"),
            Self::InvalidKey => write!(f, "malformed public key"),
            Self::WeakKey { bits } => {
                write!(f, "key is too short: want 1024 bits, has {bits} bits")
            }
        }
    }
}

impl std::error::Error for KeyRecordError {}

/// A parsed DKIM public key record.
#[derive(Clone, Debug)]
pub struct KeyRecord {
    /// The verifier capability for the published key.
    pub verifying_key: VerifyingKey,
    /// The key algorithm from the `k=` tag (`rsa` when absent).
    pub key_type: KeyType,
    /// Acceptable hash algorithm names from the `h=` tag; `None` means no
    /// restriction.
    pub hash_algorithms: Option<Vec<String>>,
    /// Service types from the `s=` tag; `None` means any service. A literal
    /// `*` in the list also means any.
    pub services: Option<Vec<String>>,
    /// Human-readable notes from the `n=` tag.
    pub notes: Option<String>,
    /// Flags from the `t=` tag, verbatim. Flag `s` requires the AUID domain
    /// to equal the SDID exactly.
    pub flags: Vec<String>,
}

impl FromStr for KeyRecord {
    type Err = KeyRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let params = parse_tag_map(s).map_err(|_| KeyRecordError::SyntaxError)?;

        if let Some(v) = params.get("v") {
            if v != "DKIM1" {
                return Err(KeyRecordError::IncompatibleVersion);
            }
        }

        let p = params.get("p").ok_or(KeyRecordError::NoKeyData)?;
        if p.is_empty() {
            return Err(KeyRecordError::RevokedKey);
        }
        let key_data = Base64::decode_vec(&strip_whitespace(p))
            .map_err(|_| KeyRecordError::SyntaxError)?;

        let (key_type, verifying_key) = match params.get("k").map(String::as_str) {
            None | Some("rsa") => {
                // SubjectPublicKeyInfo, the de facto wire format
                let key = RsaPublicKey::from_public_key_der(&key_data)
                    .map_err(|_| KeyRecordError::InvalidKey)?;
                // RFC 8301, §3.2: verifiers MUST NOT consider signatures
                // using RSA keys of less than 1024 bits as valid.
                let bits = key.size() * 8;
                if bits < 1024 {
                    return Err(KeyRecordError::WeakKey { bits });
                }
                (KeyType::Rsa, VerifyingKey::Rsa(key))
            }
            Some("ed25519") => {
                // the raw 32 public key bytes (RFC 8463, §3)
                let key = ed25519_dalek::VerifyingKey::try_from(&key_data[..])
                    .map_err(|_| KeyRecordError::InvalidKey)?;
                (KeyType::Ed25519, VerifyingKey::Ed25519(key))
            }
            Some(_) => return Err(KeyRecordError::UnsupportedKeyType),
        };

        let hash_algorithms = params.get("h").map(|h| parse_colon_separated(h));

        let notes = params.get("n").cloned();

        let services = params.get("s").and_then(|s| {
            let services = parse_colon_separated(s);
            if services.iter().any(|s| s == "*") {
                None
            } else {
                Some(services)
            }
        });

        let flags = params
            .get("t")
            .map(|t| parse_colon_separated(t))
            .unwrap_or_default();

        Ok(Self {
            verifying_key,
            key_type,
            hash_algorithms,
            services,
            notes,
            flags,
        })
    }
}

/// A failed key record query, classified for the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum QueryError {
    /// No usable record exists at the queried name (permanent).
    NoRecord,
    /// The lookup failed transiently and may be retried (temporary).
    Temporary,
    /// A record was found but rejected (permanent).
    Record(KeyRecordError),
}

/// Fetches and parses the key record at `<selector>._domainkey.<domain>`.
pub(crate) async fn query_key_record(
    lookup: &dyn LookupTxt,
    domain: &str,
    selector: &str,
) -> Result<KeyRecord, QueryError> {
    let name = format!("{selector}._domainkey.{domain}");

    let txts = lookup
        .lookup_txt(&name)
        .await
        .map_err(|e| classify_lookup_error(&e))?;

    // long keys are split across several TXT strings
    let txt = txts.concat();

    txt.parse().map_err(QueryError::Record)
}

fn classify_lookup_error(error: &io::Error) -> QueryError {
    match error.kind() {
        ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => QueryError::Temporary,
        _ => QueryError::NoRecord,
    }
}
