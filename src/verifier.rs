//! Message verification.

use crate::{
    canonicalize::{canonicalize_header, BodyCanonicalizer, Canonicalization},
    crypto::{HashAlgorithm, VerifyingKey},
    header::{parse_header_field, read_header, Header, HeaderPicker},
    lookup::LookupTxt,
    record::{query_key_record, KeyRecordError, QueryError},
    tag_list::{parse_colon_separated, parse_tag_map, strip_whitespace, SIGNATURE_FIELD_NAME},
    unix_now, Error,
};
use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Display, Formatter},
    str,
};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::trace;

const REQUIRED_TAGS: &[&str] = &["v", "a", "b", "bh", "d", "h", "s"];

/// The failure class of a [`VerificationError`] (RFC 6376, §6.1, §8.15).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// The signature can never verify; retrying is pointless.
    Permanent,
    /// The signature could not be checked right now; a later retry may
    /// succeed.
    Temporary,
    /// The signature was checked and did not verify.
    Signature,
}

/// A classified error describing why one signature did not verify.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerificationError {
    /// The signature tag list does not parse.
    MalformedTagList,
    /// The `v=` tag is missing or not `1`.
    IncompatibleVersion,
    /// A required tag is missing.
    MissingRequiredTag(&'static str),
    /// The `i=` identifier is not within the `d=` domain.
    DomainMismatch,
    /// The signed header field list does not include `From`.
    FromNotSigned,
    /// The `t=` timestamp does not parse.
    MalformedTimestamp,
    /// The `x=` expiration does not parse.
    MalformedExpiration,
    /// The signature has expired.
    SignatureExpired,
    /// None of the `q=` query methods is supported.
    UnsupportedQueryMethod,
    /// The `a=` tag is not of the form `keyalgo-hashalgo`.
    MalformedAlgorithm,
    /// The `a=` tag names SHA-1, which RFC 8301 forbids.
    HashAlgorithmTooWeak,
    /// The `a=` tag names an unknown hash algorithm.
    UnsupportedHashAlgorithm,
    /// The key record does not allow the signature's hash algorithm.
    InappropriateHashAlgorithm,
    /// The key record's key algorithm differs from the signature's.
    InappropriateKeyAlgorithm,
    /// The key record's service list does not include `email`.
    InappropriateService,
    /// The key record's `s` flag requires the identifier to be in the exact
    /// signing domain, and it is not.
    IdentifierMismatch,
    /// The `c=` header canonicalization is unknown.
    UnsupportedHeaderCanonicalization,
    /// The `c=` body canonicalization is unknown.
    UnsupportedBodyCanonicalization,
    /// The `l=` body length does not parse.
    MalformedBodyLength,
    /// The `bh=` tag does not decode.
    MalformedBodyHash,
    /// The `b=` tag does not decode.
    MalformedSignatureData,
    /// No key record exists for the signature.
    NoKeyForSignature,
    /// The key record was rejected.
    KeyRecord(KeyRecordError),
    /// The key record could not be fetched right now.
    KeyUnavailable,
    /// The computed body hash differs from the `bh=` tag.
    BodyHashMismatch,
    /// The cryptographic signature did not verify.
    SignatureMismatch,
}

impl VerificationError {
    /// The failure class of this error. Exactly one of the three predicates
    /// below holds for any error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::KeyUnavailable => FailureKind::Temporary,
            Self::BodyHashMismatch | Self::SignatureMismatch => FailureKind::Signature,
            _ => FailureKind::Permanent,
        }
    }

    /// Whether this is a permanent failure, for instance a missing required
    /// tag or a malformed header.
    pub fn is_perm_fail(&self) -> bool {
        self.kind() == FailureKind::Permanent
    }

    /// Whether this is a temporary failure.
    pub fn is_temp_fail(&self) -> bool {
        self.kind() == FailureKind::Temporary
    }

    /// Whether the signature was checked but did not verify.
    pub fn is_signature_fail(&self) -> bool {
        self.kind() == FailureKind::Signature
    }
}

impl Display for VerificationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedTagList => write!(f, "malformed signature tags"),
            Self::IncompatibleVersion => write!(f, "incompatible signature version"),
            Self::MissingRequiredTag(tag) => {
                write!(f, "signature missing required tag {tag}")
            }
            Self::DomainMismatch => write!(f, "domain mismatch"),
            Self::FromNotSigned => write!(f, "From field not signed"),
            Self::MalformedTimestamp => write!(f, "malformed time"),
            Self::MalformedExpiration => write!(f, "malformed expiration time"),
            Self::SignatureExpired => write!(f, "signature has expired"),
            Self::UnsupportedQueryMethod => {
                write!(f, "unsupported public key query method")
            }
            Self::MalformedAlgorithm => write!(f, "malformed algorithm name"),
            Self::HashAlgorithmTooWeak => write!(f, "hash algorithm too weak: sha1"),
            Self::UnsupportedHashAlgorithm => write!(f, "unsupported hash algorithm"),
            Self::InappropriateHashAlgorithm => write!(f, "inappropriate hash algorithm"),
            Self::InappropriateKeyAlgorithm => write!(f, "inappropriate key algorithm"),
            Self::InappropriateService => write!(f, "inappropriate service"),
            Self::IdentifierMismatch => write!(f, "identifier and domain mismatch"),
            Self::UnsupportedHeaderCanonicalization => {
                write!(f, "unsupported header canonicalization algorithm")
            }
            Self::UnsupportedBodyCanonicalization => {
                write!(f, "unsupported body canonicalization algorithm")
            }
            Self::MalformedBodyLength => write!(f, "malformed body length"),
            Self::MalformedBodyHash => write!(f, "malformed body hash"),
            Self::MalformedSignatureData => write!(f, "malformed signature data"),
            Self::NoKeyForSignature => write!(f, "no key for signature"),
            Self::KeyRecord(e) => e.fmt(f),
            Self::KeyUnavailable => write!(f, "key unavailable"),
            Self::BodyHashMismatch => write!(f, "body hash did not verify"),
            Self::SignatureMismatch => write!(f, "signature did not verify"),
        }
    }
}

impl std::error::Error for VerificationError {}

/// The result of checking one `DKIM-Signature` header field. The signature
/// is valid when [`error`][Self::error] is `None`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Verification {
    /// The SDID claiming responsibility for the message, from the `d=` tag.
    pub domain: String,
    /// The Agent or User Identifier (AUID) on behalf of which the SDID takes
    /// responsibility, from the `i=` tag; `@<domain>` when absent.
    pub identifier: String,
    /// The signed header field names, in signing order.
    pub header_keys: Vec<String>,
    /// The number of canonicalized body bytes covered by the signature;
    /// `None` when the whole body is signed.
    pub body_length: Option<u64>,
    /// The signing time as Unix seconds, if declared.
    pub timestamp: Option<u64>,
    /// The expiration time as Unix seconds, if declared.
    pub expiration: Option<u64>,
    /// Why the signature did not verify; `None` for a valid signature.
    pub error: Option<VerificationError>,
}

/// Options for [`verify_with_options`].
#[derive(Clone, Copy, Default)]
pub struct VerifyOptions<'a> {
    /// The TXT lookup used to retrieve public keys. When `None`, a resolver
    /// configured from the system is used (requires the `hickory-resolver`
    /// feature).
    pub lookup_txt: Option<&'a dyn LookupTxt>,
    /// An upper bound on the number of signatures processed. When exceeded,
    /// the call returns [`Error::TooManySignatures`] carrying the
    /// verifications for the first signatures up to the bound.
    pub max_verifications: Option<usize>,
}

/// Checks all DKIM signatures of the message read from `reader`, returning
/// one [`Verification`] per signature, in the order the signature fields
/// appear in the header.
///
/// There is no guarantee that the reader is completely consumed.
pub async fn verify<R>(reader: R) -> Result<Vec<Verification>, Error>
where
    R: AsyncRead + Unpin,
{
    verify_with_options(reader, &VerifyOptions::default()).await
}

/// Like [`verify`], with custom options.
pub async fn verify_with_options<R>(
    reader: R,
    options: &VerifyOptions<'_>,
) -> Result<Vec<Verification>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);

    let header = read_header(&mut reader).await?;

    // scan header fields for signatures
    let mut signatures = Vec::new();
    for (index, field) in header.iter().enumerate() {
        let (name, value) = parse_header_field(field);
        if name.eq_ignore_ascii_case(SIGNATURE_FIELD_NAME.as_bytes()) {
            signatures.push((index, value.to_vec()));
        }
    }

    if signatures.is_empty() {
        return Ok(Vec::new());
    }

    let truncated =
        matches!(options.max_verifications, Some(max) if signatures.len() > max);
    if let Some(max) = options.max_verifications {
        signatures.truncate(max);
    }

    #[cfg(feature = "hickory-resolver")]
    let system_resolver;
    let lookup_txt: &dyn LookupTxt = match options.lookup_txt {
        Some(lookup) => lookup,
        #[cfg(feature = "hickory-resolver")]
        None => {
            system_resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| {
                    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
                })?;
            &system_resolver
        }
        #[cfg(not(feature = "hickory-resolver"))]
        None => return Err(Error::NoTxtLookup),
    };

    // validate tags and fetch keys before touching the body
    let mut tasks = Vec::with_capacity(signatures.len());
    for (index, value) in signatures {
        trace!(index, "processing DKIM-Signature field");

        let mut verification = Verification::default();
        let prepared = match prepare_verification(&mut verification, &value, lookup_txt).await {
            Ok(prepared) => Some(prepared),
            Err(e) => {
                trace!(index, error = %e, "signature not verifiable");
                verification.error = Some(e);
                None
            }
        };

        tasks.push(SigTask {
            index,
            verification,
            prepared,
        });
    }

    // multicast the body to every per-signature hasher
    let mut chunk = [0; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for task in &mut tasks {
            if let Some(prepared) = &mut task.prepared {
                prepared.body_hasher.write(&chunk[..n]);
            }
        }
    }

    let mut verifications = Vec::with_capacity(tasks.len());
    for task in tasks {
        let mut verification = task.verification;
        if let Some(prepared) = task.prepared {
            if let Err(e) = check_signature(&header, task.index, prepared) {
                trace!(index = task.index, error = %e, "signature did not verify");
                verification.error = Some(e);
            }
        }
        verifications.push(verification);
    }

    if truncated {
        return Err(Error::TooManySignatures(verifications));
    }
    Ok(verifications)
}

struct SigTask {
    index: usize,
    verification: Verification,
    prepared: Option<PreparedSignature>,
}

struct PreparedSignature {
    header_canonicalization: Canonicalization,
    header_keys: Vec<String>,
    hash: HashAlgorithm,
    verifying_key: VerifyingKey,
    body_hash: Vec<u8>,
    signature_data: Vec<u8>,
    body_hasher: BodyHasher,
}

async fn prepare_verification(
    verification: &mut Verification,
    value: &[u8],
    lookup_txt: &dyn LookupTxt,
) -> Result<PreparedSignature, VerificationError> {
    let value = str::from_utf8(value).map_err(|_| VerificationError::MalformedTagList)?;
    let params = parse_tag_map(value).map_err(|_| VerificationError::MalformedTagList)?;

    if params.get("v").map(String::as_str) != Some("1") {
        return Err(VerificationError::IncompatibleVersion);
    }

    verification.domain = strip_whitespace(params.get("d").map(String::as_str).unwrap_or(""));

    for &tag in REQUIRED_TAGS {
        if !params.contains_key(tag) {
            return Err(VerificationError::MissingRequiredTag(tag));
        }
    }

    match params.get("i") {
        Some(identifier) => {
            verification.identifier = strip_whitespace(identifier);
            if !verification
                .identifier
                .ends_with(&format!("@{}", verification.domain))
                && !verification
                    .identifier
                    .ends_with(&format!(".{}", verification.domain))
            {
                return Err(VerificationError::DomainMismatch);
            }
        }
        None => verification.identifier = format!("@{}", verification.domain),
    }

    let header_keys = parse_colon_separated(&params["h"]);
    if !header_keys.iter().any(|k| k.eq_ignore_ascii_case("from")) {
        return Err(VerificationError::FromNotSigned);
    }
    verification.header_keys = header_keys.clone();

    if let Some(t) = params.get("t") {
        let t = strip_whitespace(t)
            .parse()
            .map_err(|_| VerificationError::MalformedTimestamp)?;
        verification.timestamp = Some(t);
    }
    if let Some(x) = params.get("x") {
        let x = strip_whitespace(x)
            .parse()
            .map_err(|_| VerificationError::MalformedExpiration)?;
        verification.expiration = Some(x);
        if unix_now() > x {
            return Err(VerificationError::SignatureExpired);
        }
    }

    let query_methods = params
        .get("q")
        .map(|q| parse_colon_separated(q))
        .unwrap_or_else(|| vec!["dns/txt".into()]);
    if !query_methods.iter().any(|m| m == "dns/txt") {
        return Err(VerificationError::UnsupportedQueryMethod);
    }

    let selector = strip_whitespace(&params["s"]);
    let record = query_key_record(lookup_txt, &verification.domain, &selector)
        .await
        .map_err(|e| match e {
            QueryError::NoRecord => VerificationError::NoKeyForSignature,
            QueryError::Temporary => VerificationError::KeyUnavailable,
            QueryError::Record(e) => VerificationError::KeyRecord(e),
        })?;

    let algorithm = strip_whitespace(&params["a"]);
    let (key_algorithm, hash_algorithm) = algorithm
        .split_once('-')
        .ok_or(VerificationError::MalformedAlgorithm)?;

    if let Some(hashes) = &record.hash_algorithms {
        if !hashes.iter().any(|h| h == hash_algorithm) {
            return Err(VerificationError::InappropriateHashAlgorithm);
        }
    }
    let hash = match hash_algorithm {
        // RFC 8301, §3.1: rsa-sha1 MUST NOT be used for signing or verifying
        "sha1" => return Err(VerificationError::HashAlgorithmTooWeak),
        "sha256" => HashAlgorithm::Sha256,
        _ => return Err(VerificationError::UnsupportedHashAlgorithm),
    };

    if record.key_type.canonical_str() != key_algorithm {
        return Err(VerificationError::InappropriateKeyAlgorithm);
    }

    if let Some(services) = &record.services {
        if !services.iter().any(|s| s == "email") {
            return Err(VerificationError::InappropriateService);
        }
    }

    if record.flags.iter().any(|f| f == "s") {
        // §3.6.1: flag s means the AUID must not be a subdomain of the SDID
        if !verification
            .identifier
            .ends_with(&format!("@{}", verification.domain))
        {
            return Err(VerificationError::IdentifierMismatch);
        }
    }

    let (header_canonicalization, body_canonicalization) =
        parse_canonicalization_modes(params.get("c").map(String::as_str).unwrap_or(""))?;

    let body_length = match params.get("l") {
        Some(l) => Some(
            strip_whitespace(l)
                .parse::<u64>()
                .map_err(|_| VerificationError::MalformedBodyLength)?,
        ),
        None => None,
    };
    verification.body_length = body_length;

    let body_hash = Base64::decode_vec(&strip_whitespace(&params["bh"]))
        .map_err(|_| VerificationError::MalformedBodyHash)?;
    let signature_data = Base64::decode_vec(&strip_whitespace(&params["b"]))
        .map_err(|_| VerificationError::MalformedSignatureData)?;

    Ok(PreparedSignature {
        header_canonicalization,
        header_keys,
        hash,
        verifying_key: record.verifying_key,
        body_hash,
        signature_data,
        body_hasher: BodyHasher::new(body_canonicalization, body_length),
    })
}

fn check_signature(
    header: &Header,
    index: usize,
    prepared: PreparedSignature,
) -> Result<(), VerificationError> {
    let PreparedSignature {
        header_canonicalization,
        header_keys,
        hash,
        verifying_key,
        body_hash,
        signature_data,
        body_hasher,
    } = prepared;

    let computed = body_hasher.finish();
    if !bool::from(computed.as_slice().ct_eq(&body_hash)) {
        return Err(VerificationError::BodyHashMismatch);
    }

    let mut hasher = Sha256::new();
    let mut picker = HeaderPicker::new(header);
    for key in &header_keys {
        // nonexistent signed fields contribute nothing to the hash
        if let Some(field) = picker.pick(key) {
            hasher.update(canonicalize_header(header_canonicalization, field));
        }
    }

    let sig_field = remove_signature(&header[index]);
    let mut sig_field = canonicalize_header(header_canonicalization, &sig_field);
    while matches!(sig_field.last(), Some(&(b'\r' | b'\n'))) {
        sig_field.pop();
    }
    hasher.update(&sig_field);

    let digest = hasher.finalize();

    verifying_key
        .verify(hash, &digest, &signature_data)
        .map_err(|_| VerificationError::SignatureMismatch)
}

fn parse_canonicalization_modes(
    value: &str,
) -> Result<(Canonicalization, Canonicalization), VerificationError> {
    let value = strip_whitespace(value);

    let (header, body) = match value.split_once('/') {
        Some((header, body)) => (header, Some(body)),
        None => (value.as_str(), None),
    };

    let header = if header.is_empty() {
        Canonicalization::Simple
    } else {
        Canonicalization::from_tag(header)
            .ok_or(VerificationError::UnsupportedHeaderCanonicalization)?
    };
    let body = match body {
        Some(body) => Canonicalization::from_tag(body)
            .ok_or(VerificationError::UnsupportedBodyCanonicalization)?,
        None => Canonicalization::Simple,
    };

    Ok((header, body))
}

// A canonicalizer chained into a hasher, with an optional l= byte budget;
// canonical bytes past the budget are discarded silently.
struct BodyHasher {
    canonicalizer: BodyCanonicalizer,
    hasher: Sha256,
    remaining: Option<u64>,
}

impl BodyHasher {
    fn new(canonicalization: Canonicalization, body_length: Option<u64>) -> Self {
        Self {
            canonicalizer: BodyCanonicalizer::new(canonicalization),
            hasher: Sha256::new(),
            remaining: body_length,
        }
    }

    fn write(&mut self, chunk: &[u8]) {
        let canonical = self.canonicalizer.canon_chunk(chunk);
        digest_limited(&mut self.hasher, &mut self.remaining, &canonical);
    }

    fn finish(self) -> Vec<u8> {
        let Self {
            canonicalizer,
            mut hasher,
            mut remaining,
        } = self;

        let tail = canonicalizer.finish();
        digest_limited(&mut hasher, &mut remaining, &tail);

        hasher.finalize().to_vec()
    }
}

fn digest_limited(hasher: &mut Sha256, remaining: &mut Option<u64>, bytes: &[u8]) {
    match remaining {
        Some(remaining) => {
            let take = (*remaining).min(bytes.len() as u64) as usize;
            hasher.update(&bytes[..take]);
            *remaining -= take as u64;
        }
        None => hasher.update(bytes),
    }
}

// Strips the value of the b= tag from a raw signature field, leaving the
// tag itself in place.
fn remove_signature(field: &[u8]) -> Vec<u8> {
    fn is_ws(b: u8) -> bool {
        matches!(b, b' ' | b'\t' | b'\r' | b'\n')
    }

    let mut result = Vec::with_capacity(field.len());
    let mut i = 0;

    while i < field.len() {
        if field[i] == b'b' {
            let mut j = i + 1;
            while j < field.len() && is_ws(field[j]) {
                j += 1;
            }
            if j < field.len() && field[j] == b'=' && j + 1 < field.len() && field[j + 1] != b';'
            {
                result.extend_from_slice(&field[i..=j]);
                i = j + 1;
                while i < field.len() && field[i] != b';' {
                    i += 1;
                }
                continue;
            }
        }
        result.push(field[i]);
        i += 1;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::BStr;

    #[test]
    fn remove_signature_ok() {
        let field = b"DKIM-Signature: v=1; b = AuUoFE/fDx+\r\n TDkH;\r\n d=example.org\r\n";

        assert_eq!(
            BStr::new(&remove_signature(field)),
            BStr::new(b"DKIM-Signature: v=1; b =;\r\n d=example.org\r\n")
        );
    }

    #[test]
    fn remove_signature_at_end_of_field() {
        let field = b"DKIM-Signature: v=1; d=example.org; b=AuUoFE\r\n";

        assert_eq!(
            BStr::new(&remove_signature(field)),
            BStr::new(b"DKIM-Signature: v=1; d=example.org; b=")
        );
    }

    #[test]
    fn parse_canonicalization_modes_ok() {
        use Canonicalization::{Relaxed, Simple};

        assert_eq!(parse_canonicalization_modes(""), Ok((Simple, Simple)));
        assert_eq!(parse_canonicalization_modes("simple"), Ok((Simple, Simple)));
        assert_eq!(
            parse_canonicalization_modes("relaxed"),
            Ok((Relaxed, Simple))
        );
        assert_eq!(
            parse_canonicalization_modes("relaxed/relaxed"),
            Ok((Relaxed, Relaxed))
        );
        assert_eq!(
            parse_canonicalization_modes("simple/relaxed"),
            Ok((Simple, Relaxed))
        );
        assert_eq!(
            parse_canonicalization_modes(" relaxed / simple "),
            Ok((Relaxed, Simple))
        );
        assert_eq!(
            parse_canonicalization_modes("pasta"),
            Err(VerificationError::UnsupportedHeaderCanonicalization)
        );
        assert_eq!(
            parse_canonicalization_modes("simple/potatoe"),
            Err(VerificationError::UnsupportedBodyCanonicalization)
        );
        assert_eq!(
            parse_canonicalization_modes("simple/"),
            Err(VerificationError::UnsupportedBodyCanonicalization)
        );
    }

    #[test]
    fn body_hasher_limits_input() {
        // l=0 must hash the empty body, not the whole body
        let mut limited = BodyHasher::new(Canonicalization::Simple, Some(0));
        limited.write(b"Hey\r\n");

        let empty = Sha256::digest(b"").to_vec();
        assert_eq!(limited.finish(), empty);

        let mut limited = BodyHasher::new(Canonicalization::Simple, Some(5));
        limited.write(b"Hey\r\n\r\n");

        assert_eq!(limited.finish(), Sha256::digest(b"Hey\r\n").to_vec());
    }

    #[test]
    fn error_kinds_are_exclusive() {
        let errors = [
            VerificationError::MalformedTagList,
            VerificationError::MissingRequiredTag("bh"),
            VerificationError::IdentifierMismatch,
            VerificationError::KeyRecord(KeyRecordError::RevokedKey),
            VerificationError::KeyUnavailable,
            VerificationError::BodyHashMismatch,
            VerificationError::SignatureMismatch,
        ];

        for error in errors {
            let classes = [
                error.is_perm_fail(),
                error.is_temp_fail(),
                error.is_signature_fail(),
            ];
            assert_eq!(
                classes.iter().filter(|&&c| c).count(),
                1,
                "error {error:?} not in exactly one class"
            );
        }
    }
}
