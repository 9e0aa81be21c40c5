//! Message signing.

use crate::{
    canonicalize::{canonicalize_header, BodyCanonicalizer, Canonicalization},
    crypto::{HashAlgorithm, SigningKey},
    header::{parse_header_field, read_header, write_header, HeaderPicker},
    tag_list::{format_signature_field, TagMap},
    unix_now, Error,
};
use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

/// Options for [`sign`]. Domain, selector and signing key are mandatory and
/// set through [`new`][SignOptions::new]; everything else has a usable
/// default.
pub struct SignOptions<'a> {
    /// The SDID claiming responsibility for an introduction of the message
    /// into the mail stream, used to form the public key query. Must be a
    /// valid DNS name under which the key record is published.
    pub domain: String,
    /// The selector subdividing the namespace for the domain.
    pub selector: String,
    /// The Agent or User Identifier (AUID) on behalf of which the SDID is
    /// taking responsibility, for the `i=` tag.
    pub identifier: Option<String>,
    /// The key used to sign the message.
    pub signer: &'a SigningKey,
    /// The hash algorithm used to sign the message.
    pub hash: HashAlgorithm,
    /// Header canonicalization algorithm.
    pub header_canonicalization: Canonicalization,
    /// Body canonicalization algorithm.
    pub body_canonicalization: Canonicalization,
    /// The header fields to include in the signature. When `None`, every
    /// header field present is signed. When given, the list must contain
    /// `From`.
    ///
    /// See RFC 6376, §5.4.1 for recommended header fields.
    pub header_keys: Option<Vec<String>>,
    /// The expiration time as Unix seconds, for the `x=` tag.
    pub expiration: Option<u64>,
    /// The signing time recorded in the `t=` tag. The current time when
    /// `None`; fix it to make the output reproducible.
    pub timestamp: Option<u64>,
    /// Query methods used to retrieve the public key, for the `q=` tag.
    pub query_methods: Option<Vec<String>>,
}

impl<'a> SignOptions<'a> {
    pub fn new(
        domain: impl Into<String>,
        selector: impl Into<String>,
        signer: &'a SigningKey,
    ) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            identifier: None,
            signer,
            hash: HashAlgorithm::Sha256,
            header_canonicalization: Canonicalization::Simple,
            body_canonicalization: Canonicalization::Simple,
            header_keys: None,
            expiration: None,
            timestamp: None,
            query_methods: None,
        }
    }
}

/// Signs a message. The message is read from `reader` and its signed
/// version, with a folded `DKIM-Signature` field prepended to the otherwise
/// unchanged bytes, is written to `writer`.
pub async fn sign<W, R>(writer: W, reader: R, options: &SignOptions<'_>) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    if options.domain.is_empty() {
        return Err(Error::MissingDomain);
    }
    if options.selector.is_empty() {
        return Err(Error::MissingSelector);
    }
    if let Some(keys) = &options.header_keys {
        if !keys.iter().any(|k| k.eq_ignore_ascii_case("from")) {
            return Err(Error::FromNotSigned);
        }
    }

    let mut writer = writer;
    let mut reader = BufReader::new(reader);

    let header = read_header(&mut reader).await?;

    // hash the body, keeping a copy for the final output
    let mut body = Vec::new();
    let mut body_canonicalizer = BodyCanonicalizer::new(options.body_canonicalization);
    let mut hasher = Sha256::new();
    let mut chunk = [0; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
        hasher.update(body_canonicalizer.canon_chunk(&chunk[..n]));
    }
    hasher.update(body_canonicalizer.finish());
    let body_hash = hasher.finalize();

    let header_keys: Vec<String> = match &options.header_keys {
        Some(keys) => keys.clone(),
        None => header
            .iter()
            .map(|field| {
                let (name, _) = parse_header_field(field);
                String::from_utf8_lossy(name).into_owned()
            })
            .collect(),
    };

    let mut params = TagMap::new();
    params.insert("v".into(), "1".into());
    params.insert(
        "a".into(),
        format!(
            "{}-{}",
            options.signer.key_type().canonical_str(),
            options.hash.canonical_str()
        ),
    );
    params.insert("bh".into(), Base64::encode_string(&body_hash));
    params.insert(
        "c".into(),
        format!(
            "{}/{}",
            options.header_canonicalization.canonical_str(),
            options.body_canonicalization.canonical_str()
        ),
    );
    params.insert("d".into(), options.domain.clone());
    params.insert("s".into(), options.selector.clone());
    params.insert(
        "t".into(),
        options.timestamp.unwrap_or_else(unix_now).to_string(),
    );
    params.insert("h".into(), header_keys.join(":"));
    if let Some(identifier) = &options.identifier {
        params.insert("i".into(), identifier.clone());
    }
    if let Some(methods) = &options.query_methods {
        params.insert("q".into(), methods.join(":"));
    }
    if let Some(expiration) = options.expiration {
        params.insert("x".into(), expiration.to_string());
    }

    // hash the selected headers
    let mut hasher = Sha256::new();
    let mut picker = HeaderPicker::new(&header);
    for key in &header_keys {
        if let Some(field) = picker.pick(key) {
            hasher.update(canonicalize_header(options.header_canonicalization, field));
        }
    }

    // then the draft signature field itself, with an empty b= value
    params.insert("b".into(), String::new());
    let draft = format!("{}\r\n", format_signature_field(&params));
    let mut draft = canonicalize_header(options.header_canonicalization, draft.as_bytes());
    while matches!(draft.last(), Some(&(b'\r' | b'\n'))) {
        draft.pop();
    }
    hasher.update(&draft);
    let digest = hasher.finalize();

    let signature = options
        .signer
        .sign(options.hash, &digest)
        .map_err(|_| Error::SigningFailure)?;
    params.insert("b".into(), Base64::encode_string(&signature));

    trace!(
        domain = %options.domain,
        selector = %options.selector,
        "message signed"
    );

    let signature_field = format!("{}\r\n", format_signature_field(&params));
    writer.write_all(signature_field.as_bytes()).await?;
    write_header(&mut writer, &header).await?;
    writer.write_all(&body).await?;

    Ok(())
}
