pub mod common;

use common::{crlf, MockLookup};
use maildkim::{
    sign, verify_with_options, Canonicalization, Error, SignOptions, VerificationError,
    VerifyOptions,
};

const MAIL_HEADER: &str = "From: Joe SixPack <joe@football.example.com>\r\n\
To: Suzie Q <suzie@shopping.example.net>\r\n\
Subject: Is dinner ready?\r\n\
Date: Fri, 11 Jul 2003 21:00:37 -0700 (PDT)\r\n\
Message-ID: <20030712040037.46341.5F8J@football.example.com>\r\n";

const MAIL_BODY: &str = "Hi.\r\n\
\r\n\
We lost the game. Are you hungry yet?\r\n\
\r\n\
Joe.";

fn mail() -> String {
    format!("{MAIL_HEADER}\r\n{MAIL_BODY}")
}

async fn sign_mail(message: &str, options: &SignOptions<'_>) -> Result<String, Error> {
    let _ = tracing_subscriber::fmt::try_init();

    let mut signed = Vec::new();
    sign(&mut signed, message.as_bytes(), options).await?;
    Ok(String::from_utf8(signed).unwrap())
}

async fn verify_mail(message: &str) -> Vec<maildkim::Verification> {
    let lookup = MockLookup;
    let options = VerifyOptions {
        lookup_txt: Some(&lookup),
        max_verifications: None,
    };

    verify_with_options(message.as_bytes(), &options).await.unwrap()
}

#[tokio::test]
async fn sign_rsa_output_shape() {
    let key = common::test_rsa_key();
    let mut options = SignOptions::new("example.org", "brisbane", &key);
    options.timestamp = Some(424242);

    let signed = sign_mail(&mail(), &options).await.unwrap();

    // the original message is emitted unchanged after the signature field
    assert!(signed.starts_with("DKIM-Signature:"));
    assert!(signed.ends_with(&mail()));

    let field = &signed[..signed.len() - mail().len()];

    assert!(field.contains(" v=1;"));
    assert!(field.contains(" a=rsa-sha256;"));
    assert!(field.contains(" c=simple/simple;"));
    assert!(field.contains(" d=example.org;"));
    assert!(field.contains(" s=brisbane;"));
    assert!(field.contains(" t=424242;"));
    assert!(field.contains(" h=From:To:Subject:Date:Message-ID;"));
    // body hash of the test message, §3.4.3 canonicalized
    assert!(field.contains(" bh=2jUSOH9NhtVGCQWNr9BrIAPreKQjO6Sn7XIkfJVOzv8=;"));
    assert!(field.contains("\r\n b="));

    for (i, line) in field.trim_end_matches("\r\n").split("\r\n").enumerate() {
        assert!(!line.is_empty(), "blank line inside signature field");
        assert!(line.len() <= 78, "overlong line {line:?}");
        if i > 0 {
            assert!(line.starts_with(' '), "unfolded continuation {line:?}");
        }
    }
}

#[tokio::test]
async fn sign_and_verify_rsa() {
    let key = common::test_rsa_key();
    let options = SignOptions::new("example.org", "brisbane", &key);

    let signed = sign_mail(&mail(), &options).await.unwrap();

    let verifications = verify_mail(&signed).await;

    assert_eq!(verifications.len(), 1);
    assert_eq!(verifications[0].error, None);
    assert_eq!(verifications[0].domain, "example.org");
    assert_eq!(verifications[0].identifier, "@example.org");
}

#[tokio::test]
async fn sign_and_verify_all_canonicalizations() {
    let key = common::test_rsa_key();

    for header_canonicalization in [Canonicalization::Simple, Canonicalization::Relaxed] {
        for body_canonicalization in [Canonicalization::Simple, Canonicalization::Relaxed] {
            let mut options = SignOptions::new("example.org", "brisbane", &key);
            options.header_canonicalization = header_canonicalization;
            options.body_canonicalization = body_canonicalization;

            let signed = sign_mail(&mail(), &options).await.unwrap();

            let verifications = verify_mail(&signed).await;

            assert_eq!(verifications.len(), 1);
            assert_eq!(
                verifications[0].error, None,
                "{header_canonicalization:?}/{body_canonicalization:?} did not round-trip"
            );
        }
    }
}

#[tokio::test]
async fn sign_and_verify_ed25519() {
    let key = common::test_ed25519_key();
    let mut options = SignOptions::new("football.example.com", "brisbane", &key);
    options.header_canonicalization = Canonicalization::Relaxed;
    options.body_canonicalization = Canonicalization::Relaxed;

    let signed = sign_mail(&mail(), &options).await.unwrap();
    assert!(signed.contains(" a=ed25519-sha256;"));

    let verifications = verify_mail(&signed).await;

    assert_eq!(verifications.len(), 1);
    assert_eq!(verifications[0].error, None);
    assert_eq!(verifications[0].domain, "football.example.com");
}

#[tokio::test]
async fn sign_with_selected_headers() {
    let key = common::test_rsa_key();
    let mut options = SignOptions::new("example.org", "brisbane", &key);
    options.header_keys = Some(vec!["From".into(), "Subject".into()]);
    options.identifier = Some("@example.org".into());
    options.query_methods = Some(vec!["dns/txt".into()]);

    let signed = sign_mail(&mail(), &options).await.unwrap();
    assert!(signed.contains(" h=From:Subject;"));
    assert!(signed.contains(" q=dns/txt;"));

    let verifications = verify_mail(&signed).await;

    assert_eq!(verifications.len(), 1);
    assert_eq!(verifications[0].error, None);
    assert_eq!(
        verifications[0].header_keys,
        vec!["From".to_string(), "Subject".to_string()]
    );
}

#[tokio::test]
async fn sign_with_expiration_in_the_past() {
    let key = common::test_rsa_key();
    let mut options = SignOptions::new("example.org", "brisbane", &key);
    options.timestamp = Some(424242);
    options.expiration = Some(424243);

    let signed = sign_mail(&mail(), &options).await.unwrap();

    let verifications = verify_mail(&signed).await;

    assert_eq!(verifications.len(), 1);
    assert_eq!(verifications[0].expiration, Some(424243));
    assert_eq!(
        verifications[0].error,
        Some(VerificationError::SignatureExpired)
    );
}

#[tokio::test]
async fn sign_accepts_lf_line_endings() {
    let key = common::test_rsa_key();
    let options = SignOptions::new("example.org", "brisbane", &key);

    let lf_mail = mail().replace("\r\n", "\n");
    let signed = sign_mail(&lf_mail, &options).await.unwrap();

    // header fields are stored CRLF-terminated; the body is kept verbatim
    assert!(signed.contains("From: Joe SixPack <joe@football.example.com>\r\n"));

    let verifications = verify_mail(&signed).await;

    assert_eq!(verifications.len(), 1);
    assert_eq!(verifications[0].error, None);
}

#[tokio::test]
async fn sign_invalid_options() {
    let key = common::test_rsa_key();

    let mut options = SignOptions::new("", "brisbane", &key);
    assert!(matches!(
        sign_mail(&mail(), &options).await,
        Err(Error::MissingDomain)
    ));

    options.domain = "example.org".into();
    options.selector = String::new();
    assert!(matches!(
        sign_mail(&mail(), &options).await,
        Err(Error::MissingSelector)
    ));

    options.selector = "brisbane".into();
    options.header_keys = Some(vec!["To".into()]);
    assert!(matches!(
        sign_mail(&mail(), &options).await,
        Err(Error::FromNotSigned)
    ));
}

#[tokio::test]
async fn sign_incomplete_message() {
    let key = common::test_rsa_key();
    let options = SignOptions::new("example.org", "brisbane", &key);

    assert!(matches!(
        sign_mail("From: joe@example.org\r\nTo", &options).await,
        Err(Error::IncompleteHeader)
    ));
}

#[tokio::test]
async fn sign_minimal_message() {
    let key = common::test_rsa_key();
    let options = SignOptions::new("example.org", "brisbane", &key);

    let message = crlf("From: joe@example.org\nSubject: hello\n\nbody\n");
    let signed = sign_mail(&message, &options).await.unwrap();

    let verifications = verify_mail(&signed).await;
    assert_eq!(verifications[0].error, None);
}
