//! The DNS TXT lookup capability used during verification.

use std::{future::Future, io, pin::Pin};

/// The future returned by [`LookupTxt::lookup_txt`], yielding the TXT
/// strings found at the queried name.
pub type LookupFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<String>>> + Send + 'a>>;

/// A DNS TXT resolver.
///
/// Key lookup failures are classified by [`io::ErrorKind`]: a name with no
/// TXT records must be reported as [`NotFound`][io::ErrorKind::NotFound]
/// (a permanent failure), while transient conditions such as
/// [`TimedOut`][io::ErrorKind::TimedOut] become temporary failures.
///
/// An implementation for `hickory_resolver::TokioAsyncResolver` is provided
/// with the `hickory-resolver` feature.
pub trait LookupTxt: Send + Sync {
    fn lookup_txt<'a>(&'a self, name: &'a str) -> LookupFuture<'a>;
}

#[cfg(feature = "hickory-resolver")]
impl LookupTxt for hickory_resolver::TokioAsyncResolver {
    fn lookup_txt<'a>(&'a self, name: &'a str) -> LookupFuture<'a> {
        use hickory_resolver::error::ResolveErrorKind;
        use std::io::ErrorKind;

        Box::pin(async move {
            let lookup = self.txt_lookup(name).await.map_err(|e| match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => io::Error::from(ErrorKind::NotFound),
                ResolveErrorKind::Timeout => io::Error::from(ErrorKind::TimedOut),
                _ => io::Error::new(ErrorKind::Other, e.to_string()),
            })?;

            let mut txts = Vec::new();
            for txt in lookup.iter() {
                // each record may itself be split into character-strings
                let data = txt.txt_data().concat();
                let s = String::from_utf8(data)
                    .map_err(|_| io::Error::from(ErrorKind::InvalidData))?;
                txts.push(s);
            }

            Ok(txts)
        })
    }
}
