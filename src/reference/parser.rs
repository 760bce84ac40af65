//! Parse a reference to an image in a registry.
//!
//! It tries to be close to what `docker pull` does, but it does not try
//! to be bug-for-bug compatible.

use super::*;

type Result<T> = std::result::Result<T, ParseError>;

pub(super) fn parse(reference: &str) -> Result<ImageRef> {
    let reference = reference.trim();

    // Extract the digest after the last `@`.
    let (base, digest) = match reference.rsplit_once('@') {
        None => (reference, None),
        Some((base, d)) => (base, Some(Digest::try_from(d.to_owned())?)),
    };

    // Extract the tag after the last `:`.
    //
    // If the value contains a `/`, it assumes that the value after `:`
    // is a port number, and not a tag.
    let (base, tag) = match base.rsplit_once(':') {
        Some((_, "")) => return Err(ParseError::EmptyTag),
        Some((base, tag)) if !tag.contains('/') => (base, Some(tag)),
        _ => (base, None),
    };

    // The first component is a registry if it looks like a hostname.
    let (registry, repository) = match base.split_once('/') {
        Some((registry, repository))
            if registry.contains(['.', ':']) || registry == "localhost" =>
        {
            (Some(registry), repository)
        }

        _ => (None, base),
    };

    if repository.is_empty() || repository.split('/').any(str::is_empty) {
        return Err(ParseError::MissingRepository);
    }

    if let Some(c) = repository
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '-' | '/'))
    {
        return Err(ParseError::InvalidCharacter(c));
    }

    if let Some(c) = tag
        .into_iter()
        .flat_map(str::chars)
        .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-'))
    {
        return Err(ParseError::InvalidCharacter(c));
    }

    Ok(ImageRef {
        registry: registry.map(str::to_owned),
        repository: repository.to_owned(),
        tag: tag.map(str::to_owned),
        digest,
    })
}

#[test]
fn parse_valid_references() {
    use crate::digest::HexString;
    use sha2::{Digest as _, Sha256, Sha512};

    macro_rules! check {
        ($reference:expr, [ $registry:expr, $repository:expr, $tag:expr, $digest:expr ]) => {
            let reference = $reference;
            assert_eq!(
                ImageRef::parse(<_ as AsRef<str>>::as_ref(&reference)).unwrap(),
                ImageRef {
                    registry: $registry.map(String::from),
                    repository: String::from($repository),
                    tag: $tag.map(String::from),
                    digest: $digest,
                }
            )
        };
    }

    let sha256 = HexString(Sha256::digest(b"\x00\x01"));
    let sha512 = HexString(Sha512::digest(b"\x01\x02"));

    check!("foo", [None::<&str>, "foo", None::<&str>, None]);

    check!("foo/bar", [None::<&str>, "foo/bar", None::<&str>, None]);

    check!(
        "localhost/foo:1",
        [Some("localhost"), "foo", Some("1"), None]
    );

    check!(
        "example.com:5678/foo/bar:1.2.3",
        [Some("example.com:5678"), "foo/bar", Some("1.2.3"), None]
    );

    check!(
        "example.com:5678/foo/bar",
        [Some("example.com:5678"), "foo/bar", None::<&str>, None]
    );

    check!(
        &format!("example.com/foo/bar:1.2.3@sha256:{sha256}"),
        [
            Some("example.com"),
            "foo/bar",
            Some("1.2.3"),
            Digest::try_from(format!("sha256:{sha256}")).ok()
        ]
    );

    check!(
        &format!("example.com:1234/foo/bar@sha512:{sha512}"),
        [
            Some("example.com:1234"),
            "foo/bar",
            None::<&str>,
            Digest::try_from(format!("sha512:{sha512}")).ok()
        ]
    );
}

#[test]
fn reject_invalid_references() {
    use crate::digest::DigestError;

    assert!(matches!(
        ImageRef::parse(""),
        Err(ParseError::MissingRepository)
    ));

    assert!(matches!(
        ImageRef::parse("example.com/"),
        Err(ParseError::MissingRepository)
    ));

    assert!(matches!(
        ImageRef::parse("foo//bar"),
        Err(ParseError::MissingRepository)
    ));

    assert!(matches!(ImageRef::parse("debian:"), Err(ParseError::EmptyTag)));

    assert!(matches!(
        ImageRef::parse("Debian:10"),
        Err(ParseError::InvalidCharacter('D'))
    ));

    assert!(matches!(
        ImageRef::parse("debian:1 0"),
        Err(ParseError::InvalidCharacter(' '))
    ));

    assert!(matches!(
        ImageRef::parse("debian:stable@md5:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidAlgorithm)),
    ));

    assert!(matches!(
        ImageRef::parse("debian:stable@sha256:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidValue)),
    ));
}
