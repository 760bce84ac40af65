mod mediatype;
mod parser;

use std::fmt;

use crate::digest::Digest;

pub use mediatype::{InvalidMediaType, MediaType};

/// Hostname to use when the reference does not include a registry.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Namespace for single-component repositories in the default registry.
pub const DEFAULT_NAMESPACE: &str = "library";

pub const DEFAULT_TAG: &str = "latest";

/// Errors from [`ImageRef::parse`].
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("Missing repository.")]
    MissingRepository,

    #[error("Empty tag.")]
    EmptyTag,

    #[error("Invalid character {0:?}.")]
    InvalidCharacter(char),

    #[error("{0}")]
    InvalidDigest(#[from] crate::digest::DigestError),
}

/// Reference to an image in a registry.
///
/// The parser tries to be close to what `docker pull` does, but it keeps
/// track of which parts were written by the user. Missing parts are
/// filled by [`normalize_defaults`](Self::normalize_defaults):
///
/// * Without a registry hostname, Docker Hub is used, and the repository
///   namespace defaults to `library` if there is none.
/// * Without a tag or digest, the tag is `latest`.
///
/// # Examples
///
/// ```
/// # use ch_image::*;
/// let mut reference = ImageRef::parse("debian:10").unwrap();
/// assert_eq!(reference.to_string(), "debian:10");
///
/// reference.normalize_defaults();
/// assert_eq!(reference.to_string(), "registry-1.docker.io/library/debian:10");
/// assert_eq!(reference.for_path(), "registry-1.docker.io%library%debian:10");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    /// Address of the registry server, with its port if present.
    pub registry: Option<String>,

    /// Repository name, like `library/debian` or `nixos/nix`.
    pub repository: String,

    pub tag: Option<String>,

    /// Manifest digest, if present.
    pub digest: Option<Digest>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, ParseError> {
        parser::parse(reference)
    }

    /// Fill the parts that the user did not write.
    pub fn normalize_defaults(&mut self) {
        if self.registry.is_none() {
            self.registry = Some(DEFAULT_REGISTRY.to_owned());

            if !self.repository.contains('/') {
                self.repository.insert_str(0, "/");
                self.repository.insert_str(0, DEFAULT_NAMESPACE);
            }
        }

        if self.tag.is_none() && self.digest.is_none() {
            self.tag = Some(DEFAULT_TAG.to_owned());
        }
    }

    /// Like [`normalize_defaults`](Self::normalize_defaults), but return
    /// a new instance.
    pub fn normalized(&self) -> Self {
        let mut reference = self.clone();
        reference.normalize_defaults();
        reference
    }

    /// Address of the registry, or the default one.
    pub fn registry(&self) -> &str {
        self.registry.as_deref().unwrap_or(DEFAULT_REGISTRY)
    }

    /// Last component of the repository.
    pub fn name(&self) -> &str {
        self.repository
            .rsplit_once('/')
            .map(|s| s.1)
            .unwrap_or(&self.repository)
    }

    /// Value to request the manifest: the digest if present, else the tag.
    pub fn manifest_selector(&self) -> &str {
        match (&self.digest, &self.tag) {
            (Some(d), _) => d.source(),
            (None, Some(t)) => t,
            (None, None) => DEFAULT_TAG,
        }
    }

    /// Canonical form, usable as a file or directory name.
    pub fn for_path(&self) -> String {
        self.to_string().replace('/', "%")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }

        f.write_str(&self.repository)?;

        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }

        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }

        Ok(())
    }
}

impl std::str::FromStr for ImageRef {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parser::parse(s)
    }
}

#[test]
fn normalize_only_missing_parts() {
    let mut reference = ImageRef::parse("example.com:5000/foo").unwrap();
    reference.normalize_defaults();
    assert_eq!(reference.to_string(), "example.com:5000/foo:latest");

    let mut reference = ImageRef::parse("nixos/nix:2.3").unwrap();
    reference.normalize_defaults();
    assert_eq!(reference.to_string(), "registry-1.docker.io/nixos/nix:2.3");

    // Normalizing twice has no effect.
    let twice = reference.normalized();
    assert_eq!(twice, reference);
}

#[test]
fn digest_replaces_default_tag() {
    let hash = "a".repeat(64);
    let mut reference = ImageRef::parse(&format!("alpine@sha256:{hash}")).unwrap();
    reference.normalize_defaults();

    assert_eq!(reference.tag, None);
    assert_eq!(reference.manifest_selector(), format!("sha256:{hash}"));
    assert_eq!(
        reference.for_path(),
        format!("registry-1.docker.io%library%alpine@sha256:{hash}")
    );
}
