use std::{
    fmt,
    io::{self, Read, Write},
};

use sha2::Digest as _;

/// Algorithm to compute the hash value of a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DigestAlgorithm {
    SHA256,
    SHA512,
}

impl DigestAlgorithm {
    const ALL: [DigestAlgorithm; 2] = [DigestAlgorithm::SHA256, DigestAlgorithm::SHA512];

    /// Prefix in digest strings, with the `:` separator.
    fn prefix(self) -> &'static str {
        match self {
            DigestAlgorithm::SHA256 => "sha256:",
            DigestAlgorithm::SHA512 => "sha512:",
        }
    }

    /// Length of the hash value, in hex digits.
    fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::SHA256 => 64,
            DigestAlgorithm::SHA512 => 128,
        }
    }

    fn hasher(self) -> Box<dyn digest::DynDigest + Send> {
        match self {
            DigestAlgorithm::SHA256 => Box::new(sha2::Sha256::new()),
            DigestAlgorithm::SHA512 => Box::new(sha2::Sha512::new()),
        }
    }
}

/// Content address of a blob, like `sha256:<hex>`.
///
/// # Examples
///
/// ```
/// # use ch_image::*;
/// const HASH: &str = "123456789012345678901234567890123456789012345678901234567890abcd";
///
/// let digest = Digest::try_from(format!("sha256:{HASH}")).unwrap();
/// assert_eq!(digest.algorithm(), DigestAlgorithm::SHA256);
/// assert_eq!(digest.hash_value(), HASH);
/// assert_eq!(digest.to_string(), format!("sha256:{HASH}"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(try_from = "String")]
pub struct Digest {
    source: String,
    algorithm: DigestAlgorithm,
}

#[derive(thiserror::Error, Debug)]
pub enum DigestError {
    #[error("Invalid digest algorithm.")]
    InvalidAlgorithm,

    #[error("Invalid digest value.")]
    InvalidValue,
}

impl Digest {
    /// Build a SHA256 digest from a computed hash.
    pub(crate) fn sha256(hash: impl AsRef<[u8]>) -> Self {
        Digest {
            source: format!("sha256:{}", HexString(hash)),
            algorithm: DigestAlgorithm::SHA256,
        }
    }

    /// Full string, `algorithm:hash_value`.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn hash_value(&self) -> &str {
        &self.source[self.algorithm.prefix().len()..]
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Wrap `reader` to check its data against this digest.
    ///
    /// The hash is compared when `reader` reaches EOF. If it does not
    /// match, the read fails with
    /// [`InvalidData`](::std::io::ErrorKind::InvalidData).
    pub fn wrap_reader<R: Read>(&self, reader: R) -> impl Read {
        VerifyingReader {
            hasher: self.algorithm.hasher(),
            expected: self.hash_value().to_ascii_lowercase(),
            reader,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        let algorithm = DigestAlgorithm::ALL
            .into_iter()
            .find(|a| source.starts_with(a.prefix()))
            .ok_or(DigestError::InvalidAlgorithm)?;

        let value = &source[algorithm.prefix().len()..];
        if value.len() != algorithm.hex_len() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::InvalidValue);
        }

        Ok(Digest { source, algorithm })
    }
}

struct VerifyingReader<R> {
    hasher: Box<dyn digest::DynDigest + Send>,
    expected: String,
    reader: R,
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;

        if n > 0 {
            self.hasher.update(&buf[..n]);
        } else if !buf.is_empty() {
            self.verify()?;
        }

        Ok(n)
    }
}

impl<R> VerifyingReader<R> {
    fn verify(&mut self) -> io::Result<()> {
        let computed = HexString(self.hasher.finalize_reset()).to_string();

        if computed == self.expected {
            return Ok(());
        }

        let msg = format!("Invalid digest. Expected {}, got {computed}.", self.expected);
        Err(io::Error::new(io::ErrorKind::InvalidData, msg))
    }
}

/// `Write` adapter to compute the SHA256 hash, and the length, of the
/// data written to `inner`.
pub(crate) struct HashingWriter<W> {
    hasher: sha2::Sha256,
    length: u64,
    inner: W,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        HashingWriter {
            hasher: sha2::Sha256::new(),
            length: 0,
            inner,
        }
    }

    /// Return the inner writer, the digest, and the number of bytes written.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::sha256(self.hasher.finalize()), self.length)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.length += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Encode a byte buffer as hex string.
pub(crate) struct HexString<T>(pub T);

impl<T: AsRef<[u8]>> fmt::Display for HexString<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0
            .as_ref()
            .iter()
            .try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}

#[test]
fn encode_hex_bytes() {
    assert_eq!(HexString(b"\x01\x20\xf0").to_string(), "0120f0");
}

/// SHA256 of `abc`.
#[cfg(test)]
const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

#[test]
fn verify_data_on_eof() {
    let digest = Digest::try_from(format!("sha256:{ABC_SHA256}")).unwrap();

    let mut output = String::new();
    let mut reader = digest.wrap_reader(&b"abc"[..]);
    reader.read_to_string(&mut output).unwrap();
    assert_eq!(output, "abc");

    let err = io::copy(&mut digest.wrap_reader(&b"abcx"[..]), &mut io::sink()).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    // Both values are in the message.
    let msg = err.to_string();
    assert!(msg.contains(ABC_SHA256), "{msg}");
    assert!(msg.contains("7571ce1f8e21c6b13dd7ec2c5ec7c9e4dd9852e209869511853f2f1f74b17927"));
}

#[test]
fn parse_digest_strings() {
    let sha512 = format!("sha512:{}", "0f".repeat(64));
    assert_eq!(
        Digest::try_from(sha512).unwrap().algorithm(),
        DigestAlgorithm::SHA512
    );

    assert!(matches!(
        Digest::try_from(format!("md5:{}", "0".repeat(32))),
        Err(DigestError::InvalidAlgorithm)
    ));

    for value in ["0".repeat(63), "g".repeat(64), "0".repeat(128)] {
        assert!(matches!(
            Digest::try_from(format!("sha256:{value}")),
            Err(DigestError::InvalidValue)
        ));
    }
}

#[test]
fn hashing_writer_matches_reader() {
    let mut writer = HashingWriter::new(Vec::new());
    writer.write_all(b"abc").unwrap();

    let (data, digest, length) = writer.finish();
    assert_eq!(data, b"abc");
    assert_eq!(length, 3);
    assert_eq!(digest.hash_value(), ABC_SHA256);
}
