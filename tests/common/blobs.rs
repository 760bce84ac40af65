use std::{io::Write, path::Path};

use ch_image::MediaType;
use sha2::{Digest, Sha256};

/// Blob served by the test registry.
#[derive(Clone, Debug)]
pub struct Blob {
    pub media_type: MediaType,

    /// SHA256 of `data`, in hex.
    pub digest: String,

    pub data: Vec<u8>,
}

/// Descriptor of a blob, as written in a manifest.
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor<'a> {
    media_type: &'a str,
    digest: String,
    size: usize,
}

impl serde::Serialize for Blob {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Descriptor {
            media_type: self.media_type.as_str(),
            digest: format!("sha256:{}", self.digest),
            size: self.data.len(),
        }
        .serialize(serializer)
    }
}

impl Blob {
    pub fn new(media_type: MediaType, data: impl Into<Vec<u8>>) -> Blob {
        let data = data.into();

        Blob {
            media_type,
            digest: format!("{:x}", Sha256::digest(&data)),
            data,
        }
    }

    /// Keep the digest, but change the contents.
    pub fn corrupt(mut self) -> Blob {
        self.data = b"corrupted".to_vec();
        self
    }

    /// Start a layer. Its entries are compressed according to `media_type`
    /// when [`Layer::build`] is called.
    pub fn archive(media_type: MediaType) -> Layer {
        Layer {
            media_type,
            tar: tar::Builder::new(Vec::new()),
        }
    }
}

pub struct Layer {
    media_type: MediaType,
    tar: tar::Builder<Vec<u8>>,
}

impl Layer {
    pub fn build(self) -> Blob {
        let tarball = self.tar.into_inner().unwrap();

        let data = match self.media_type {
            MediaType::OciFsTarGzip | MediaType::DockerFsTarGzip => {
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), Default::default());
                encoder.write_all(&tarball).unwrap();
                encoder.finish().unwrap()
            }

            #[cfg(feature = "zstd")]
            MediaType::OciFsTarZstd => zstd::stream::encode_all(&tarball[..], 0).unwrap(),

            _ => tarball,
        };

        Blob::new(self.media_type, data)
    }

    fn append(mut self, kind: tar::EntryType, mode: u32, path: &Path, data: &[u8]) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(data.len() as u64);
        header.set_path(path).unwrap();
        header.set_cksum();

        self.tar.append(&header, data).unwrap();
        self
    }

    fn link(mut self, kind: tar::EntryType, path: &Path, target: &Path) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(if kind == tar::EntryType::Symlink { 0o777 } else { 0o644 });
        header.set_size(0);

        self.tar.append_link(&mut header, path, target).unwrap();
        self
    }

    pub fn directory(self, path: impl AsRef<Path>) -> Self {
        self.append(tar::EntryType::Directory, 0o755, path.as_ref(), b"")
    }

    pub fn regular(self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Self {
        self.append(tar::EntryType::Regular, 0o644, path.as_ref(), data.as_ref())
    }

    pub fn symlink(self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> Self {
        self.link(tar::EntryType::Symlink, path.as_ref(), target.as_ref())
    }

    pub fn hard_link(self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> Self {
        self.link(tar::EntryType::Link, path.as_ref(), target.as_ref())
    }

    /// Whiteout for `name` in `dir`.
    pub fn whiteout(self, dir: &str, name: &str) -> Self {
        self.regular(format!("{dir}/.wh.{name}"), "")
    }

    /// Opaque whiteout: `dir` is emptied before this layer.
    pub fn opaque(self, dir: &str) -> Self {
        self.regular(format!("{dir}/.wh..wh..opq"), "")
    }
}
