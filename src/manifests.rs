//! Image manifests, as stored in the download cache and sent to registries.
//!
//! Refs:
//!
//! * https://distribution.github.io/distribution/spec/manifest-v2-2/
//! * https://github.com/opencontainers/image-spec/blob/main/manifest.md

use crate::{digest::Digest, MediaType};

/// Descriptor of a blob (config or layer) in a manifest.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub media_type: MediaType,
    pub digest: Digest,
    pub size: u64,
}

/// Image manifest with the configuration blob and the list of layers.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default = "schema_version")]
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    pub config: Blob,

    pub layers: Vec<Blob>,
}

fn schema_version() -> u32 {
    2
}

impl Manifest {
    /// Build an OCI manifest for a config blob and its layers.
    pub fn new(config: Blob, layers: Vec<Blob>) -> Self {
        Manifest {
            schema_version: schema_version(),
            media_type: Some(MediaType::OciManifestV1),
            config,
            layers,
        }
    }

    /// Total size, in bytes, of the blobs referenced by the manifest.
    pub fn blobs_size(&self) -> u64 {
        self.layers.iter().fold(self.config.size, |a, l| a + l.size)
    }

    /// Serialize the manifest. The same bytes are written to the staging
    /// cache and sent to the registry, so both have the same digest.
    pub fn encode(self) -> Result<EncodedManifest, serde_json::Error> {
        let data = serde_json::to_vec_pretty(&self)?;

        Ok(EncodedManifest {
            media_type: self.media_type.unwrap_or(MediaType::OciManifestV1),
            manifest: self,
            data,
        })
    }
}

/// A [`Manifest`] with its JSON representation.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedManifest {
    pub manifest: Manifest,

    /// Value for the `Content-Type` header.
    pub media_type: MediaType,

    pub data: Vec<u8>,
}

#[test]
fn parse_docker_manifest() {
    let json = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1469,
            "digest": "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 27092228,
                "digest": "sha256:7571ce1f8e21c6b13dd7ec2c5ec7c9e4dd9852e209869511853f2f1f74b17927"
            }
        ]
    }"#;

    let manifest: Manifest = serde_json::from_str(json).unwrap();

    assert_eq!(manifest.media_type, Some(MediaType::DockerManifestV2));
    assert_eq!(manifest.config.media_type, MediaType::DockerImageV1);
    assert_eq!(manifest.layers.len(), 1);
    assert_eq!(manifest.blobs_size(), 1469 + 27092228);

    // Manifests written to the cache can be read back.
    let cached = serde_json::to_vec(&manifest).unwrap();
    assert_eq!(serde_json::from_slice::<Manifest>(&cached).unwrap(), manifest);
}

#[test]
fn encode_for_upload() {
    let blob = |media_type, hex: &str| Blob {
        media_type,
        digest: crate::Digest::try_from(format!("sha256:{}", hex.repeat(32))).unwrap(),
        size: 10,
    };

    let manifest = Manifest::new(
        blob(MediaType::OciConfig, "0a"),
        vec![blob(MediaType::OciFsTarGzip, "0b")],
    );

    let encoded = manifest.clone().encode().unwrap();
    assert_eq!(encoded.media_type, MediaType::OciManifestV1);
    assert_eq!(encoded.manifest, manifest);
    assert_eq!(serde_json::from_slice::<Manifest>(&encoded.data).unwrap(), manifest);
}
