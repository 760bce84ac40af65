use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use flate2::{write::GzEncoder, Compression};
use tracing::warn;

use crate::{
    digest::{Digest, HashingWriter},
    error::try_io,
    manifests::Blob,
    registry,
    storage::blob_path,
    Error, MediaType,
};

use super::{Artifact, BlobFile};

/// Image configuration, with the fields required by registries.
///
/// See <https://github.com/opencontainers/image-spec/blob/main/config.md>.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct ImageConfig {
    architecture: String,
    os: String,
    rootfs: RootFs,
}

#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct RootFs {
    #[serde(rename = "type")]
    kind: String,
    diff_ids: Vec<Digest>,
}

/// Digests and size of a layer written by [`write_layer`].
struct LayerDigests {
    diff_id: Digest,
    digest: Digest,
    size: u64,
}

/// Pack `source` in a single gzip layer, and write it with its
/// configuration to `staging`.
pub(super) fn archive(source: &Path, staging: &Path) -> Result<Artifact, Error> {
    try_io!(staging, fs::create_dir_all(staging));

    let partial = staging.join(format!(".layer-{}.partial", std::process::id()));

    let layer = match write_layer(source, &partial) {
        Ok(layer) => layer,
        Err(e) => {
            if let Err(e) = fs::remove_file(&partial) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), "can't remove partial layer: {e}");
                }
            }

            return Err(e);
        }
    };

    let layer_path = blob_path(staging, &layer.digest);
    try_io!(&layer_path, fs::rename(&partial, &layer_path));

    let config = ImageConfig {
        architecture: registry::host_architecture().to_owned(),
        os: std::env::consts::OS.to_owned(),
        rootfs: RootFs {
            kind: "layers".to_owned(),
            diff_ids: vec![layer.diff_id],
        },
    };

    let mut writer = HashingWriter::new(Vec::new());
    serde_json::to_writer(&mut writer, &config)?;
    let (data, digest, size) = writer.finish();

    let config_path = blob_path(staging, &digest);
    try_io!(&config_path, fs::write(&config_path, data));

    Ok(Artifact {
        config: BlobFile {
            blob: Blob {
                media_type: MediaType::OciConfig,
                digest,
                size,
            },
            path: config_path,
        },
        layers: vec![BlobFile {
            blob: Blob {
                media_type: MediaType::OciFsTarGzip,
                digest: layer.digest,
                size: layer.size,
            },
            path: layer_path,
        }],
    })
}

/// Write the gzip tarball of `source` to `output`.
///
/// The digest of the uncompressed tarball is the `diff_id` of the
/// layer. The digest of the compressed data is the blob address.
fn write_layer(source: &Path, output: &Path) -> Result<LayerDigests, Error> {
    let file = try_io!(output, File::create(output));

    let compressed = HashingWriter::new(BufWriter::new(file));
    let uncompressed = HashingWriter::new(GzEncoder::new(compressed, Compression::default()));

    let mut builder = tar::Builder::new(uncompressed);
    append_tree(&mut builder, source, Path::new("."))?;

    let uncompressed = try_io!(output, builder.into_inner());
    let (encoder, diff_id, _) = uncompressed.finish();

    let compressed = try_io!(output, encoder.finish());
    let (mut file, digest, size) = compressed.finish();
    try_io!(output, file.flush());

    Ok(LayerDigests {
        diff_id,
        digest,
        size,
    })
}

/// Add `root/path` to the archive, and its children if it is a directory.
///
/// Headers keep the permission bits (including SUID, SGID, and sticky).
/// Owners are reset to `root`, and timestamps are fixed, so the same tree
/// always produces the same tarball. Entries other than directories,
/// regular files, and symlinks are skipped.
fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    path: &Path,
) -> Result<(), Error> {
    let full_path = root.join(path);
    let metadata = try_io!(&full_path, fs::symlink_metadata(&full_path));
    let file_type = metadata.file_type();

    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&metadata, tar::HeaderMode::Deterministic);
    header.set_mode(metadata.permissions().mode() & 0o7777);

    if file_type.is_dir() {
        try_io!(&full_path, builder.append_data(&mut header, path, io::empty()));

        let mut children = Vec::new();
        for entry in try_io!(&full_path, fs::read_dir(&full_path)) {
            children.push(try_io!(&full_path, entry).file_name());
        }

        children.sort();

        for name in children {
            append_tree(builder, root, &path.join(name))?;
        }
    } else if file_type.is_file() {
        let file = try_io!(&full_path, File::open(&full_path));
        try_io!(&full_path, builder.append_data(&mut header, path, file));
    } else if file_type.is_symlink() {
        let target = try_io!(&full_path, fs::read_link(&full_path));
        try_io!(&full_path, builder.append_link(&mut header, path, target));
    }

    Ok(())
}

#[test]
fn archive_and_unpack_directory() {
    use std::os::unix::fs::symlink;

    use super::{Archiver, TarArchiver};

    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();

    fs::create_dir_all(source.path().join("etc/apt")).unwrap();
    fs::write(source.path().join("etc/debian_version"), "10.13\n").unwrap();
    fs::write(source.path().join("etc/apt/sources.list"), "deb x\n").unwrap();
    fs::set_permissions(
        source.path().join("etc/apt/sources.list"),
        fs::Permissions::from_mode(0o644),
    )
    .unwrap();
    symlink("debian_version", source.path().join("etc/version")).unwrap();

    let archiver = TarArchiver::new();
    let artifact = archiver.archive(source.path(), staging.path()).unwrap();

    // Both blobs are content-addressed files in the staging directory.
    let blobs: Vec<_> = artifact.blobs().collect();
    assert_eq!(blobs.len(), 2);
    for blob in &blobs {
        assert!(blob.path.starts_with(staging.path()));
        assert_eq!(fs::metadata(&blob.path).unwrap().len(), blob.blob.size);
    }

    let config: ImageConfig =
        serde_json::from_slice(&fs::read(&artifact.config.path).unwrap()).unwrap();
    assert_eq!(config.rootfs.kind, "layers");
    assert_eq!(config.rootfs.diff_ids.len(), 1);
    assert_ne!(config.rootfs.diff_ids[0], artifact.layers[0].blob.digest);

    // No partial files are left behind.
    let names: Vec<_> = fs::read_dir(staging.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert!(names.iter().all(|n| n.ends_with(".blob")), "{names:?}");

    archiver.unpack(&artifact.layers, target.path()).unwrap();

    assert_eq!(
        fs::read_to_string(target.path().join("etc/debian_version")).unwrap(),
        "10.13\n"
    );
    assert_eq!(
        fs::read_link(target.path().join("etc/version")).unwrap(),
        Path::new("debian_version")
    );

    let mode = fs::metadata(target.path().join("etc/apt/sources.list"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o644);
}

#[cfg(test)]
fn file_mode(path: impl AsRef<Path>) -> u32 {
    fs::symlink_metadata(path).unwrap().permissions().mode() & 0o7777
}

#[test]
fn keep_permission_bits() {
    use super::{Archiver, TarArchiver};

    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();

    let modes = [
        ("etc/shadow", 0o600),
        ("usr/bin/sudo", 0o4755),
        ("usr/bin/wall", 0o2755),
        ("tmp", 0o1777),
    ];

    fs::create_dir_all(source.path().join("etc")).unwrap();
    fs::create_dir_all(source.path().join("usr/bin")).unwrap();
    fs::create_dir_all(source.path().join("tmp")).unwrap();

    for (path, mode) in modes {
        let path = source.path().join(path);
        if !path.exists() {
            fs::write(&path, "x").unwrap();
        }

        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    let archiver = TarArchiver::new();
    let artifact = archiver.archive(source.path(), staging.path()).unwrap();
    archiver.unpack(&artifact.layers, target.path()).unwrap();

    for (path, mode) in modes {
        assert_eq!(file_mode(target.path().join(path)), mode, "{path}");
    }

    // The same tree produces the same layer.
    let again = tempfile::tempdir().unwrap();
    let second = archiver.archive(source.path(), again.path()).unwrap();
    assert_eq!(second.layers[0].blob.digest, artifact.layers[0].blob.digest);
}

#[test]
fn remove_partial_layer_on_error() {
    let staging = tempfile::tempdir().unwrap();
    let missing = staging.path().join("missing");

    assert!(matches!(
        archive(&missing, staging.path()),
        Err(Error::Filesystem(_, p)) if p.starts_with(&missing)
    ));

    assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
}
