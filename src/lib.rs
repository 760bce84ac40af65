//! Manage images for unprivileged containers.
//!
//! * [`Transfer`] pulls images from a registry into a directory, with a
//!   download cache, and pushes directories back to a registry.
//! * [`fakeroot`] detects the distribution of an unpacked image, and
//!   prepares it so its package manager works without root privileges.
//!
//! The registry, the archive format, and the execution of processes in an
//! image are behind the [`Registry`], [`Archiver`] and [`ImageRunner`]
//! traits. [`HttpRegistry`], [`TarArchiver`] and [`ChRun`] are the default
//! implementations.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use ch_image::*;
//!
//! # fn main() -> Result<(), Error> {
//! let storage = Storage::from_env();
//! let registry = HttpRegistry::new();
//! let archiver = TarArchiver::new();
//!
//! let plan = PullPlan::new(&storage, "debian:10")?;
//! let image = Transfer::new(&registry, &archiver).pull(&plan)?;
//!
//! let argv = ["apt-get", "install", "-y", "curl"].map(String::from);
//! run_modify(
//!     RuleTable::builtin(),
//!     &ChRun::new(),
//!     &image.unpack_path,
//!     &argv,
//!     &[],
//! )?;
//! # Ok(())
//! # }
//! ```

mod digest;
mod error;
mod events;
mod fs;
mod http;
mod manifests;
mod storage;

pub mod archive;
pub mod exec;
pub mod fakeroot;
pub mod reference;
pub mod registry;
pub mod transfer;

pub use archive::{Archiver, Artifact, BlobFile, TarArchiver};
pub use digest::{Digest, DigestAlgorithm, DigestError};
pub use error::{Error, ExecFailure, Phase};
pub use events::{EventHandler, NoEventHandler};
pub use exec::{run_modify, ChRun, ImageRunner};
pub use fakeroot::{Configuration, Rule, RuleTable};
pub use http::HttpError;
pub use manifests::{Blob, EncodedManifest, Manifest};
pub use reference::{ImageRef, MediaType};
pub use registry::{HttpRegistry, Registry, RegistryError};
pub use storage::{Storage, STORAGE_ENV};
pub use transfer::{PullPlan, PushPlan, Transfer, UnpackedImageHandle};
