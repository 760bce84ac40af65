use std::{fmt, io, path::PathBuf, process::ExitStatus};

use crate::{reference::ParseError, registry::RegistryError, MediaType};

/// Errors from the fakeroot engine and the transfer orchestrator.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error in {1}: {0}")]
    Filesystem(io::Error, PathBuf),

    #[error("Command failed: {command}: {failure}")]
    CommandExecution {
        command: String,
        failure: ExecFailure,
    },

    #[error("Invalid image reference: {0}")]
    InvalidReference(#[from] ParseError),

    #[error("Transfer of {reference} failed while {phase}: {source}")]
    Transfer {
        reference: String,
        phase: Phase,
        #[source]
        source: RegistryError,
    },

    #[error("Local image manifest {0} already exists; refusing to replace or reuse it.")]
    PreconditionConflict(PathBuf),

    #[error("Local image {0} not found.")]
    ImageNotFound(PathBuf),

    #[error("Invalid Content-Type: {0}")]
    InvalidContentType(MediaType),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid match pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Why a command run inside an image failed.
#[derive(Debug)]
pub enum ExecFailure {
    /// The process could not be started.
    Launch(io::Error),

    /// The process exited with a non-zero status.
    Status(ExitStatus),
}

impl fmt::Display for ExecFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecFailure::Launch(e) => write!(f, "can't launch: {e}"),
            ExecFailure::Status(s) => write!(f, "{s}"),
        }
    }
}

/// Step of a transfer where a registry failure happened.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Manifest,
    Layer,
    Upload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Manifest => "fetching manifest",
            Phase::Layer => "fetching layer",
            Phase::Upload => "uploading",
        })
    }
}

macro_rules! try_io {
    ($path:expr, $e:expr $(,)?) => {
        $e.map_err(|e| $crate::Error::Filesystem(::std::io::Error::from(e), $path.into()))?
    };
}

// Make visible to mods.
pub(crate) use try_io;

#[test]
fn display_includes_context() {
    let err = Error::Transfer {
        reference: "registry-1.docker.io/library/debian:10".into(),
        phase: Phase::Layer,
        source: RegistryError::MissingArchitecture,
    };

    let msg = err.to_string();
    assert!(msg.contains("library/debian:10"));
    assert!(msg.contains("fetching layer"));

    let err = Error::Filesystem(io::Error::from(io::ErrorKind::NotFound), "/x/y".into());
    assert!(err.to_string().contains("/x/y"));
}
