//! Error taxonomy shared by the codec and both adapters.
//!
//! Every variant is fatal for the adapter instance that reports it: the adapter stops reading,
//! surfaces the error to both ends of the pipeline and enters the closed state.  Nothing is
//! retried internally.

use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The byte stream could not be parsed as a tar archive.
    #[error("Malformed archive: {0}")]
    MalformedArchive(String),
    /// An archive entry has a type that has no file record representation.
    #[error("Unable to handle entry type {tag:?} for {name:?}")]
    UnsupportedEntryType { name: PathBuf, tag: char },
    /// A file record could not be classified as a file, directory or symlink.
    #[error("Unknown file type for {name:?}")]
    UnsupportedRecordKind { name: PathBuf },
    /// Reading the content of an entry or of a record failed.
    #[error("Failed to read content")]
    ContentRead(#[source] io::Error),
    /// The underlying byte channel failed.
    #[error("Transport error")]
    Transport(#[source] io::Error),
    #[error("Entry {name:?} declares {declared} bytes but {actual} were supplied")]
    SizeMismatch {
        name: PathBuf,
        declared: u64,
        actual: u64,
    },
    #[error("Record path {path:?} is not below {base:?}")]
    PathOutsideBase { path: PathBuf, base: PathBuf },
    #[error("Unable to determine the current working directory")]
    CurrentDir(#[source] io::Error),
    /// The downstream consumer dropped its end of the record channel.
    #[error("Record consumer went away")]
    SinkClosed,
    /// The adapter on the other end of a channel failed.
    #[error("Transcoding aborted: {0}")]
    Aborted(String),
    #[error("Adapter is closed")]
    Closed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn malformed(what: &str, err: impl std::fmt::Display) -> Self {
        Error::MalformedArchive(format!("{what}: {err}"))
    }
}
