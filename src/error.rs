use crate::{idtype::IdCode, parsers::BlendParseError};
use std::path::PathBuf;
use thiserror::Error;

/// Misuse of the link/append API. Per-item failures are never reported through this type, see
/// `ResolveError`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("`{operation}` is not allowed in the {stage} stage")]
    InvalidStage {
        operation: &'static str,
        stage: &'static str,
    },
    #[error("cannot open library '{}': {source}", path.display())]
    LibraryOpen {
        path: PathBuf,
        #[source]
        source: BlendParseError,
    },
    #[error("no library registered at index {0}")]
    LibraryIndex(usize),
    #[error("unknown item handle {0}")]
    UnknownItem(usize),
    #[error("an embedded blend file is already set")]
    EmbeddedBlendfileAlreadySet,
    #[error("no embedded blend file is set")]
    EmbeddedBlendfileMissing,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why one item of a pass has no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("'{name}' ({code}) not found in any enabled library")]
    NotFound { name: String, code: IdCode },
    #[error("data-blocks of type {0} cannot be linked")]
    NotLinkable(IdCode),
    #[error("none of the enabled libraries could be opened")]
    LibraryUnavailable,
    #[error("item was not linked")]
    NotLinked,
}
