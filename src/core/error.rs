//! Error types for the paging engine

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::TocId;

/// Main error type for container, TOC and chunk operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open container '{}': {source}", path.display())]
    OpenFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected container magic {found:?}, expected \"ATLS\"")]
    BadMagic { found: [u8; 4] },

    #[error("malformed container header at offset {offset}: {reason}")]
    BadHeader { offset: u64, reason: String },

    #[error("corrupt chunk at offset {offset}: {reason}")]
    CorruptChunk { offset: u64, reason: String },

    #[error("unknown TOC kind '{0}'")]
    UnknownTocKind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid container state: {0}")]
    InvalidState(String),

    #[error("stub {stub} of TOC {toc:?} has never been written")]
    EmptyStub { toc: Option<TocId>, stub: usize },

    #[error("stub index {stub} out of range (TOC has {count} stubs)")]
    InvalidStub { stub: usize, count: usize },

    #[error("operation requires a quadtree TOC")]
    NotQuadtree,

    #[error("chunk payload error: {0}")]
    Payload(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Build a corruption error for a frame starting at `offset`
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptChunk {
            offset,
            reason: reason.into(),
        }
    }

    /// Whether this error means on-disk data can no longer be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptChunk { .. } | Error::BadMagic { .. } | Error::BadHeader { .. }
        )
    }
}
