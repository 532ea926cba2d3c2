//! Error types for the streamOptimized VMDK codec.

use std::path::PathBuf;

/// The error type for every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad magic, version, flag combination, or newline-detector bytes.
    #[error("invalid sparse extent header: {message}")]
    InvalidHeader { message: String },

    /// Grain size or entries-per-table outside the required constraints.
    #[error("invalid grain directory/table geometry: {message}")]
    InvalidGeometry { message: String },

    /// A read syscall failed or returned fewer bytes than requested.
    #[error("read error{}: {source}", path_suffix(path))]
    IoRead {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// A write syscall failed or wrote fewer bytes than requested.
    #[error("write error{}: {source}", path_suffix(path))]
    IoWrite {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// A read or write transferred fewer bytes than requested, reported
    /// distinctly from [`Error::IoRead`]/[`Error::IoWrite`] for diagnostics.
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    /// Deflate/inflate setup, reset, or finish did not succeed, or an
    /// inflated grain came out shorter than its expected effective size.
    #[error("codec failure: {message}")]
    CodecFailure { message: String },

    /// Embedded-LBA mismatch, or `cmpSize` exceeds the reader's scratch.
    #[error("corrupt grain frame: {message}")]
    FrameCorrupt { message: String },

    /// Attempt to rewrite a grain-table entry that is already nonzero.
    #[error("grain {grain} was already written")]
    OverwriteForbidden { grain: u64 },

    /// Allocation failure, or unable to create a worker thread.
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// Writer offset at or beyond `GTEs * grainBytes`.
    #[error("offset out of range: {message}")]
    OutOfRange { message: String },

    /// `next_data` found no more allocated grains past the given position.
    #[error("no more data")]
    NoMoreData,
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" at '{}'", p.display()))
        .unwrap_or_default()
}

/// A specialized [`Result`](std::result::Result) for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            message: message.into(),
        }
    }

    pub fn invalid_geometry(message: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            message: message.into(),
        }
    }

    pub fn io_read(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::IoRead {
            source,
            path: Some(path.into()),
        }
    }

    pub fn io_read_simple(source: std::io::Error) -> Self {
        Self::IoRead { source, path: None }
    }

    pub fn io_write(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::IoWrite {
            source,
            path: Some(path.into()),
        }
    }

    pub fn io_write_simple(source: std::io::Error) -> Self {
        Self::IoWrite { source, path: None }
    }

    pub fn short_transfer(expected: usize, actual: usize) -> Self {
        Self::ShortTransfer { expected, actual }
    }

    pub fn codec_failure(message: impl Into<String>) -> Self {
        Self::CodecFailure {
            message: message.into(),
        }
    }

    pub fn frame_corrupt(message: impl Into<String>) -> Self {
        Self::FrameCorrupt {
            message: message.into(),
        }
    }

    pub fn overwrite_forbidden(grain: u64) -> Self {
        Self::OverwriteForbidden { grain }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::OutOfRange {
            message: message.into(),
        }
    }
}
