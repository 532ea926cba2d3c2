//! Reader and writer for VMware's streamOptimized sparse VMDK container
//! format.
//!
//! The writer ([`writer::Writer`]) consumes a linear byte stream (or an
//! entire source disk through the [`pread_source::SourceDisk`] contract) and
//! produces a compressed, directory-indexed sparse file. The reader
//! ([`reader::Reader`]) answers random-offset reads against such a file and
//! enumerates its allocated regions.
//!
//! # Modules
//!
//! - `error` - the crate's `Error`/`Result` types
//! - `byteorder` - unaligned little-endian field access
//! - `header` - the 512-byte sparse extent header codec
//! - `layout` - grain directory/table geometry and allocation
//! - `descriptor` - embedded descriptor-file text builder
//! - `grain` - per-grain compression/decompression and the writer's
//!   scratch-buffer state machine
//! - `pread_source` - positioned-read contracts and the coalesced preader
//! - `writer` - sequential `pwrite`, parallel `copy`, `close`/`abort`
//! - `reader` - `open`, `capacity`, `next_data`, `pread`, `close`

pub mod byteorder;
pub mod descriptor;
pub mod entropy;
pub mod error;
pub mod grain;
pub mod header;
pub mod layout;
pub mod pread_source;
pub mod reader;
pub mod writer;

pub use error::{Error, Result};
pub use reader::Reader;
pub use writer::Writer;
