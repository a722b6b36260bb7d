//! vdkit Core Library
//!
//! Composes a logical byte stream out of independent extents and serves
//! random-access reads over it, without materializing the whole stream.
//!
//! # Overview
//!
//! Extents are added to a [`StreamBuilder`], which validates them into a
//! [`BuiltStream`]. Each extent is a contiguous range backed by an in-memory
//! buffer, a lazily computed buffer, zeros, or a pass-through to an
//! underlying source. Extents are prepared on first touch and disposed when
//! the stream is finalized or dropped.
//!
//! The [`vmdk`] module uses this to present a raw disk as a monolithicSparse
//! VMDK: headers and grain tables are small buffer extents, allocated grains
//! pass through to the raw disk.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`extent`] - The extent trait and built-in variants
//! - [`index`] - Sorted, non-overlapping extent index
//! - [`builder`] - Builder, sealed stream and read paths
//! - [`source`] - Positioned-read sources backing pass-through extents
//! - [`cursor`] - `Read + Seek` adapter
//! - [`checksum`] - SHA-256 while writing
//! - [`vmdk`] - Sparse VMDK composition and reading
//!
//! # Quick Start
//!
//! ```
//! use vdkit_core::{BufferExtent, StreamBuilder, ZeroExtent};
//!
//! let mut builder = StreamBuilder::new();
//! builder
//!     .add(BufferExtent::fixed(0, b"boot".to_vec()))
//!     .add(ZeroExtent::new(4, 4));
//! let stream = builder.seal().unwrap();
//!
//! assert_eq!(stream.read_vec(2, 4).unwrap(), b"ot\0\0");
//! ```

pub mod builder;
pub mod checksum;
pub mod cursor;
pub mod error;
pub mod extent;
pub mod index;
pub mod source;
pub mod vmdk;

#[cfg(test)]
mod proptests;

pub use builder::{
    BuildState, BuilderOptions, BuiltStream, GapPolicy, StreamBuilder, DEFAULT_COPY_CHUNK_SIZE,
};
pub use cursor::StreamCursor;
pub use error::{Error, Result};
pub use extent::{
    BufferExtent, BufferSource, DeflatedContent, Extent, ExtentRange, MappedFileExtent,
    PassThroughExtent, ZeroExtent,
};
pub use index::ExtentIndex;
pub use source::{FileSource, MemorySource, MmapSource, ReadAt};
