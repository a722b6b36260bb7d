//! VMDK sparse images.
//!
//! [`SparseVmdkBuilder`] composes a monolithicSparse VMDK over a raw disk as a
//! [`BuiltStream`](crate::builder::BuiltStream) without copying the disk, and
//! [`SparseVmdkReader`] reads a sparse image back as a virtual disk.

pub mod descriptor;
pub mod header;
pub mod reader;
pub mod sparse;

pub use descriptor::{
    parse_descriptor, Access, DescriptorExtent, DescriptorExtentType, Geometry, VmdkDescriptor,
};
pub use header::{SparseExtentHeader, DEFAULT_GRAIN_SIZE, GT_ENTRIES_PER_GT, SECTOR_SIZE, VMDK_MAGIC};
pub use reader::{is_sparse_vmdk, SparseVmdkReader};
pub use sparse::{SparseLayout, SparseOptions, SparseVmdkBuilder, SparseVmdkImage};
