//! Object storage capabilities.
//!
//! The [`backend::ObjectStore`] trait is the only thing the gateway needs
//! from a storage backend: a bounded existence check, a presign call, and
//! (for the upload command) a write.  [`s3::S3Backend`] talks to any
//! S3-compatible service; [`memory::MemoryStore`] keeps objects in process.

pub mod backend;
pub mod memory;
pub mod s3;
