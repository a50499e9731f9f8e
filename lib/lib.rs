//! remote-vfs: a caching virtual filesystem over remote object stores.
//!
//! A [`fs::Vfs`] turns a [`backend::Backend`] that only knows whole objects into a POSIX-like
//! tree with random-access handles. File content is buffered in a local staging area according
//! to the [`cache::CacheMode`], and [`fs::fuser::FuserAdapter`] exposes the result to the kernel.

/// Remote storage drivers and their capability interface.
pub mod backend;
/// Local staging of file content and its eviction.
pub mod cache;
pub mod drop_ward;
/// The filesystem core, its handles and the FUSE adapter.
pub mod fs;
