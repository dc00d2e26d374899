//! Deduplicated, asynchronous loading of named external resources (script and
//! stylesheet files identified by URL).
//!
//! Callers request a group of resources and hand over a callback; the
//! [`Loader`] guarantees each resource is loaded at most once across its
//! lifetime, merges overlapping requests, short-circuits resources that
//! already completed, and fires every waiting callback once its whole group
//! is ready. The actual fetch/execution is behind the [`ResourceInjector`]
//! trait; [`DiskResourceIO`] is the shipped file-backed implementation.

pub mod disk_io;
pub mod loader;

mod batch;
mod hashing;
mod resource_url;

pub use crate::batch::LoadCallback;
pub use crate::disk_io::DiskResourceIO;
pub use crate::loader::{LoadState, Loader, LoaderEvent, ResourceInjector, ResourceLoadOp};
pub use crate::resource_url::{ResourceKind, ResourceUrl};
