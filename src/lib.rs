//! In-memory manual-mapping loader for Windows PE images.
//!
//! Parses a PE32/PE32+ byte buffer, reserves and maps its own virtual
//! memory for it, applies base relocations, binds imports against
//! already-loaded system modules (without `GetProcAddress`), finalizes
//! section protections, runs TLS callbacks, and either invokes `DllMain`
//! or exposes the entry point — all without the image ever touching disk
//! or going through the OS image loader.

pub mod error;
pub mod export;
pub mod image;
pub mod import_binder;
pub mod mapper;
pub mod module;
pub mod pe;
pub mod platform;
pub mod relocator;
pub mod section_finalizer;
pub mod tls;

pub use error::{LoadError, Result};
pub use module::{LoadOptions, Module};
