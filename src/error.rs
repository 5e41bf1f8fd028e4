//! Error taxonomy for the loader pipeline (spec.md §7).

use thiserror::Error;

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, LoadError>;

/// Everything that can go wrong while mapping, fixing up, or tearing down
/// an in-memory PE image.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Header malformation: truncation, wrong signature, odd section
    /// alignment, size mismatch, or wrong machine type.
    #[error("bad image format: {0}")]
    BadImageFormat(&'static str),

    /// The optional header's `AddressOfEntryPoint` is zero.
    #[error("image has no entry point")]
    NoEntryPoint,

    /// A required virtual-memory reservation or commit failed.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// An imported module or one of its functions could not be located.
    #[error("import resolution failed: {0}")]
    ImportResolution(String),

    /// `VirtualProtect` failed while finalizing section protections.
    #[error("failed to set page protection at {address:#x}: code {code:#x}")]
    ProtectionFailed {
        /// Address of the page range being protected.
        address: usize,
        /// Raw OS error code, if one was available.
        code: u32,
    },

    /// The DLL's entry point returned `false` on `DLL_PROCESS_ATTACH`.
    #[error("DllMain rejected process attach")]
    AttachRejected,

    /// Export directory missing, empty, or the requested symbol is absent.
    #[error("export lookup failed: {0}")]
    ExportLookupFailed(#[from] ExportError),

    /// The operation is not valid in the module's current state (disposed,
    /// wrong image kind, or not yet initialized).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Failure modes specific to export-directory resolution (spec.md §4.7),
/// kept distinct from [`LoadError`] so [`crate::export::ExportWalker`] can be
/// used standalone against arbitrary module bases.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExportError {
    /// The module has no export directory (data directory size is zero).
    #[error("module has no export table")]
    NoExportTable,
    /// The export directory is present but empty.
    #[error("module exports no symbols")]
    NoExports,
    /// An ordinal fell outside `[Base, Base + NumberOfFunctions)`.
    #[error("ordinal {0} is out of range")]
    InvalidOrdinal(u32),
    /// The requested name was not present in the name table.
    #[error("export not found")]
    NotFound,
}
