//! [`MappedImage`]: the owned, mutable virtual-memory region backing a
//! loaded PE image (spec.md §3 "MappedImage").

use std::slice;

use crate::pe::headers::{DataDirectory, SectionHeader};
use crate::pe::view::{self, OptionalHeader};
use crate::platform::ModuleHandle;

/// An owned region of reserved/committed virtual memory sized to the
/// image's `SizeOfImage`, plus the bookkeeping the pipeline accumulates
/// as it walks through load.
///
/// Every accessor that reads structured data re-derives it from the live
/// bytes rather than caching a stale copy, so writes performed by one
/// pipeline stage (e.g. the mapper's `ImageBase` patch, or its reuse of a
/// section header's `PhysicalAddress` slot) are immediately visible to
/// the next.
pub struct MappedImage {
    pub(crate) base: usize,
    pub(crate) size_of_image: usize,
    pub(crate) nt_headers_offset: usize,
    pub(crate) optional_header_offset: usize,
    pub(crate) size_of_optional_header: u16,
    pub(crate) number_of_sections: u16,
    pub(crate) is_dll: bool,
    /// Absolute address of the entry point, or 0 if the image has none.
    pub(crate) entry: usize,
    pub(crate) imported_modules: Vec<ModuleHandle>,
    pub(crate) initialized: bool,
    pub(crate) relocated: bool,
}

impl MappedImage {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size_of_image(&self) -> usize {
        self.size_of_image
    }

    pub fn is_dll(&self) -> bool {
        self.is_dll
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn relocated(&self) -> bool {
        self.relocated
    }

    pub fn imported_modules(&self) -> &[ModuleHandle] {
        &self.imported_modules
    }

    /// A read-only view of the whole mapped image.
    ///
    /// # Safety invariant
    /// Valid for the lifetime of `self`: the backing reservation is freed
    /// only by `Module::dispose`, which consumes the owning `Module`.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base as *const u8, self.size_of_image) }
    }

    /// A mutable view of the whole mapped image, for in-place fix-ups
    /// (relocations, IAT binding, header patches).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base as *mut u8, self.size_of_image) }
    }

    pub fn optional_header(&self) -> OptionalHeader {
        view::optional_header(
            self.as_slice(),
            self.optional_header_offset,
            self.size_of_optional_header,
        )
        .expect("optional header was already validated by the mapper")
    }

    pub fn sections(&self) -> Vec<SectionHeader> {
        view::section_headers(
            self.as_slice(),
            self.nt_headers_offset,
            self.size_of_optional_header,
            self.number_of_sections,
        )
        .expect("section headers were already validated by the mapper")
    }

    /// Offset (from `base`) of section `index`'s header, for callers that
    /// need to write a field back (the mapper's `PhysicalAddress` reuse).
    pub(crate) fn section_header_offset(&self, index: usize) -> usize {
        self.nt_headers_offset
            + std::mem::size_of::<crate::pe::headers::NtHeadersPrefix>()
            + self.size_of_optional_header as usize
            + index * std::mem::size_of::<SectionHeader>()
    }

    pub fn data_directory(&self, index: usize) -> Option<DataDirectory> {
        let opt = self.optional_header();
        view::data_directories(self.as_slice(), self.optional_header_offset, &opt)
            .ok()?
            .get(index)
            .copied()
    }

    /// Reconstruct a section's full mapped destination address from the
    /// low-32-bit value the mapper stashed in `Misc.PhysicalAddress`,
    /// ORing in the upper 32 bits of `base` (spec.md §9).
    pub fn section_dest_address(&self, section: &SectionHeader) -> usize {
        let low32 = section.misc as usize;
        if cfg!(target_pointer_width = "64") {
            (self.base & !0xFFFF_FFFFusize) | low32
        } else {
            low32
        }
    }
}
