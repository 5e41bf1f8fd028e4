//! Read-only decoders over either a byte slice (the raw input) or an
//! in-memory address (the mapped image). Spec.md §4.1 "PeView".
//!
//! Every decoder here is pure and side-effect-free: no allocation beyond
//! what the caller already owns, no OS calls. The unsafe in-memory readers
//! are `unsafe fn` because they dereference raw addresses the caller is
//! trusted to have already validated as belonging to a live mapping.

use bytemuck::{Pod, Zeroable};

use crate::error::{LoadError, Result};
use crate::pe::headers::*;

/// Round `x` up to the next multiple of `align`. `align` must be a power
/// of two (spec.md §4.1).
pub fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
    (x + align - 1) & !(align - 1)
}

/// `IMAGE_FILE_MACHINE_AMD64` on a 64-bit host, `IMAGE_FILE_MACHINE_I386`
/// on a 32-bit host.
pub fn host_machine() -> u16 {
    if cfg!(target_pointer_width = "64") {
        IMAGE_FILE_MACHINE_AMD64
    } else {
        IMAGE_FILE_MACHINE_I386
    }
}

fn read_pod<T: Pod + Zeroable>(buf: &[u8], offset: usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let end = offset
        .checked_add(size)
        .ok_or(LoadError::BadImageFormat("header offset overflow"))?;
    if end > buf.len() {
        return Err(LoadError::BadImageFormat("truncated before header end"));
    }
    Ok(bytemuck::pod_read_unaligned(&buf[offset..end]))
}

/// Decode and validate the DOS header at the start of `buf`.
pub fn dos_header(buf: &[u8]) -> Result<DosHeader> {
    let header: DosHeader = read_pod(buf, 0)?;
    if header.e_magic != DOS_SIGNATURE {
        return Err(LoadError::BadImageFormat("bad DOS signature"));
    }
    Ok(header)
}

/// The fixed prefix of `IMAGE_NT_HEADERS{32,64}`: signature + file header.
pub fn nt_headers_prefix(buf: &[u8], e_lfanew: u32) -> Result<NtHeadersPrefix> {
    let prefix: NtHeadersPrefix = read_pod(buf, e_lfanew as usize)?;
    if prefix.signature != NT_SIGNATURE {
        return Err(LoadError::BadImageFormat("bad NT signature"));
    }
    Ok(prefix)
}

/// Either width of optional header, borrowed out of a buffer decoded via
/// [`optional_header`].
#[derive(Clone, Copy, Debug)]
pub enum OptionalHeader {
    Pe32(OptionalHeader32),
    Pe32Plus(OptionalHeader64),
}

impl OptionalHeader {
    pub fn magic(&self) -> u16 {
        match self {
            OptionalHeader::Pe32(h) => h.magic,
            OptionalHeader::Pe32Plus(h) => h.magic,
        }
    }

    /// Full 64-bit preferred base on PE32+, zero-extended 32-bit base on
    /// PE32 (spec.md §4.2 step 2).
    pub fn image_base(&self) -> u64 {
        match self {
            OptionalHeader::Pe32(h) => h.image_base as u64,
            OptionalHeader::Pe32Plus(h) => h.image_base,
        }
    }

    pub fn entry_point_rva(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.address_of_entry_point,
            OptionalHeader::Pe32Plus(h) => h.address_of_entry_point,
        }
    }

    pub fn section_alignment(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.section_alignment,
            OptionalHeader::Pe32Plus(h) => h.section_alignment,
        }
    }

    pub fn size_of_image(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.size_of_image,
            OptionalHeader::Pe32Plus(h) => h.size_of_image,
        }
    }

    pub fn size_of_headers(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.size_of_headers,
            OptionalHeader::Pe32Plus(h) => h.size_of_headers,
        }
    }

    pub fn number_of_rva_and_sizes(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.number_of_rva_and_sizes,
            OptionalHeader::Pe32Plus(h) => h.number_of_rva_and_sizes,
        }
    }

    /// Size in bytes of the fixed part, i.e. the offset at which the data
    /// directory array begins relative to the start of the optional
    /// header.
    fn fixed_size(&self) -> usize {
        match self {
            OptionalHeader::Pe32(_) => std::mem::size_of::<OptionalHeader32>(),
            OptionalHeader::Pe32Plus(_) => std::mem::size_of::<OptionalHeader64>(),
        }
    }

    /// Offset of the `ImageBase` field within the optional header, used by
    /// the mapper to patch it in place after relocation (spec.md §4.2
    /// step 6).
    pub fn image_base_field_offset(&self) -> usize {
        match self {
            OptionalHeader::Pe32(_) => std::mem::offset_of!(OptionalHeader32, image_base),
            OptionalHeader::Pe32Plus(_) => std::mem::offset_of!(OptionalHeader64, image_base),
        }
    }
}

/// Decode the optional header starting at `offset` in `buf`, dispatching
/// on its magic. `size_of_optional_header` bounds how much of `buf` is
/// trusted to belong to it.
pub fn optional_header(buf: &[u8], offset: usize, size_of_optional_header: u16) -> Result<OptionalHeader> {
    let magic: u16 = read_pod(buf, offset)?;
    match magic {
        MAGIC_PE32 if (size_of_optional_header as usize) >= std::mem::size_of::<OptionalHeader32>() => {
            Ok(OptionalHeader::Pe32(read_pod(buf, offset)?))
        }
        MAGIC_PE32_PLUS if (size_of_optional_header as usize) >= std::mem::size_of::<OptionalHeader64>() => {
            Ok(OptionalHeader::Pe32Plus(read_pod(buf, offset)?))
        }
        MAGIC_PE32 | MAGIC_PE32_PLUS => Err(LoadError::BadImageFormat(
            "optional header smaller than its magic implies",
        )),
        _ => Err(LoadError::BadImageFormat("unrecognized optional header magic")),
    }
}

/// Data directories immediately following the optional header's fixed
/// part (`IMAGE_FIRST_SECTION`'s sibling rule for data directories).
pub fn data_directories(
    buf: &[u8],
    optional_header_offset: usize,
    opt: &OptionalHeader,
) -> Result<Vec<DataDirectory>> {
    let start = optional_header_offset + opt.fixed_size();
    let count = opt.number_of_rva_and_sizes() as usize;
    let mut out = Vec::with_capacity(count.min(16));
    for i in 0..count {
        out.push(read_pod(buf, start + i * std::mem::size_of::<DataDirectory>())?);
    }
    Ok(out)
}

/// `IMAGE_FIRST_SECTION`: section headers begin right after
/// `FileHeader` + the (fully-sized, not just-decoded) optional header.
pub fn section_headers(
    buf: &[u8],
    nt_headers_offset: usize,
    size_of_optional_header: u16,
    count: u16,
) -> Result<Vec<SectionHeader>> {
    let start = nt_headers_offset
        + std::mem::size_of::<NtHeadersPrefix>()
        + size_of_optional_header as usize;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        out.push(read_pod(buf, start + i * std::mem::size_of::<SectionHeader>())?);
    }
    Ok(out)
}

/// Resolve an RVA to a VA given the image's base.
pub fn rva_to_va(base: usize, rva: u32) -> usize {
    base.wrapping_add(rva as usize)
}

/// Read a `T` out of live mapped memory at `addr`.
///
/// # Safety
/// `addr` must be readable for `size_of::<T>()` bytes for the duration of
/// the call.
pub unsafe fn read_in_memory<T: Pod + Zeroable>(addr: usize) -> T {
    (addr as *const T).read_unaligned()
}

/// Write a `T` into live mapped memory at `addr`.
///
/// # Safety
/// `addr` must be writable for `size_of::<T>()` bytes for the duration of
/// the call.
pub unsafe fn write_in_memory<T: Pod + Zeroable>(addr: usize, value: T) {
    (addr as *mut T).write_unaligned(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn dos_header_rejects_short_buffer() {
        let buf = vec![0u8; 4];
        assert!(dos_header(&buf).is_err());
    }

    #[test]
    fn dos_header_rejects_bad_magic() {
        let mut buf = vec![0u8; 64];
        buf[0] = 0;
        buf[1] = 0;
        assert!(dos_header(&buf).is_err());
    }

    #[test]
    fn rva_to_va_is_wrapping_offset() {
        assert_eq!(rva_to_va(0x1_0000_0000, 0x1000), 0x1_0000_1000);
    }
}
