//! Virtual-address layout: reserve image memory, commit headers, copy
//! section bytes (spec.md §4.2 "Mapper").

use crate::error::{LoadError, Result};
use crate::image::MappedImage;
use crate::pe::headers::*;
use crate::pe::view;
use crate::platform;

/// Map `raw` into a fresh virtual-memory reservation and copy its headers
/// and sections into place. Does not relocate, bind imports, finalize
/// protections, or run TLS callbacks — those are later pipeline stages.
pub fn map(raw: &[u8]) -> Result<MappedImage> {
    let dos = view::dos_header(raw)?;
    let nt_prefix = view::nt_headers_prefix(raw, dos.e_lfanew)?;

    if nt_prefix.file_header.machine != view::host_machine() {
        return Err(LoadError::BadImageFormat(
            "image machine type does not match host architecture",
        ));
    }

    let optional_header_offset = dos.e_lfanew as usize + std::mem::size_of::<NtHeadersPrefix>();
    let opt = view::optional_header(
        raw,
        optional_header_offset,
        nt_prefix.file_header.size_of_optional_header,
    )?;

    if opt.section_alignment() % 2 != 0 {
        return Err(LoadError::BadImageFormat("SectionAlignment is odd"));
    }
    if opt.entry_point_rva() == 0 {
        return Err(LoadError::NoEntryPoint);
    }

    let sections = view::section_headers(
        raw,
        dos.e_lfanew as usize,
        nt_prefix.file_header.size_of_optional_header,
        nt_prefix.file_header.number_of_sections,
    )?;

    let page_size = platform::page_size() as u64;
    let mut logical_end = 0u64;
    for section in &sections {
        if section.virtual_address == 0 {
            continue;
        }
        let contribution = if section.size_of_raw_data == 0 {
            section.virtual_address as u64 + opt.section_alignment() as u64
        } else {
            section.virtual_address as u64 + section.size_of_raw_data as u64
        };
        logical_end = logical_end.max(contribution);
    }
    let aligned_end = view::align_up(logical_end, page_size);
    let aligned_size_of_image = view::align_up(opt.size_of_image() as u64, page_size);
    if aligned_end != aligned_size_of_image {
        return Err(LoadError::BadImageFormat(
            "SizeOfImage does not match the section layout",
        ));
    }

    let preferred_base = opt.image_base();
    let size_of_image = opt.size_of_image() as usize;

    let mut base = platform::alloc_image(preferred_base as usize, size_of_image)?;
    base = guard_4gib_boundary(base, size_of_image)?;

    let size_of_headers = opt.size_of_headers() as usize;
    if size_of_headers > raw.len() || size_of_headers > size_of_image {
        platform::free_image(base);
        return Err(LoadError::BadImageFormat("SizeOfHeaders exceeds the file or the image"));
    }

    let is_dll = FileCharacteristics::from_bits_truncate(nt_prefix.file_header.characteristics)
        .contains(FileCharacteristics::DLL);
    let mut mapped = MappedImage {
        base,
        size_of_image,
        nt_headers_offset: dos.e_lfanew as usize,
        optional_header_offset,
        size_of_optional_header: nt_prefix.file_header.size_of_optional_header,
        number_of_sections: nt_prefix.file_header.number_of_sections,
        is_dll,
        entry: view::rva_to_va(base, opt.entry_point_rva()),
        imported_modules: Vec::new(),
        initialized: false,
        relocated: false,
    };

    mapped.as_mut_slice()[..size_of_headers].copy_from_slice(&raw[..size_of_headers]);

    let delta = (base as u64).wrapping_sub(preferred_base);
    if delta != 0 {
        patch_image_base(&mut mapped, base as u64);
    }

    if let Err(err) = copy_sections(&mut mapped, raw, &sections, opt.section_alignment()) {
        platform::free_image(base);
        return Err(err);
    }

    Ok(mapped)
}

/// While the reservation spans two 4 GiB windows, park it and try again
/// at an OS-chosen address; release every parked reservation once a
/// non-spanning one is found (spec.md §4.2 step 4, 64-bit only).
fn guard_4gib_boundary(mut base: usize, size_of_image: usize) -> Result<usize> {
    if !cfg!(target_pointer_width = "64") {
        return Ok(base);
    }

    let mut parked = Vec::new();
    while spans_4gib(base, size_of_image) {
        log::warn!("mapped region at {base:#x} spans a 4 GiB boundary, retrying");
        parked.push(base);
        match platform::alloc_anywhere(size_of_image) {
            Ok(next) => base = next,
            Err(err) => {
                for p in parked {
                    platform::free_image(p);
                }
                return Err(err);
            }
        }
    }
    for p in parked {
        platform::free_image(p);
    }
    Ok(base)
}

fn spans_4gib(base: usize, size_of_image: usize) -> bool {
    let start = base as u64;
    let end = start + size_of_image as u64 - 1;
    (start >> 32) != (end >> 32)
}

fn patch_image_base(mapped: &mut MappedImage, new_base: u64) {
    let opt = mapped.optional_header();
    let field_offset = mapped.optional_header_offset + opt.image_base_field_offset();
    match opt {
        view::OptionalHeader::Pe32(_) => unsafe {
            view::write_in_memory(mapped.base + field_offset, new_base as u32);
        },
        view::OptionalHeader::Pe32Plus(_) => unsafe {
            view::write_in_memory(mapped.base + field_offset, new_base);
        },
    }
}

fn copy_sections(
    mapped: &mut MappedImage,
    raw: &[u8],
    sections: &[SectionHeader],
    section_alignment: u32,
) -> Result<()> {
    for (index, section) in sections.iter().enumerate() {
        if section.virtual_address == 0 {
            continue;
        }

        let dest_offset = section.virtual_address as usize;
        if section.size_of_raw_data == 0 {
            let len = section_alignment as usize;
            zero_region(mapped, dest_offset, len)?;
        } else {
            let src_start = section.pointer_to_raw_data as usize;
            let src_end = src_start
                .checked_add(section.size_of_raw_data as usize)
                .ok_or(LoadError::BadImageFormat("section raw data overflow"))?;
            if src_end > raw.len() {
                return Err(LoadError::BadImageFormat(
                    "section raw data extends past end of file",
                ));
            }
            copy_region(mapped, dest_offset, &raw[src_start..src_end])?;
        }

        let dest_addr = mapped.base + dest_offset;
        let header_offset = mapped.section_header_offset(index);
        let misc_offset = std::mem::offset_of!(SectionHeader, misc);
        unsafe { view::write_in_memory(mapped.base + header_offset + misc_offset, dest_addr as u32) };
    }
    Ok(())
}

fn zero_region(mapped: &mut MappedImage, offset: usize, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or(LoadError::BadImageFormat("section extends past image"))?;
    let image = mapped.as_mut_slice();
    if end > image.len() {
        return Err(LoadError::BadImageFormat("section extends past image"));
    }
    image[offset..end].fill(0);
    Ok(())
}

fn copy_region(mapped: &mut MappedImage, offset: usize, data: &[u8]) -> Result<()> {
    let end = offset
        .checked_add(data.len())
        .ok_or(LoadError::BadImageFormat("section extends past image"))?;
    let image = mapped.as_mut_slice();
    if end > image.len() {
        return Err(LoadError::BadImageFormat("section extends past image"));
    }
    image[offset..end].copy_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_4gib_detects_crossing() {
        assert!(spans_4gib(0xFFFF_F000, 0x2000));
        assert!(!spans_4gib(0x1000, 0x2000));
    }
}
