//! Base relocation fix-up (spec.md §4.3 "Relocator").

use crate::error::Result;
use crate::image::MappedImage;
use crate::pe::headers::{BaseRelocationBlock, RelocationType, DIR_BASERELOC};
use crate::pe::view;

/// Apply base relocations if `delta != 0`. Returns whether the image is
/// now consistent with its actual load address: `true` if either no
/// relocation was needed or every block was applied; `false` only when
/// `delta != 0` and there is no relocation directory to consult (the
/// image cannot run at this address).
pub fn apply(mapped: &mut MappedImage, delta: u64) -> Result<bool> {
    let reloc_dir = mapped.data_directory(DIR_BASERELOC).unwrap_or_default();
    if let Some(result) = short_circuit(reloc_dir.size, delta) {
        return Ok(result);
    }

    apply_blocks(mapped, reloc_dir.virtual_address, delta);
    Ok(true)
}

/// Decides whether relocation can be skipped (or must fail) without
/// walking any blocks: `None` means a real walk is needed. Split out of
/// [`apply`] so the decision is directly testable without a live mapped
/// image.
fn short_circuit(reloc_dir_size: u32, delta: u64) -> Option<bool> {
    if reloc_dir_size == 0 {
        Some(delta == 0)
    } else if delta == 0 {
        Some(true)
    } else {
        None
    }
}

fn apply_blocks(mapped: &mut MappedImage, reloc_rva: u32, delta: u64) {
    let base = mapped.base();
    let mut block_addr = view::rva_to_va(base, reloc_rva);

    loop {
        let block: BaseRelocationBlock = unsafe { view::read_in_memory(block_addr) };
        if block.page_rva == 0 {
            break;
        }

        let entry_count = (block.block_size as usize - std::mem::size_of::<BaseRelocationBlock>()) / 2;
        let entries_addr = block_addr + std::mem::size_of::<BaseRelocationBlock>();

        for i in 0..entry_count {
            let entry: u16 = unsafe { view::read_in_memory(entries_addr + i * 2) };
            let reloc_type = RelocationType::from(entry >> 12);
            let offset = (entry & 0x0FFF) as usize;
            let patch_addr = base + block.page_rva as usize + offset;

            match reloc_type {
                RelocationType::Absolute => {}
                RelocationType::HighLow => unsafe {
                    let value: u32 = view::read_in_memory(patch_addr);
                    view::write_in_memory(patch_addr, value.wrapping_add(delta as u32));
                },
                RelocationType::Dir64 => unsafe {
                    let value: u64 = view::read_in_memory(patch_addr);
                    view::write_in_memory(patch_addr, value.wrapping_add(delta));
                },
                RelocationType::Other(raw) => {
                    log::trace!("ignoring unsupported relocation type {raw} at rva {:#x}", block.page_rva + offset as u32);
                }
            }
        }

        block_addr += block.block_size as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::headers::*;

    /// Build a flat buffer standing in for a mapped image: a base
    /// relocation directory with one HIGHLOW and one DIR64 entry, each
    /// pointing at a patch site elsewhere in the buffer.
    fn build_fake_image() -> (Vec<u8>, usize /* highlow site */, usize /* dir64 site */) {
        let mut buf = vec![0u8; 0x2000];
        let reloc_rva = 0x1000usize;
        let highlow_site = 0x100usize;
        let dir64_site = 0x200usize;

        buf[highlow_site..highlow_site + 4].copy_from_slice(&0x0040_1000u32.to_le_bytes());
        buf[dir64_site..dir64_site + 8].copy_from_slice(&0x0000_0001_0040_2000u64.to_le_bytes());

        let block_size: u32 = 8 + 2 * 2; // header + 2 entries
        buf[reloc_rva..reloc_rva + 4].copy_from_slice(&0u32.to_le_bytes()); // page_rva = 0 (page-relative offsets below are absolute in this synthetic buffer)
        buf[reloc_rva + 4..reloc_rva + 8].copy_from_slice(&block_size.to_le_bytes());

        let highlow_entry: u16 = (3u16 << 12) | (highlow_site as u16 & 0x0FFF);
        let dir64_entry: u16 = (10u16 << 12) | (dir64_site as u16 & 0x0FFF);
        buf[reloc_rva + 8..reloc_rva + 10].copy_from_slice(&highlow_entry.to_le_bytes());
        buf[reloc_rva + 10..reloc_rva + 12].copy_from_slice(&dir64_entry.to_le_bytes());

        // terminator block
        buf[reloc_rva + 12..reloc_rva + 16].copy_from_slice(&0u32.to_le_bytes());
        buf[reloc_rva + 16..reloc_rva + 20].copy_from_slice(&0u32.to_le_bytes());

        (buf, highlow_site, dir64_site)
    }

    #[test]
    fn apply_blocks_patches_highlow_and_dir64() {
        let (mut buf, highlow_site, dir64_site) = build_fake_image();
        let base = buf.as_mut_ptr() as usize;
        let delta: u64 = 0x1000;

        apply_blocks_over_raw(base, &mut buf, 0x1000, delta);

        let patched_highlow = u32::from_le_bytes(buf[highlow_site..highlow_site + 4].try_into().unwrap());
        assert_eq!(patched_highlow, 0x0040_1000u32.wrapping_add(delta as u32));

        let patched_dir64 =
            u64::from_le_bytes(buf[dir64_site..dir64_site + 8].try_into().unwrap());
        assert_eq!(patched_dir64, 0x0000_0001_0040_2000u64.wrapping_add(delta));
    }

    /// Test-only shim: runs the same block-walking logic as
    /// [`apply_blocks`] but against a `Vec<u8>` standing in for a mapped
    /// image, so the patch math is exercised without a live OS mapping.
    fn apply_blocks_over_raw(base: usize, buf: &mut [u8], reloc_rva: u32, delta: u64) {
        let mut offset = reloc_rva as usize;
        loop {
            let page_rva = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
            let block_size = u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().unwrap());
            if page_rva == 0 {
                break;
            }
            let entry_count = (block_size as usize - 8) / 2;
            for i in 0..entry_count {
                let eoff = offset + 8 + i * 2;
                let entry = u16::from_le_bytes(buf[eoff..eoff + 2].try_into().unwrap());
                let reloc_type = RelocationType::from(entry >> 12);
                let patch_offset = (page_rva + (entry & 0x0FFF) as u32) as usize;
                match reloc_type {
                    RelocationType::Absolute => {}
                    RelocationType::HighLow => {
                        let v = u32::from_le_bytes(
                            buf[patch_offset..patch_offset + 4].try_into().unwrap(),
                        );
                        buf[patch_offset..patch_offset + 4]
                            .copy_from_slice(&v.wrapping_add(delta as u32).to_le_bytes());
                    }
                    RelocationType::Dir64 => {
                        let v = u64::from_le_bytes(
                            buf[patch_offset..patch_offset + 8].try_into().unwrap(),
                        );
                        buf[patch_offset..patch_offset + 8]
                            .copy_from_slice(&v.wrapping_add(delta).to_le_bytes());
                    }
                    RelocationType::Other(_) => {}
                }
            }
            offset += block_size as usize;
        }
        let _ = base;
    }

    #[test]
    fn short_circuit_fails_when_delta_nonzero_and_no_reloc_table() {
        assert_eq!(short_circuit(0, 0x2000), Some(false));
    }

    #[test]
    fn short_circuit_ok_when_no_reloc_table_and_no_delta() {
        assert_eq!(short_circuit(0, 0), Some(true));
    }

    #[test]
    fn short_circuit_ok_when_reloc_table_present_but_no_delta() {
        assert_eq!(short_circuit(100, 0), Some(true));
    }

    #[test]
    fn short_circuit_defers_to_block_walk_when_both_present() {
        assert_eq!(short_circuit(100, 0x2000), None);
    }
}
