//! Per-page protection assignment and discardable-section decommit
//! (spec.md §4.5 "SectionFinalizer").
//!
//! Distinct sections can share a page; protections are merged so the
//! resulting page permits every access any resident section needs, and a
//! page is discarded only when every section sharing it is discardable.

use windows::Win32::System::Memory::{
    PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS,
    PAGE_NOCACHE, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};

use crate::error::Result;
use crate::image::MappedImage;
use crate::pe::headers::{SectionCharacteristics, SectionHeader};
use crate::platform;

/// Running accumulator for the forward merge pass.
struct Accumulator {
    addr: usize,
    aligned_addr: usize,
    size: usize,
    chars: SectionCharacteristics,
    last: bool,
}

/// Assign final protections to every section-backed page and decommit
/// discardable regions.
pub fn finalize(mapped: &MappedImage) -> Result<()> {
    let sections = mapped.sections();
    let page_size = platform::page_size();
    let section_alignment = mapped.optional_header().section_alignment();

    let opt = mapped.optional_header();
    let (size_of_initialized_data, size_of_uninitialized_data) = match opt {
        crate::pe::view::OptionalHeader::Pe32(h) => {
            (h.size_of_initialized_data, h.size_of_uninitialized_data)
        }
        crate::pe::view::OptionalHeader::Pe32Plus(h) => {
            (h.size_of_initialized_data, h.size_of_uninitialized_data)
        }
    };

    let resident: Vec<SectionHeader> = sections
        .into_iter()
        .filter(|s| s.virtual_address != 0)
        .collect();
    if resident.is_empty() {
        return Ok(());
    }

    let mut iter = resident.iter();
    let first = iter.next().unwrap();
    let mut cur = seed(
        mapped,
        first,
        page_size,
        size_of_initialized_data,
        size_of_uninitialized_data,
    );

    for section in iter {
        let addr = mapped.section_dest_address(section);
        let size = section_size(section, size_of_initialized_data, size_of_uninitialized_data);
        let aligned_addr = align_down(addr, page_size);

        if cur.aligned_addr == aligned_addr || cur.addr + cur.size > aligned_addr {
            merge(&mut cur, section.characteristics(), addr, size);
        } else {
            finalize_one(&cur, page_size, section_alignment)?;
            cur = Accumulator {
                addr,
                aligned_addr,
                size,
                chars: section.characteristics(),
                last: false,
            };
        }
    }

    cur.last = true;
    finalize_one(&cur, page_size, section_alignment)?;
    Ok(())
}

fn seed(
    mapped: &MappedImage,
    section: &SectionHeader,
    page_size: usize,
    size_of_initialized_data: u32,
    size_of_uninitialized_data: u32,
) -> Accumulator {
    let addr = mapped.section_dest_address(section);
    Accumulator {
        addr,
        aligned_addr: align_down(addr, page_size),
        size: section_size(section, size_of_initialized_data, size_of_uninitialized_data),
        chars: section.characteristics(),
        last: false,
    }
}

fn merge(cur: &mut Accumulator, chars: SectionCharacteristics, addr: usize, size: usize) {
    let cur_discardable = cur.chars.contains(SectionCharacteristics::MEM_DISCARDABLE);
    let new_discardable = chars.contains(SectionCharacteristics::MEM_DISCARDABLE);
    if !cur_discardable || !new_discardable {
        cur.chars = (cur.chars | chars) & !SectionCharacteristics::MEM_DISCARDABLE;
    } else {
        cur.chars |= chars;
    }
    cur.size = (addr + size) - cur.addr;
}

fn finalize_one(cur: &Accumulator, page_size: usize, section_alignment: u32) -> Result<()> {
    if cur.size == 0 {
        return Ok(());
    }

    if cur.chars.contains(SectionCharacteristics::MEM_DISCARDABLE) {
        let page_aligned = cur.addr == cur.aligned_addr;
        let whole_pages =
            cur.last || section_alignment as usize == page_size || cur.size % page_size == 0;
        if page_aligned && whole_pages {
            platform::decommit(cur.addr, cur.size)?;
        }
        return Ok(());
    }

    let executable = cur.chars.contains(SectionCharacteristics::MEM_EXECUTE);
    let readable = cur.chars.contains(SectionCharacteristics::MEM_READ);
    let writable = cur.chars.contains(SectionCharacteristics::MEM_WRITE);

    let mut protection = protection_table(executable, readable, writable);
    if cur.chars.contains(SectionCharacteristics::MEM_NOT_CACHED) {
        protection |= PAGE_NOCACHE.0;
    }

    platform::protect(cur.addr, cur.size, protection)
}

fn protection_table(executable: bool, readable: bool, writable: bool) -> u32 {
    match (executable, readable, writable) {
        (false, false, false) => PAGE_NOACCESS.0,
        (false, false, true) => PAGE_WRITECOPY.0,
        (false, true, false) => PAGE_READONLY.0,
        (false, true, true) => PAGE_READWRITE.0,
        (true, false, false) => PAGE_EXECUTE.0,
        (true, false, true) => PAGE_EXECUTE_WRITECOPY.0,
        (true, true, false) => PAGE_EXECUTE_READ.0,
        (true, true, true) => PAGE_EXECUTE_READWRITE.0,
    }
}

/// A section's finalize-time size, falling back to the optional header's
/// initialized- or uninitialized-data totals when `SizeOfRawData == 0`
/// (spec.md §4.5 "Section size fallback").
fn section_size(
    section: &SectionHeader,
    size_of_initialized_data: u32,
    size_of_uninitialized_data: u32,
) -> usize {
    if section.size_of_raw_data != 0 {
        return section.size_of_raw_data as usize;
    }
    let chars = section.characteristics();
    if chars.contains(SectionCharacteristics::CNT_INITIALIZED_DATA) {
        size_of_initialized_data as usize
    } else if chars.contains(SectionCharacteristics::CNT_UNINITIALIZED_DATA) {
        size_of_uninitialized_data as usize
    } else {
        0
    }
}

fn align_down(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_table_matches_2x2x2_layout() {
        assert_eq!(protection_table(false, false, false), PAGE_NOACCESS.0);
        assert_eq!(protection_table(true, true, true), PAGE_EXECUTE_READWRITE.0);
        assert_eq!(protection_table(false, true, false), PAGE_READONLY.0);
        assert_eq!(protection_table(true, false, false), PAGE_EXECUTE.0);
    }

    #[test]
    fn align_down_rounds_to_page_boundary() {
        assert_eq!(align_down(0x1234, 0x1000), 0x1000);
        assert_eq!(align_down(0x2000, 0x1000), 0x2000);
    }

    #[test]
    fn merge_drops_discardable_when_either_side_is_resident() {
        let mut cur = Accumulator {
            addr: 0x1000,
            aligned_addr: 0x1000,
            size: 0x1000,
            chars: SectionCharacteristics::MEM_DISCARDABLE,
            last: false,
        };
        merge(&mut cur, SectionCharacteristics::MEM_READ, 0x1800, 0x800);
        assert!(!cur.chars.contains(SectionCharacteristics::MEM_DISCARDABLE));
        assert!(cur.chars.contains(SectionCharacteristics::MEM_READ));
        assert_eq!(cur.size, 0x1000);
    }

    #[test]
    fn merge_keeps_discardable_when_both_sides_are() {
        let mut cur = Accumulator {
            addr: 0x1000,
            aligned_addr: 0x1000,
            size: 0x1000,
            chars: SectionCharacteristics::MEM_DISCARDABLE,
            last: false,
        };
        merge(&mut cur, SectionCharacteristics::MEM_DISCARDABLE, 0x1800, 0x800);
        assert!(cur.chars.contains(SectionCharacteristics::MEM_DISCARDABLE));
    }
}
