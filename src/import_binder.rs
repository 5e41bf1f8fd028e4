//! Import-table binding against already-loaded system modules (spec.md
//! §4.4 "ImportBinder").
//!
//! Deliberately does not call `GetProcAddress`: every thunk is resolved by
//! walking the target module's export directory with
//! [`crate::export::ExportWalker`], the same mechanism
//! [`crate::export::resolve_own_export`] uses for the loaded image's own
//! exports (spec.md §4.7, §9).

use crate::error::Result;
use crate::export::ExportWalker;
use crate::image::MappedImage;
use crate::pe::headers::{ImportDescriptor, ORDINAL_FLAG32, ORDINAL_FLAG64};
use crate::pe::view;
use crate::platform::{self, ModuleHandle};

/// Walk the import directory, load each referenced module, and patch its
/// IAT thunks in place. On any failure, every module loaded so far by this
/// call is freed and the error is propagated — callers never see a
/// partially-bound image.
pub fn bind(mapped: &mut MappedImage) -> Result<Vec<ModuleHandle>> {
    let import_dir = match mapped.data_directory(crate::pe::headers::DIR_IMPORT) {
        Some(d) if d.size != 0 => d,
        _ => return Ok(Vec::new()),
    };

    let base = mapped.base();
    let mut descriptor_addr = view::rva_to_va(base, import_dir.virtual_address);
    let mut loaded = Vec::new();

    loop {
        let descriptor: ImportDescriptor = unsafe { view::read_in_memory(descriptor_addr) };
        if descriptor.is_null() {
            break;
        }

        if let Err(err) = bind_one(base, &descriptor, &mut loaded) {
            for handle in loaded {
                platform::free_library(handle);
            }
            return Err(err);
        }

        descriptor_addr += std::mem::size_of::<ImportDescriptor>();
    }

    Ok(loaded)
}

fn bind_one(
    image_base: usize,
    descriptor: &ImportDescriptor,
    loaded: &mut Vec<ModuleHandle>,
) -> Result<()> {
    let module_name_addr = view::rva_to_va(image_base, descriptor.name);
    let module_name = unsafe { platform::read_c_str(module_name_addr as *const u8) };

    let module_handle = platform::load_library(module_name)?;
    loaded.push(module_handle);

    let walker = ExportWalker::new(module_handle)?;

    let thunk_table_rva = if descriptor.original_first_thunk != 0 {
        descriptor.original_first_thunk
    } else {
        descriptor.first_thunk
    };

    if cfg!(target_pointer_width = "64") {
        bind_thunks_64(image_base, thunk_table_rva, descriptor.first_thunk, &walker)?;
    } else {
        bind_thunks_32(image_base, thunk_table_rva, descriptor.first_thunk, &walker)?;
    }

    Ok(())
}

fn bind_thunks_64(
    image_base: usize,
    thunk_table_rva: u32,
    iat_rva: u32,
    walker: &ExportWalker,
) -> Result<()> {
    let mut thunk_addr = view::rva_to_va(image_base, thunk_table_rva);
    let mut iat_addr = view::rva_to_va(image_base, iat_rva);

    loop {
        let thunk: u64 = unsafe { view::read_in_memory(thunk_addr) };
        if thunk == 0 {
            break;
        }

        let resolved = resolve_thunk_64(image_base, thunk, walker)?;
        unsafe { view::write_in_memory(iat_addr, resolved as u64) };

        thunk_addr += 8;
        iat_addr += 8;
    }
    Ok(())
}

fn bind_thunks_32(
    image_base: usize,
    thunk_table_rva: u32,
    iat_rva: u32,
    walker: &ExportWalker,
) -> Result<()> {
    let mut thunk_addr = view::rva_to_va(image_base, thunk_table_rva);
    let mut iat_addr = view::rva_to_va(image_base, iat_rva);

    loop {
        let thunk: u32 = unsafe { view::read_in_memory(thunk_addr) };
        if thunk == 0 {
            break;
        }

        let resolved = resolve_thunk_32(image_base, thunk, walker)?;
        unsafe { view::write_in_memory(iat_addr, resolved as u32) };

        thunk_addr += 4;
        iat_addr += 4;
    }
    Ok(())
}

fn resolve_thunk_64(image_base: usize, thunk: u64, walker: &ExportWalker) -> Result<usize> {
    if thunk & ORDINAL_FLAG64 != 0 {
        let ordinal = (thunk & 0xFFFF) as u32;
        Ok(walker.resolve_by_ordinal(ordinal)?)
    } else {
        let name = read_import_name(image_base, thunk as u32);
        Ok(walker.resolve_by_name(&name, true)?)
    }
}

fn resolve_thunk_32(image_base: usize, thunk: u32, walker: &ExportWalker) -> Result<usize> {
    if thunk & ORDINAL_FLAG32 != 0 {
        let ordinal = thunk & 0xFFFF;
        Ok(walker.resolve_by_ordinal(ordinal)?)
    } else {
        let name = read_import_name(image_base, thunk);
        Ok(walker.resolve_by_name(&name, true)?)
    }
}

/// `IMAGE_IMPORT_BY_NAME` is a `Hint` (u16) followed by the NUL-terminated
/// name; the hint is unused here since resolution always goes through the
/// name table rather than trusting the hint's ordinal guess.
fn read_import_name(image_base: usize, name_rva: u32) -> String {
    let addr = view::rva_to_va(image_base, name_rva) + 2;
    unsafe { platform::read_c_str(addr as *const u8).to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_thunk_64_detects_ordinal_flag() {
        let thunk = ORDINAL_FLAG64 | 7;
        assert_ne!(thunk & ORDINAL_FLAG64, 0);
        assert_eq!(thunk & 0xFFFF, 7);
    }

    #[test]
    fn resolve_thunk_32_detects_ordinal_flag() {
        let thunk = ORDINAL_FLAG32 | 42;
        assert_ne!(thunk & ORDINAL_FLAG32, 0);
        assert_eq!(thunk & 0xFFFF, 42);
    }
}
