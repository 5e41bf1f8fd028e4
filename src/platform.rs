//! Thin typed wrappers over the OS virtual-memory and library-loading APIs
//! (spec.md §2 "PlatformOps", §6 "Platform calls required").
//!
//! Everything here is a direct, unsafe call into `windows`; no retries or
//! fallback strategy lives in this module — that belongs to the callers
//! ([`crate::mapper::Mapper`]'s preferred-base retry and 4 GiB guard,
//! [`crate::import_binder::ImportBinder`]'s unwind-on-failure).
//!
//! Note on `GetProcAddress`: this loader deliberately does not call it.
//! Imported functions are resolved by walking the target module's own
//! export directory with [`crate::export::ExportWalker`] (spec.md §4.7),
//! the same way the loader resolves its own exports. `GetProcAddress` is
//! only used nowhere in this crate; see DESIGN.md.

use std::ffi::CString;

use windows::core::PCSTR;
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::LoadLibraryA;
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_PROTECTION_FLAGS,
};
use windows::Win32::System::SystemInformation::GetNativeSystemInfo;

use crate::error::{LoadError, Result};

/// A platform-native module handle. Zero and all-ones are both invalid
/// (spec.md §6).
pub type ModuleHandle = usize;

fn is_valid_handle(h: ModuleHandle) -> bool {
    h != 0 && h != usize::MAX
}

/// Reserve and commit `size` bytes as `PAGE_READWRITE`, preferring
/// `preferred` but letting the OS choose when `preferred` is null or busy.
///
/// Returns the base address actually used, or [`LoadError::OutOfMemory`].
pub fn alloc_image(preferred: usize, size: usize) -> Result<usize> {
    let base = unsafe {
        VirtualAlloc(
            Some(preferred as *const _),
            size,
            MEM_RESERVE | MEM_COMMIT,
            windows::Win32::System::Memory::PAGE_READWRITE,
        )
    };

    if !base.is_null() {
        return Ok(base as usize);
    }

    let base = unsafe {
        VirtualAlloc(
            None,
            size,
            MEM_RESERVE | MEM_COMMIT,
            windows::Win32::System::Memory::PAGE_READWRITE,
        )
    };

    if base.is_null() {
        Err(LoadError::OutOfMemory(
            "VirtualAlloc failed at both preferred and OS-chosen address",
        ))
    } else {
        Ok(base as usize)
    }
}

/// Reserve and commit `size` bytes at an OS-chosen address, no preferred
/// base attempted first. Used by the mapper's 4 GiB-boundary retry loop
/// (spec.md §4.2 step 4), which always wants a fresh arbitrary address.
pub fn alloc_anywhere(size: usize) -> Result<usize> {
    let base = unsafe {
        VirtualAlloc(
            None,
            size,
            MEM_RESERVE | MEM_COMMIT,
            windows::Win32::System::Memory::PAGE_READWRITE,
        )
    };
    if base.is_null() {
        Err(LoadError::OutOfMemory("VirtualAlloc failed at OS-chosen address"))
    } else {
        Ok(base as usize)
    }
}

/// Release a reservation obtained from [`alloc_image`]. Best-effort: a
/// failure here is logged but not propagated, matching `VirtualFree`'s own
/// "can't really fail for a reservation you own" contract.
pub fn free_image(base: usize) {
    if base == 0 {
        return;
    }
    let ok = unsafe { VirtualFree(base as *mut _, 0, MEM_RELEASE) };
    if let Err(err) = ok {
        log::warn!("VirtualFree({base:#x}) failed: {err}");
    }
}

/// Decommit `size` bytes starting at `addr` (used for discardable sections).
pub fn decommit(addr: usize, size: usize) -> Result<()> {
    unsafe { VirtualFree(addr as *mut _, size, windows::Win32::System::Memory::MEM_DECOMMIT) }
        .map_err(|_| LoadError::OutOfMemory("VirtualFree(MEM_DECOMMIT) failed"))
}

/// Change the protection of `[addr, addr + size)`. All-or-nothing.
pub fn protect(addr: usize, size: usize, protection: u32) -> Result<()> {
    let mut old = PAGE_PROTECTION_FLAGS(0);
    let result = unsafe {
        VirtualProtect(
            addr as *const _,
            size,
            PAGE_PROTECTION_FLAGS(protection),
            &mut old,
        )
    };
    result.map_err(|err| LoadError::ProtectionFailed {
        address: addr,
        code: err.code().0 as u32,
    })
}

/// Query the system page size via `GetNativeSystemInfo`.
pub fn page_size() -> usize {
    let mut info = unsafe { std::mem::zeroed() };
    unsafe { GetNativeSystemInfo(&mut info) };
    info.dwPageSize as usize
}

/// Load a system library by its ANSI name and return a handle, or
/// [`LoadError::ImportResolution`] if the loader could not find/load it.
pub fn load_library(name: &str) -> Result<ModuleHandle> {
    let cname = CString::new(name)
        .map_err(|_| LoadError::ImportResolution(format!("embedded NUL in module name {name:?}")))?;
    let handle: windows::core::Result<HMODULE> =
        unsafe { LoadLibraryA(PCSTR::from_raw(cname.as_ptr() as *const u8)) };
    match handle {
        Ok(h) if is_valid_handle(h.0 as usize) => Ok(h.0 as usize),
        _ => Err(LoadError::ImportResolution(format!(
            "LoadLibraryA({name:?}) failed"
        ))),
    }
}

/// Release one reference to a handle obtained from [`load_library`].
/// Invalid handles are silently skipped, matching spec.md §4.8's teardown
/// contract.
pub fn free_library(handle: ModuleHandle) {
    if !is_valid_handle(handle) {
        return;
    }
    let h = HMODULE(handle as *mut _);
    if let Err(err) = unsafe { FreeLibrary(h) } {
        log::warn!("FreeLibrary({handle:#x}) failed: {err}");
    }
}

/// Read a NUL-terminated ANSI string starting at `ptr`. Used for import
/// module names and import-by-name records, both of which live inside a
/// mapped image we already own.
///
/// # Safety
/// `ptr` must point at a valid, NUL-terminated byte sequence readable for
/// at least as many bytes as the eventual NUL terminator.
pub unsafe fn read_c_str(ptr: *const u8) -> &'static str {
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    let bytes = std::slice::from_raw_parts(ptr, len);
    std::str::from_utf8(bytes).unwrap_or("")
}
