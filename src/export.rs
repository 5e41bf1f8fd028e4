//! Export-directory resolution (spec.md §4.7 "ExportWalker / Module symbol
//! lookup").
//!
//! Two related but distinct entry points live here:
//!
//! - [`resolve_own_export`]: the loaded module's own `get_function`,
//!   exact-match case-sensitive, used by [`crate::module::Module`].
//! - [`ExportWalker`]: a general-purpose walker over *any* module's export
//!   directory (including system DLLs the loader never mapped itself),
//!   used by [`crate::import_binder::ImportBinder`] in place of the OS
//!   `GetProcAddress`. It adds the ordinal-base offset and optional
//!   case-insensitive comparison spec.md §4.7/§9 call for.

use std::cell::OnceCell;
use std::collections::HashMap;

use crate::error::ExportError;
use crate::pe::headers::{DataDirectory, ExportDirectory, NtHeadersPrefix, DIR_EXPORT};
use crate::pe::view;

/// One `(name, ordinal, address)` triple yielded by [`ExportWalker::walk`].
#[derive(Debug, Clone)]
pub struct ExportEntry {
    /// `None` for exports published by ordinal only.
    pub name: Option<String>,
    /// The export ordinal (already offset by the directory's `Base`).
    pub ordinal: u32,
    /// Absolute address of the export (no forwarder resolution: spec.md
    /// §1 lists forwarded exports as a non-goal).
    pub address: usize,
}

/// A generous, always-safe bound on how many leading bytes of a loaded
/// module we read as a flat buffer to decode its headers. Real
/// `SizeOfHeaders` values are almost always <= one page, and the full
/// page is guaranteed resident for any live module.
const HEADER_PROBE_LEN: usize = 4096;

fn decode_directories(module_base: usize) -> Result<Vec<DataDirectory>, ExportError> {
    let header_buf =
        unsafe { std::slice::from_raw_parts(module_base as *const u8, HEADER_PROBE_LEN) };
    let dos = view::dos_header(header_buf).map_err(|_| ExportError::NoExportTable)?;
    let nt_prefix = view::nt_headers_prefix(header_buf, dos.e_lfanew)
        .map_err(|_| ExportError::NoExportTable)?;
    let opt_offset = dos.e_lfanew as usize + std::mem::size_of::<NtHeadersPrefix>();
    let opt = view::optional_header(
        header_buf,
        opt_offset,
        nt_prefix.file_header.size_of_optional_header,
    )
    .map_err(|_| ExportError::NoExportTable)?;
    view::data_directories(header_buf, opt_offset, &opt).map_err(|_| ExportError::NoExportTable)
}

fn read_name(module_base: usize, name_rva: u32) -> String {
    let addr = view::rva_to_va(module_base, name_rva);
    unsafe { crate::platform::read_c_str(addr as *const u8).to_string() }
}

/// Resolve `name` against the loaded image's *own* export table: exact,
/// case-sensitive match (spec.md §4.7 "Resolution by name (loaded
/// module)").
pub fn resolve_own_export(module_base: usize, name: &str) -> Result<usize, ExportError> {
    let dirs = decode_directories(module_base)?;
    let entry = dirs.get(DIR_EXPORT).copied().unwrap_or_default();
    if entry.size == 0 {
        return Err(ExportError::NoExportTable);
    }
    let dir: ExportDirectory =
        unsafe { view::read_in_memory(view::rva_to_va(module_base, entry.virtual_address)) };
    if dir.number_of_functions == 0 || dir.number_of_names == 0 {
        return Err(ExportError::NoExports);
    }

    let names_base = view::rva_to_va(module_base, dir.address_of_names);
    let ordinals_base = view::rva_to_va(module_base, dir.address_of_name_ordinals);
    let functions_base = view::rva_to_va(module_base, dir.address_of_functions);

    for i in 0..dir.number_of_names {
        let name_rva: u32 = unsafe { view::read_in_memory(names_base + i as usize * 4) };
        let candidate = read_name(module_base, name_rva);
        if candidate != name {
            continue;
        }
        let ordinal: u16 = unsafe { view::read_in_memory(ordinals_base + i as usize * 2) };
        if ordinal as u32 >= dir.number_of_functions {
            return Err(ExportError::InvalidOrdinal(ordinal as u32));
        }
        let func_rva: u32 =
            unsafe { view::read_in_memory(functions_base + ordinal as usize * 4) };
        return Ok(view::rva_to_va(module_base, func_rva));
    }

    Err(ExportError::NotFound)
}

/// General-purpose export-directory walker over any module base, used for
/// resolving imports against already-loaded system libraries without
/// `GetProcAddress`.
pub struct ExportWalker {
    base: usize,
    dir: ExportDirectory,
    /// Name → function-table index, built lazily on first by-name lookup
    /// and reused for every subsequent one (spec.md §4.7 "cached
    /// dictionaries for repeat queries").
    names_exact: OnceCell<HashMap<String, u16>>,
    names_lower: OnceCell<HashMap<String, u16>>,
}

impl ExportWalker {
    /// Locate and validate the export directory of the module at `base`.
    pub fn new(base: usize) -> Result<Self, ExportError> {
        let dirs = decode_directories(base)?;
        let entry = dirs.get(DIR_EXPORT).copied().unwrap_or_default();
        if entry.size == 0 {
            return Err(ExportError::NoExportTable);
        }
        let dir: ExportDirectory =
            unsafe { view::read_in_memory(view::rva_to_va(base, entry.virtual_address)) };
        Ok(Self {
            base,
            dir,
            names_exact: OnceCell::new(),
            names_lower: OnceCell::new(),
        })
    }

    /// Build the name → function-table-index table once, reading every
    /// name/ordinal pair a single time regardless of how many lookups
    /// follow.
    fn build_name_table(&self, lower: bool) -> HashMap<String, u16> {
        let names_base = self.names_base();
        let ordinals_base = self.ordinals_base();
        let mut table = HashMap::with_capacity(self.dir.number_of_names as usize);
        for i in 0..self.dir.number_of_names {
            let name_rva: u32 = unsafe { view::read_in_memory(names_base + i as usize * 4) };
            let mut name = read_name(self.base, name_rva);
            if lower {
                name.make_ascii_lowercase();
            }
            let index: u16 = unsafe { view::read_in_memory(ordinals_base + i as usize * 2) };
            table.insert(name, index);
        }
        table
    }

    /// The ordinal base (`IMAGE_EXPORT_DIRECTORY::Base`): ordinal numbers
    /// are offset by this much from the raw function-table index.
    pub fn ordinal_base(&self) -> u32 {
        self.dir.base
    }

    fn functions_base(&self) -> usize {
        view::rva_to_va(self.base, self.dir.address_of_functions)
    }

    fn names_base(&self) -> usize {
        view::rva_to_va(self.base, self.dir.address_of_names)
    }

    fn ordinals_base(&self) -> usize {
        view::rva_to_va(self.base, self.dir.address_of_name_ordinals)
    }

    /// Resolve by name. `case_insensitive` matches how system-library
    /// exports are conventionally resolved (spec.md §9's documented
    /// asymmetry versus the loaded module's own exact-match lookup).
    pub fn resolve_by_name(&self, name: &str, case_insensitive: bool) -> Result<usize, ExportError> {
        if self.dir.number_of_functions == 0 || self.dir.number_of_names == 0 {
            return Err(ExportError::NoExports);
        }
        let index = if case_insensitive {
            let table = self.names_lower.get_or_init(|| self.build_name_table(true));
            let mut key = name.to_owned();
            key.make_ascii_lowercase();
            table.get(&key).copied()
        } else {
            let table = self.names_exact.get_or_init(|| self.build_name_table(false));
            table.get(name).copied()
        };
        match index {
            Some(index) => self.function_at(index as u32),
            None => Err(ExportError::NotFound),
        }
    }

    /// Resolve by ordinal (`ordinal - ordinalBase` indexes the function
    /// table directly).
    pub fn resolve_by_ordinal(&self, ordinal: u32) -> Result<usize, ExportError> {
        if self.dir.number_of_functions == 0 {
            return Err(ExportError::NoExports);
        }
        let index = ordinal
            .checked_sub(self.dir.base)
            .ok_or(ExportError::InvalidOrdinal(ordinal))?;
        self.function_at(index)
    }

    fn function_at(&self, index: u32) -> Result<usize, ExportError> {
        if index >= self.dir.number_of_functions {
            return Err(ExportError::InvalidOrdinal(index));
        }
        let func_rva: u32 =
            unsafe { view::read_in_memory(self.functions_base() + index as usize * 4) };
        Ok(view::rva_to_va(self.base, func_rva))
    }

    /// Enumerate every named export, stopping as soon as `f` returns
    /// `true`. Exports with no name entry are not visited (matching the
    /// name-table-driven walk spec.md §4.7 describes).
    pub fn walk(&self, mut f: impl FnMut(ExportEntry) -> bool) {
        let names_base = self.names_base();
        let ordinals_base = self.ordinals_base();
        for i in 0..self.dir.number_of_names {
            let name_rva: u32 = unsafe { view::read_in_memory(names_base + i as usize * 4) };
            let name = read_name(self.base, name_rva);
            let index: u16 = unsafe { view::read_in_memory(ordinals_base + i as usize * 2) };
            let address = match self.function_at(index as u32) {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            let entry = ExportEntry {
                name: Some(name),
                ordinal: self.dir.base + index as u32,
                address,
            };
            if f(entry) {
                return;
            }
        }
    }
}
