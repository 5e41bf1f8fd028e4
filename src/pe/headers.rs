//! Raw, `#[repr(C)]`, `bytemuck`-`Pod` PE structure definitions.
//!
//! These mirror the Windows SDK `IMAGE_*` structures byte-for-byte. Field
//! names follow the SDK's `PascalCase` translated to `snake_case`, not the
//! spec's prose names, so this module reads like every other PE-struct
//! module in the pack (`IsaacMarovitz-pe-parser`'s `coff.rs`/`optional.rs`).

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// `IMAGE_DOS_HEADER`. Only `e_magic` and `e_lfanew` are load-bearing; the
/// rest exists so the struct's size matches the real header exactly.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: u32,
}

/// `"MZ"` as a little-endian `u16`.
pub const DOS_SIGNATURE: u16 = 0x5A4D;
/// `"PE\0\0"` as a little-endian `u32`.
pub const NT_SIGNATURE: u32 = 0x0000_4550;

/// `IMAGE_FILE_HEADER` (the COFF header).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// `IMAGE_FILE_MACHINE_I386`.
pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
/// `IMAGE_FILE_MACHINE_AMD64`.
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

bitflags! {
    /// `IMAGE_FILE_*` flags describing attributes of the image file.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FileCharacteristics: u16 {
        const RELOCS_STRIPPED = 0x0001;
        const EXECUTABLE_IMAGE = 0x0002;
        const LINE_NUMS_STRIPPED = 0x0004;
        const LOCAL_SYMS_STRIPPED = 0x0008;
        const LARGE_ADDRESS_AWARE = 0x0020;
        const DEBUG_STRIPPED = 0x0200;
        const DLL = 0x2000;
    }
}

/// Prefix shared by the `IMAGE_NT_HEADERS{32,64}` structures: the PE
/// signature and the COFF file header. The optional header follows
/// immediately and is decoded separately because its layout depends on
/// `OptionalHeader::magic`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct NtHeadersPrefix {
    pub signature: u32,
    pub file_header: FileHeader,
}

/// `IMAGE_OPTIONAL_HEADER32` magic value.
pub const MAGIC_PE32: u16 = 0x010b;
/// `IMAGE_OPTIONAL_HEADER64` magic value.
pub const MAGIC_PE32_PLUS: u16 = 0x020b;

/// `IMAGE_DATA_DIRECTORY`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// Index of the export data directory entry.
pub const DIR_EXPORT: usize = 0;
/// Index of the import data directory entry.
pub const DIR_IMPORT: usize = 1;
/// Index of the base relocation data directory entry.
pub const DIR_BASERELOC: usize = 5;
/// Index of the TLS data directory entry.
pub const DIR_TLS: usize = 9;

/// `IMAGE_OPTIONAL_HEADER32`, fixed-size prefix (data directories follow).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct OptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// `IMAGE_OPTIONAL_HEADER64`, fixed-size prefix (data directories follow).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// `IMAGE_SECTION_HEADER`.
///
/// `misc` is the `VirtualSize`/`PhysicalAddress` union. The mapper
/// repurposes it to stash a section's mapped destination address (low 32
/// bits); see spec.md §9 "Section `PhysicalAddress` reuse".
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub misc: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_line_numbers: u32,
    pub number_of_relocations: u16,
    pub number_of_line_numbers: u16,
    pub characteristics: u32,
}

bitflags! {
    /// `IMAGE_SCN_*` section characteristics.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SectionCharacteristics: u32 {
        const CNT_CODE = 0x0000_0020;
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const MEM_DISCARDABLE = 0x0200_0000;
        const MEM_NOT_CACHED = 0x0400_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

impl SectionHeader {
    /// The section's logical virtual size (`Misc.VirtualSize`), as written
    /// by the linker, before the mapper overwrites the slot.
    pub fn virtual_size(&self) -> u32 {
        self.misc
    }

    pub fn characteristics(&self) -> SectionCharacteristics {
        SectionCharacteristics::from_bits_truncate(self.characteristics)
    }
}

/// `IMAGE_BASE_RELOCATION` block header.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct BaseRelocationBlock {
    pub page_rva: u32,
    pub block_size: u32,
}

/// Relocation entry types this loader understands (spec.md §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocationType {
    Absolute,
    HighLow,
    Dir64,
    Other(u16),
}

impl From<u16> for RelocationType {
    fn from(raw: u16) -> Self {
        match raw {
            0 => RelocationType::Absolute,
            3 => RelocationType::HighLow,
            10 => RelocationType::Dir64,
            other => RelocationType::Other(other),
        }
    }
}

/// `IMAGE_IMPORT_DESCRIPTOR`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct ImportDescriptor {
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: u32,
    pub first_thunk: u32,
}

impl ImportDescriptor {
    /// An all-zero descriptor marks the end of the import table.
    pub fn is_null(&self) -> bool {
        self.original_first_thunk == 0
            && self.time_date_stamp == 0
            && self.forwarder_chain == 0
            && self.name == 0
            && self.first_thunk == 0
    }
}

/// High bit of a 64-bit thunk value: import-by-ordinal marker
/// (`IMAGE_ORDINAL_FLAG64`).
pub const ORDINAL_FLAG64: u64 = 1 << 63;
/// High bit of a 32-bit thunk value (`IMAGE_ORDINAL_FLAG32`).
pub const ORDINAL_FLAG32: u32 = 1 << 31;

/// `IMAGE_TLS_DIRECTORY64`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct TlsDirectory64 {
    pub start_address_of_raw_data: u64,
    pub end_address_of_raw_data: u64,
    pub address_of_index: u64,
    pub address_of_call_backs: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

/// `IMAGE_TLS_DIRECTORY32`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct TlsDirectory32 {
    pub start_address_of_raw_data: u32,
    pub end_address_of_raw_data: u32,
    pub address_of_index: u32,
    pub address_of_call_backs: u32,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

/// `IMAGE_EXPORT_DIRECTORY`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct ExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name: u32,
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}
