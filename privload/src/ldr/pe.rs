//! PE (Portable Executable) format definitions and image accessors
//!
//! Covers exactly the subset of the format the private loader consumes:
//! DOS/NT headers, the optional header in both widths (PE32 magic 0x10B,
//! PE32+ magic 0x20B), data directories, import descriptors and thunks,
//! the export directory (including forwarders), and base relocations.
//! Bound imports, delay-load, TLS, and resources are recognized only far
//! enough to diagnose them.
//!
//! All accessors take the raw base of a *mapped* image. Headers are read
//! with unaligned copies, never held by reference, so a hostile `e_lfanew`
//! cannot manufacture a misaligned reference. Directory contents are only
//! dereferenced after a readability check over the directory's declared
//! size; a violation surfaces as [`LoadError::PartialMap`].

use core::mem::size_of;
use core::ptr;

use super::LoadError;
use crate::platform;

/// DOS header signature ("MZ")
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D;

/// PE signature ("PE\0\0")
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;

/// PE32 optional header magic
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10B;

/// PE32+ (64-bit) optional header magic
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

/// Number of data directory slots
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

/// Ordinal-import flag for 64-bit thunks
pub const IMAGE_ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

/// Ordinal-import flag for 32-bit thunks
pub const IMAGE_ORDINAL_FLAG32: u32 = 0x8000_0000;

/// Ordinal-import flag at the native thunk width
#[cfg(target_pointer_width = "64")]
pub const IMAGE_ORDINAL_FLAG: usize = IMAGE_ORDINAL_FLAG64 as usize;
#[cfg(target_pointer_width = "32")]
pub const IMAGE_ORDINAL_FLAG: usize = IMAGE_ORDINAL_FLAG32 as usize;

/// Longest import/export name we will follow
pub const MAX_SYMBOL_NAME: usize = 256;

/// File characteristics flags
pub mod file_characteristics {
    /// Relocation info stripped from file
    pub const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;
    /// File is executable
    pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
    /// File is a DLL
    pub const IMAGE_FILE_DLL: u16 = 0x2000;
}

/// Data directory entry indices
pub mod directory_entry {
    /// Export directory
    pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
    /// Import directory
    pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
    /// Base relocation table
    pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
    /// TLS directory
    pub const IMAGE_DIRECTORY_ENTRY_TLS: usize = 9;
    /// Bound import directory
    pub const IMAGE_DIRECTORY_ENTRY_BOUND_IMPORT: usize = 11;
    /// Delay-load import descriptors
    pub const IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT: usize = 13;
}

/// Relocation types
pub mod relocation_type {
    /// Padding entry, ignored
    pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
    /// Add the high 16 bits of the delta
    pub const IMAGE_REL_BASED_HIGH: u16 = 1;
    /// Add the low 16 bits of the delta
    pub const IMAGE_REL_BASED_LOW: u16 = 2;
    /// 32-bit delta
    pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
    /// 64-bit delta (PE32+)
    pub const IMAGE_REL_BASED_DIR64: u16 = 10;
}

/// DOS header (IMAGE_DOS_HEADER). Only the magic and the PE offset matter
/// here; the rest is carried for layout fidelity.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ImageDosHeader {
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
    /// File offset of the NT headers
    pub e_lfanew: i32,
}

/// COFF file header (IMAGE_FILE_HEADER)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ImageFileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Data directory entry (IMAGE_DATA_DIRECTORY)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl ImageDataDirectory {
    /// Check if this directory entry is present
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

/// Optional header PE32 (32-bit)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ImageOptionalHeader32 {
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
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [ImageDataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

/// Optional header PE32+ (64-bit)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ImageOptionalHeader64 {
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
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [ImageDataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

/// Import descriptor (IMAGE_IMPORT_DESCRIPTOR)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ImageImportDescriptor {
    /// RVA of the original first thunk (name-lookup table)
    pub original_first_thunk: u32,
    /// 0 = not bound, -1 = new bind, other = old bind timestamp
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    /// RVA of the dependency's short-name string
    pub name: u32,
    /// RVA of the first thunk (IAT, written with resolved addresses)
    pub first_thunk: u32,
}

impl ImageImportDescriptor {
    /// Check if this is the null terminator
    pub fn is_null(&self) -> bool {
        self.original_first_thunk == 0 && self.name == 0 && self.first_thunk == 0
    }
}

/// Export directory (IMAGE_EXPORT_DIRECTORY)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ImageExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    /// RVA of the DLL short-name string
    pub name: u32,
    /// Ordinal base
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

/// Base relocation block header (IMAGE_BASE_RELOCATION), followed by a
/// variable number of u16 entries
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ImageBaseRelocation {
    pub virtual_address: u32,
    pub size_of_block: u32,
}

impl ImageBaseRelocation {
    /// Number of relocation entries in this block
    pub fn entry_count(&self) -> usize {
        if (self.size_of_block as usize) < size_of::<ImageBaseRelocation>() {
            0
        } else {
            (self.size_of_block as usize - size_of::<ImageBaseRelocation>()) / 2
        }
    }
}

/// Relocation type from a block entry
pub fn reloc_type(entry: u16) -> u16 {
    entry >> 12
}

/// Relocation page offset from a block entry
pub fn reloc_offset(entry: u16) -> u16 {
    entry & 0x0FFF
}

// ============================================================================
// Parsed image view
// ============================================================================

/// Header fields the loader consumes, copied out of a mapped image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeInfo {
    pub is_64bit: bool,
    pub is_dll: bool,
    pub machine: u16,
    pub preferred_base: u64,
    pub size_of_image: u32,
    pub entry_point_rva: u32,
    pub relocs_stripped: bool,
    number_of_rva_and_sizes: u32,
    /// Image offset of the data directory array
    directory_offset: usize,
}

/// Parse the headers of a mapped PE image.
///
/// # Safety
/// `base` must point to mapped memory; readability of the header region is
/// verified before any dereference.
pub unsafe fn parse_pe(base: *const u8) -> Result<PeInfo, LoadError> {
    let plat = platform::get();
    if base.is_null() || !plat.is_readable(base as usize, size_of::<ImageDosHeader>()) {
        return Err(LoadError::InvalidImage);
    }
    let dos: ImageDosHeader = ptr::read_unaligned(base as *const ImageDosHeader);
    if dos.e_magic != IMAGE_DOS_SIGNATURE || dos.e_lfanew < 0 {
        return Err(LoadError::InvalidImage);
    }

    let nt_offset = dos.e_lfanew as usize;
    // Signature + file header + the largest optional header we accept.
    let headers_span = 4 + size_of::<ImageFileHeader>() + size_of::<ImageOptionalHeader64>();
    if !plat.is_readable(base as usize + nt_offset, headers_span) {
        return Err(LoadError::InvalidImage);
    }

    let signature = ptr::read_unaligned(base.add(nt_offset) as *const u32);
    if signature != IMAGE_NT_SIGNATURE {
        return Err(LoadError::InvalidImage);
    }

    let file: ImageFileHeader =
        ptr::read_unaligned(base.add(nt_offset + 4) as *const ImageFileHeader);
    let opt_offset = nt_offset + 4 + size_of::<ImageFileHeader>();
    let magic = ptr::read_unaligned(base.add(opt_offset) as *const u16);

    let mut info = PeInfo {
        is_64bit: false,
        is_dll: (file.characteristics & file_characteristics::IMAGE_FILE_DLL) != 0,
        machine: file.machine,
        preferred_base: 0,
        size_of_image: 0,
        entry_point_rva: 0,
        relocs_stripped: (file.characteristics & file_characteristics::IMAGE_FILE_RELOCS_STRIPPED)
            != 0,
        number_of_rva_and_sizes: 0,
        directory_offset: 0,
    };

    match magic {
        IMAGE_NT_OPTIONAL_HDR64_MAGIC => {
            let opt: ImageOptionalHeader64 =
                ptr::read_unaligned(base.add(opt_offset) as *const ImageOptionalHeader64);
            info.is_64bit = true;
            info.preferred_base = opt.image_base;
            info.size_of_image = opt.size_of_image;
            info.entry_point_rva = opt.address_of_entry_point;
            info.number_of_rva_and_sizes = opt.number_of_rva_and_sizes;
            info.directory_offset = opt_offset + size_of::<ImageOptionalHeader64>()
                - size_of::<[ImageDataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES]>();
        }
        IMAGE_NT_OPTIONAL_HDR32_MAGIC => {
            let opt: ImageOptionalHeader32 =
                ptr::read_unaligned(base.add(opt_offset) as *const ImageOptionalHeader32);
            info.preferred_base = opt.image_base as u64;
            info.size_of_image = opt.size_of_image;
            info.entry_point_rva = opt.address_of_entry_point;
            info.number_of_rva_and_sizes = opt.number_of_rva_and_sizes;
            info.directory_offset = opt_offset + size_of::<ImageOptionalHeader32>()
                - size_of::<[ImageDataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES]>();
        }
        _ => return Err(LoadError::InvalidImage),
    }
    Ok(info)
}

/// Check that `base` carries readable, well-formed PE headers.
///
/// # Safety
/// See [`parse_pe`].
pub unsafe fn is_readable_pe_base(base: *const u8) -> bool {
    parse_pe(base).is_ok()
}

/// Copy out one data directory entry, `None` when absent or empty.
///
/// # Safety
/// `base` must carry readable PE headers.
pub unsafe fn data_directory(
    base: *const u8,
    info: &PeInfo,
    index: usize,
) -> Option<ImageDataDirectory> {
    if index >= IMAGE_NUMBEROF_DIRECTORY_ENTRIES || index >= info.number_of_rva_and_sizes as usize {
        return None;
    }
    let dir: ImageDataDirectory = ptr::read_unaligned(
        base.add(info.directory_offset + index * size_of::<ImageDataDirectory>())
            as *const ImageDataDirectory,
    );
    if dir.is_present() {
        Some(dir)
    } else {
        None
    }
}

/// Bounds of a directory, guarded both structurally (inside the declared
/// image span) and by host readability. `Ok(None)` when absent.
///
/// # Safety
/// `base` must carry readable PE headers.
pub unsafe fn directory_bounds(
    base: *const u8,
    info: &PeInfo,
    index: usize,
) -> Result<Option<(usize, usize)>, LoadError> {
    let Some(dir) = data_directory(base, info, index) else {
        return Ok(None);
    };
    let va = dir.virtual_address as usize;
    let size = dir.size as usize;
    let end = va.checked_add(size).ok_or(LoadError::PartialMap)?;
    if end > info.size_of_image as usize {
        return Err(LoadError::PartialMap);
    }
    if !platform::get().is_readable(base as usize + va, size) {
        return Err(LoadError::PartialMap);
    }
    Ok(Some((base as usize + va, size)))
}

/// Preferred load base from the optional header.
///
/// # Safety
/// `base` must point to a mapped PE image.
pub unsafe fn get_module_preferred_base(base: *const u8) -> Result<usize, LoadError> {
    Ok(parse_pe(base)?.preferred_base as usize)
}

/// Entry address of the image. An image with no entry reports its own base
/// (RVA zero), which callers treat as "no entry point".
///
/// # Safety
/// `base` must point to a mapped PE image.
pub unsafe fn get_module_entry(base: *const u8) -> Result<usize, LoadError> {
    let info = parse_pe(base)?;
    Ok(base as usize + info.entry_point_rva as usize)
}

/// Whether the image can be legally rebased: relocations not stripped and a
/// base-relocation directory present.
///
/// # Safety
/// `base` must point to a mapped PE image.
pub unsafe fn module_file_relocatable(base: *const u8) -> Result<bool, LoadError> {
    let info = parse_pe(base)?;
    Ok(!info.relocs_stripped
        && data_directory(base, &info, directory_entry::IMAGE_DIRECTORY_ENTRY_BASERELOC).is_some())
}

/// Apply all base relocations to an image displaced by `delta` bytes from
/// its preferred base. Target pages are made writable one relocation block
/// at a time and restored afterwards.
///
/// # Safety
/// `base`/`size` must describe a live private image mapping.
pub unsafe fn module_rebase(base: *mut u8, size: usize, delta: isize) -> Result<(), LoadError> {
    if delta == 0 {
        return Ok(());
    }
    let info = parse_pe(base)?;
    let Some((reloc_base, reloc_size)) =
        directory_bounds(base, &info, directory_entry::IMAGE_DIRECTORY_ENTRY_BASERELOC)?
    else {
        return Err(LoadError::NotRelocatable);
    };

    let plat = platform::get();
    let page_size = plat.page_size();
    let mut block_offset = 0usize;
    while block_offset + size_of::<ImageBaseRelocation>() <= reloc_size {
        let block: ImageBaseRelocation =
            ptr::read_unaligned((reloc_base + block_offset) as *const ImageBaseRelocation);
        if block.virtual_address == 0 && block.size_of_block == 0 {
            break;
        }
        if (block.size_of_block as usize) < size_of::<ImageBaseRelocation>() {
            return Err(LoadError::RelocationFailed);
        }
        let page_va = block.virtual_address as usize;
        if page_va >= size {
            return Err(LoadError::RelocationFailed);
        }

        let page = base as usize + page_va;
        let orig = plat
            .protect(
                page & !(page_size - 1),
                page_size,
                platform::PageProt::READ | platform::PageProt::WRITE,
            )
            .ok_or(LoadError::RelocationFailed)?;

        let entries = reloc_base + block_offset + size_of::<ImageBaseRelocation>();
        for i in 0..block.entry_count() {
            let entry = ptr::read_unaligned((entries + i * 2) as *const u16);
            let target = (base as usize + page_va + reloc_offset(entry) as usize) as *mut u8;
            match reloc_type(entry) {
                relocation_type::IMAGE_REL_BASED_ABSOLUTE => {}
                relocation_type::IMAGE_REL_BASED_HIGHLOW => {
                    let p = target as *mut u32;
                    let value = ptr::read_unaligned(p).wrapping_add(delta as u32);
                    ptr::write_unaligned(p, value);
                }
                relocation_type::IMAGE_REL_BASED_DIR64 => {
                    let p = target as *mut u64;
                    let value = ptr::read_unaligned(p).wrapping_add(delta as u64);
                    ptr::write_unaligned(p, value);
                }
                relocation_type::IMAGE_REL_BASED_HIGH => {
                    let p = target as *mut u16;
                    let value =
                        ptr::read_unaligned(p).wrapping_add(((delta as u64) >> 16) as u16);
                    ptr::write_unaligned(p, value);
                }
                relocation_type::IMAGE_REL_BASED_LOW => {
                    let p = target as *mut u16;
                    let value = ptr::read_unaligned(p).wrapping_add(delta as u16);
                    ptr::write_unaligned(p, value);
                }
                other => {
                    log::warn!("[LDR] unknown relocation type {}", other);
                }
            }
        }

        plat.protect(page & !(page_size - 1), page_size, orig)
            .ok_or(LoadError::RelocationFailed)?;
        block_offset += block.size_of_block as usize;
    }
    Ok(())
}

/// Short name of a DLL from its export directory (e.g. `"kernel32.dll"`).
///
/// # Safety
/// `base` must point to a mapped PE image; the returned str borrows from
/// the image and is valid only while the image stays mapped.
pub unsafe fn get_dll_short_name<'a>(base: *const u8) -> Result<Option<&'a str>, LoadError> {
    let info = parse_pe(base)?;
    let Some((export_base, _)) =
        directory_bounds(base, &info, directory_entry::IMAGE_DIRECTORY_ENTRY_EXPORT)?
    else {
        return Ok(None);
    };
    let exports: ImageExportDirectory =
        ptr::read_unaligned(export_base as *const ImageExportDirectory);
    if exports.name == 0 {
        return Ok(None);
    }
    Ok(Some(cstr(base.add(exports.name as usize))))
}

/// Resolve an export by name.
///
/// Returns `(function, forwarder)`: exactly one is set on a hit, both are
/// `None` on a miss. A forwarder is detected by its RVA landing inside the
/// export directory itself; the forwarder string has the form
/// `"ModuleName.SymbolName"`.
///
/// # Safety
/// `base` must point to a mapped PE image with readable export data; the
/// returned forwarder str borrows from the image.
pub unsafe fn get_proc_address_ex<'a>(
    base: *const u8,
    name: &str,
) -> Result<(Option<usize>, Option<&'a str>), LoadError> {
    let info = parse_pe(base)?;
    let Some((export_base, export_size)) =
        directory_bounds(base, &info, directory_entry::IMAGE_DIRECTORY_ENTRY_EXPORT)?
    else {
        return Ok((None, None));
    };
    let exports: ImageExportDirectory =
        ptr::read_unaligned(export_base as *const ImageExportDirectory);

    let name_table = base.add(exports.address_of_names as usize) as *const u32;
    let ordinal_table = base.add(exports.address_of_name_ordinals as usize) as *const u16;
    let function_table = base.add(exports.address_of_functions as usize) as *const u32;

    // Small module counts: a linear walk each time beats maintaining
    // per-module hash tables.
    for i in 0..exports.number_of_names as usize {
        let name_rva = ptr::read_unaligned(name_table.add(i));
        if cstr(base.add(name_rva as usize)) != name {
            continue;
        }
        let ordinal = ptr::read_unaligned(ordinal_table.add(i)) as usize;
        if ordinal >= exports.number_of_functions as usize {
            return Ok((None, None));
        }
        let function_rva = ptr::read_unaligned(function_table.add(ordinal)) as usize;
        if function_rva == 0 {
            return Ok((None, None));
        }

        let export_start = export_base - base as usize;
        if function_rva >= export_start && function_rva < export_start + export_size {
            // Forwarder: the "address" is a string in the export directory.
            return Ok((None, Some(cstr(base.add(function_rva)))));
        }
        return Ok((Some(base as usize + function_rva), None));
    }
    Ok((None, None))
}

/// Read a NUL-terminated name out of image memory, capped at
/// [`MAX_SYMBOL_NAME`] bytes.
///
/// # Safety
/// `ptr` must point to readable image memory.
pub(crate) unsafe fn cstr<'a>(ptr: *const u8) -> &'a str {
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
        if len >= MAX_SYMBOL_NAME {
            break;
        }
    }
    core::str::from_utf8_unchecked(core::slice::from_raw_parts(ptr, len))
}
