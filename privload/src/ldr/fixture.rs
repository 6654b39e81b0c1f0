//! Test fixtures: synthetic PE images and an in-memory host platform
//!
//! `ImageBuilder` writes minimal but structurally-honest PE images (both
//! header widths, exports, forwarders, import tables, base relocations)
//! into a byte buffer laid out identically on disk and in memory, so the
//! test platform "maps" by copying. `TestPlatform` implements the host
//! interface over a leaked arena: arena addresses are host addresses,
//! everything else (std allocations, stacks) is application memory.
//!
//! Loader state is process-global, so tests serialize through
//! [`test_env`], which also resets all loader state.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::ldr::{registry, search};
use crate::platform::{self, Handle, PageProt, Platform};
use crate::rtl::string::{AnsiString, OemString, UnicodeString};
use crate::{fls, ldr};

use super::pe::{
    self, file_characteristics, ImageBaseRelocation, ImageDataDirectory, ImageDosHeader,
    ImageExportDirectory, ImageFileHeader, ImageImportDescriptor, IMAGE_NT_SIGNATURE,
    IMAGE_ORDINAL_FLAG,
};

const PAGE: usize = 0x1000;
const IMAGE_SIZE: usize = 0x6000;

const EXPORT_DIR_RVA: usize = 0x1000;
const EXPORT_DIR_SIZE: usize = 0x800;
const EXPORT_FUNCS_RVA: usize = 0x1100;
const EXPORT_NAMES_RVA: usize = 0x1200;
const EXPORT_ORDS_RVA: usize = 0x1300;
const EXPORT_MODNAME_RVA: usize = 0x1340;
const EXPORT_STRINGS_RVA: usize = 0x1380;
const FORWARDER_STRINGS_RVA: usize = 0x1500;

const IMPORT_DESC_RVA: usize = 0x3000;
const IMPORT_OFT_RVA: usize = 0x3200;
const IMPORT_IAT_RVA: usize = 0x3800;
const IMPORT_STRIDE: usize = 0x100;
const IMPORT_HINTS_RVA: usize = 0x4000;
const IMPORT_DLLNAMES_RVA: usize = 0x4800;

const RELOC_DIR_RVA: usize = 0x5000;

/// IAT RVA of the `index`-th import descriptor built by [`ImageBuilder`].
pub(crate) fn iat_rva(index: usize) -> usize {
    IMPORT_IAT_RVA + index * IMPORT_STRIDE
}

enum ImportEntry {
    Name(String),
    Ordinal(u16),
}

/// Builds a mapped-layout PE image in a byte buffer.
pub(crate) struct ImageBuilder {
    name: String,
    preferred_base: u64,
    entry_rva: u32,
    exports: Vec<(String, u32)>,
    forwarders: Vec<(String, String)>,
    imports: Vec<(String, Vec<ImportEntry>)>,
    relocs: Vec<u32>,
    words: Vec<(usize, usize)>,
    no_relocs: bool,
    truncate_exports: bool,
    bound_stamp: u32,
}

impl ImageBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            preferred_base: 0x1000_0000,
            entry_rva: 0,
            exports: Vec::new(),
            forwarders: Vec::new(),
            imports: Vec::new(),
            relocs: Vec::new(),
            words: Vec::new(),
            no_relocs: false,
            truncate_exports: false,
            bound_stamp: 0,
        }
    }

    pub fn preferred_base(mut self, base: u64) -> Self {
        self.preferred_base = base;
        self
    }

    pub fn entry_rva(mut self, rva: u32) -> Self {
        self.entry_rva = rva;
        self
    }

    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push((name.to_string(), rva));
        self
    }

    pub fn forwarder(mut self, name: &str, target: &str) -> Self {
        self.forwarders.push((name.to_string(), target.to_string()));
        self
    }

    pub fn import(mut self, dll: &str, symbols: &[&str]) -> Self {
        self.imports.push((
            dll.to_string(),
            symbols
                .iter()
                .map(|s| ImportEntry::Name(s.to_string()))
                .collect(),
        ));
        self
    }

    pub fn ordinal_import(mut self, dll: &str, ordinal: u16) -> Self {
        self.imports
            .push((dll.to_string(), vec![ImportEntry::Ordinal(ordinal)]));
        self
    }

    pub fn native_reloc(mut self, rva: u32) -> Self {
        self.relocs.push(rva);
        self
    }

    pub fn word_at(mut self, rva: usize, value: usize) -> Self {
        self.words.push((rva, value));
        self
    }

    pub fn no_relocations(mut self) -> Self {
        self.no_relocs = true;
        self
    }

    pub fn truncate_export_dir(mut self) -> Self {
        self.truncate_exports = true;
        self
    }

    /// Stamp every import descriptor as bound (old bind), or `u32::MAX`
    /// for new bind.
    pub fn bound(mut self, stamp: u32) -> Self {
        self.bound_stamp = stamp;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut buf = vec![0u8; IMAGE_SIZE];

        for &(rva, value) in &self.words {
            write_usize(&mut buf, rva, value);
        }

        // --- export directory (always present: it names the module) ---
        let mut entries: Vec<(String, u32)> = self.exports.clone();
        let mut fw_bump = FORWARDER_STRINGS_RVA;
        for (name, target) in &self.forwarders {
            entries.push((name.clone(), fw_bump as u32));
            fw_bump = write_cstr(&mut buf, fw_bump, target);
        }
        let mut str_bump = EXPORT_STRINGS_RVA;
        let mut name_rvas = Vec::new();
        for (name, _) in &entries {
            name_rvas.push(str_bump as u32);
            str_bump = write_cstr(&mut buf, str_bump, name);
        }
        write_cstr(&mut buf, EXPORT_MODNAME_RVA, &self.name);
        for (i, (_, func_rva)) in entries.iter().enumerate() {
            write_u32(&mut buf, EXPORT_FUNCS_RVA + 4 * i, *func_rva);
            write_u32(&mut buf, EXPORT_NAMES_RVA + 4 * i, name_rvas[i]);
            write_u16(&mut buf, EXPORT_ORDS_RVA + 2 * i, i as u16);
        }
        let export_dir = ImageExportDirectory {
            characteristics: 0,
            time_date_stamp: 0,
            major_version: 0,
            minor_version: 0,
            name: EXPORT_MODNAME_RVA as u32,
            base: 1,
            number_of_functions: entries.len() as u32,
            number_of_names: entries.len() as u32,
            address_of_functions: EXPORT_FUNCS_RVA as u32,
            address_of_names: EXPORT_NAMES_RVA as u32,
            address_of_name_ordinals: EXPORT_ORDS_RVA as u32,
        };
        write_struct(&mut buf, EXPORT_DIR_RVA, &export_dir);

        // --- import tables ---
        let mut hint_bump = IMPORT_HINTS_RVA;
        let mut dllname_bump = IMPORT_DLLNAMES_RVA;
        for (i, (dll, symbols)) in self.imports.iter().enumerate() {
            let name_rva = dllname_bump;
            dllname_bump = write_cstr(&mut buf, dllname_bump, dll);
            let oft = IMPORT_OFT_RVA + i * IMPORT_STRIDE;
            let iat = IMPORT_IAT_RVA + i * IMPORT_STRIDE;
            for (j, sym) in symbols.iter().enumerate() {
                let thunk = match sym {
                    ImportEntry::Name(s) => {
                        let hint_rva = hint_bump;
                        write_u16(&mut buf, hint_rva, 0);
                        hint_bump = write_cstr(&mut buf, hint_rva + 2, s);
                        hint_bump = (hint_bump + 1) & !1;
                        hint_rva
                    }
                    ImportEntry::Ordinal(ord) => IMAGE_ORDINAL_FLAG | *ord as usize,
                };
                write_usize(&mut buf, oft + j * core::mem::size_of::<usize>(), thunk);
                write_usize(&mut buf, iat + j * core::mem::size_of::<usize>(), thunk);
            }
            let desc = ImageImportDescriptor {
                original_first_thunk: oft as u32,
                time_date_stamp: self.bound_stamp,
                forwarder_chain: 0,
                name: name_rva as u32,
                first_thunk: iat as u32,
            };
            write_struct(
                &mut buf,
                IMPORT_DESC_RVA + i * core::mem::size_of::<ImageImportDescriptor>(),
                &desc,
            );
        }

        // --- base relocations ---
        let mut reloc_size = 0usize;
        if !self.no_relocs {
            if self.relocs.is_empty() {
                // Zero terminator block only.
                reloc_size = core::mem::size_of::<ImageBaseRelocation>();
            } else {
                let mut bump = RELOC_DIR_RVA;
                for &rva in &self.relocs {
                    let block = ImageBaseRelocation {
                        virtual_address: rva & !(PAGE as u32 - 1),
                        size_of_block: 12,
                    };
                    write_struct(&mut buf, bump, &block);
                    let entry = (NATIVE_RELOC_TYPE << 12) | (rva as usize & (PAGE - 1)) as u16;
                    write_u16(&mut buf, bump + 8, entry);
                    write_u16(&mut buf, bump + 10, 0); // ABSOLUTE pad
                    bump += 12;
                }
                reloc_size = bump - RELOC_DIR_RVA;
            }
        }

        // --- headers ---
        let mut dos: ImageDosHeader = unsafe { core::mem::zeroed() };
        dos.e_magic = pe::IMAGE_DOS_SIGNATURE;
        dos.e_lfanew = 0x80;
        write_struct(&mut buf, 0, &dos);
        write_u32(&mut buf, 0x80, IMAGE_NT_SIGNATURE);

        let mut characteristics =
            file_characteristics::IMAGE_FILE_EXECUTABLE_IMAGE | file_characteristics::IMAGE_FILE_DLL;
        if self.no_relocs {
            characteristics |= file_characteristics::IMAGE_FILE_RELOCS_STRIPPED;
        }
        let mut file: ImageFileHeader = unsafe { core::mem::zeroed() };
        file.machine = NATIVE_MACHINE;
        file.number_of_sections = 0;
        file.size_of_optional_header = OPT_HEADER_SIZE as u16;
        file.characteristics = characteristics;
        write_struct(&mut buf, 0x84, &file);

        let export_size = if self.truncate_exports {
            0x1_0000
        } else {
            EXPORT_DIR_SIZE as u32
        };
        let import_size = if self.imports.is_empty() {
            0
        } else {
            ((self.imports.len() + 1) * core::mem::size_of::<ImageImportDescriptor>()) as u32
        };
        write_native_optional_header(
            &mut buf,
            0x98,
            self.preferred_base,
            self.entry_rva,
            export_size,
            import_size,
            reloc_size as u32,
        );

        buf
    }
}

#[cfg(target_pointer_width = "64")]
const NATIVE_MACHINE: u16 = 0x8664;
#[cfg(target_pointer_width = "32")]
const NATIVE_MACHINE: u16 = 0x014C;

#[cfg(target_pointer_width = "64")]
const NATIVE_RELOC_TYPE: u16 = pe::relocation_type::IMAGE_REL_BASED_DIR64;
#[cfg(target_pointer_width = "32")]
const NATIVE_RELOC_TYPE: u16 = pe::relocation_type::IMAGE_REL_BASED_HIGHLOW;

#[cfg(target_pointer_width = "64")]
const OPT_HEADER_SIZE: usize = core::mem::size_of::<pe::ImageOptionalHeader64>();
#[cfg(target_pointer_width = "32")]
const OPT_HEADER_SIZE: usize = core::mem::size_of::<pe::ImageOptionalHeader32>();

#[cfg(target_pointer_width = "64")]
fn write_native_optional_header(
    buf: &mut [u8],
    offset: usize,
    preferred_base: u64,
    entry_rva: u32,
    export_size: u32,
    import_size: u32,
    reloc_size: u32,
) {
    let mut opt: pe::ImageOptionalHeader64 = unsafe { core::mem::zeroed() };
    opt.magic = pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC;
    opt.address_of_entry_point = entry_rva;
    opt.image_base = preferred_base;
    opt.section_alignment = PAGE as u32;
    opt.file_alignment = PAGE as u32;
    opt.size_of_image = IMAGE_SIZE as u32;
    opt.size_of_headers = 0x400;
    opt.number_of_rva_and_sizes = pe::IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32;
    opt.data_directory = directories(export_size, import_size, reloc_size);
    write_struct(buf, offset, &opt);
}

#[cfg(target_pointer_width = "32")]
fn write_native_optional_header(
    buf: &mut [u8],
    offset: usize,
    preferred_base: u64,
    entry_rva: u32,
    export_size: u32,
    import_size: u32,
    reloc_size: u32,
) {
    let mut opt: pe::ImageOptionalHeader32 = unsafe { core::mem::zeroed() };
    opt.magic = pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC;
    opt.address_of_entry_point = entry_rva;
    opt.image_base = preferred_base as u32;
    opt.section_alignment = PAGE as u32;
    opt.file_alignment = PAGE as u32;
    opt.size_of_image = IMAGE_SIZE as u32;
    opt.size_of_headers = 0x400;
    opt.number_of_rva_and_sizes = pe::IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32;
    opt.data_directory = directories(export_size, import_size, reloc_size);
    write_struct(buf, offset, &opt);
}

fn directories(
    export_size: u32,
    import_size: u32,
    reloc_size: u32,
) -> [ImageDataDirectory; pe::IMAGE_NUMBEROF_DIRECTORY_ENTRIES] {
    let mut dirs = [ImageDataDirectory::default(); pe::IMAGE_NUMBEROF_DIRECTORY_ENTRIES];
    dirs[pe::directory_entry::IMAGE_DIRECTORY_ENTRY_EXPORT] = ImageDataDirectory {
        virtual_address: EXPORT_DIR_RVA as u32,
        size: export_size,
    };
    if import_size != 0 {
        dirs[pe::directory_entry::IMAGE_DIRECTORY_ENTRY_IMPORT] = ImageDataDirectory {
            virtual_address: IMPORT_DESC_RVA as u32,
            size: import_size,
        };
    }
    if reloc_size != 0 {
        dirs[pe::directory_entry::IMAGE_DIRECTORY_ENTRY_BASERELOC] = ImageDataDirectory {
            virtual_address: RELOC_DIR_RVA as u32,
            size: reloc_size,
        };
    }
    dirs
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_usize(buf: &mut [u8], offset: usize, value: usize) {
    buf[offset..offset + core::mem::size_of::<usize>()]
        .copy_from_slice(&value.to_le_bytes());
}

/// Write a NUL-terminated string; returns the offset past the NUL.
fn write_cstr(buf: &mut [u8], offset: usize, s: &str) -> usize {
    buf[offset..offset + s.len()].copy_from_slice(s.as_bytes());
    buf[offset + s.len()] = 0;
    offset + s.len() + 1
}

fn write_struct<T: Copy>(buf: &mut [u8], offset: usize, value: &T) {
    unsafe {
        core::ptr::write_unaligned(buf.as_mut_ptr().add(offset) as *mut T, *value);
    }
}

// ============================================================================
// In-memory host platform
// ============================================================================

const ARENA_SIZE: usize = 32 * 1024 * 1024;
const PROCESS_HEAP: usize = 0x7EB0_0000;

pub(crate) struct TestPlatform {
    arena_base: usize,
    arena_size: usize,
    bump: Mutex<usize>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    open_files: Mutex<HashMap<usize, String>>,
    next_file_handle: AtomicUsize,
    live_mappings: AtomicIsize,
    heap_outstanding: AtomicIsize,
    heap_up: AtomicBool,
    prot: Mutex<HashMap<usize, PageProt>>,
    exec_regions: Mutex<Vec<(usize, usize)>>,
    native_heap_allocs: AtomicUsize,
    native_heap_frees: AtomicUsize,
    native_string_frees: AtomicUsize,
    native_fls_allocs: AtomicU32,
    native_module_handle_calls: AtomicUsize,
    ntdll: AtomicUsize,
    ntdll_size: AtomicUsize,
    host_base: AtomicUsize,
    next_tid: AtomicUsize,
}

impl TestPlatform {
    fn new() -> Self {
        let arena = Box::leak(vec![0u8; ARENA_SIZE].into_boxed_slice());
        Self {
            arena_base: arena.as_mut_ptr() as usize,
            arena_size: ARENA_SIZE,
            bump: Mutex::new(0),
            files: Mutex::new(HashMap::new()),
            open_files: Mutex::new(HashMap::new()),
            next_file_handle: AtomicUsize::new(1),
            live_mappings: AtomicIsize::new(0),
            heap_outstanding: AtomicIsize::new(0),
            heap_up: AtomicBool::new(true),
            prot: Mutex::new(HashMap::new()),
            exec_regions: Mutex::new(Vec::new()),
            native_heap_allocs: AtomicUsize::new(0),
            native_heap_frees: AtomicUsize::new(0),
            native_string_frees: AtomicUsize::new(0),
            native_fls_allocs: AtomicU32::new(0),
            native_module_handle_calls: AtomicUsize::new(0),
            ntdll: AtomicUsize::new(0),
            ntdll_size: AtomicUsize::new(0),
            host_base: AtomicUsize::new(0),
            next_tid: AtomicUsize::new(1),
        }
    }

    fn bump_alloc(&self, size: usize, align: usize) -> usize {
        let mut bump = self.bump.lock().unwrap();
        let start = (self.arena_base + *bump + align - 1) & !(align - 1);
        let end = start + size - self.arena_base;
        assert!(end <= self.arena_size, "test arena exhausted");
        *bump = end;
        start
    }

    /// Copy raw bytes into the arena without mapping bookkeeping.
    fn raw_map(&self, image: &[u8]) -> usize {
        let base = self.bump_alloc(image.len(), PAGE);
        unsafe {
            core::ptr::copy_nonoverlapping(image.as_ptr(), base as *mut u8, image.len());
        }
        let mut prot = self.prot.lock().unwrap();
        let mut page = base;
        while page < base + image.len() {
            prot.insert(page, PageProt::READ | PageProt::EXEC);
            page += PAGE;
        }
        base
    }

    fn ensure_fixed_modules(&'static self) {
        if self.ntdll.load(Ordering::SeqCst) == 0 {
            let image = ImageBuilder::new("ntdll.dll")
                .export("NtQueryInformationProcess", 0x2000)
                .export("RtlGetVersion", 0x2008)
                .export("RtlAllocateHeap", 0x2010)
                .export("RtlFreeHeap", 0x2018)
                .export("RtlInitUnicodeString", 0x2020)
                .build();
            self.ntdll_size.store(image.len(), Ordering::SeqCst);
            self.ntdll.store(self.raw_map(&image), Ordering::SeqCst);
        }
        if self.host_base.load(Ordering::SeqCst) == 0 {
            self.host_base.store(self.bump_alloc(PAGE, PAGE), Ordering::SeqCst);
        }
    }

    fn reset(&self) {
        self.files.lock().unwrap().clear();
        self.open_files.lock().unwrap().clear();
        self.live_mappings.store(0, Ordering::SeqCst);
        self.heap_outstanding.store(0, Ordering::SeqCst);
        self.heap_up.store(true, Ordering::SeqCst);
        self.exec_regions.lock().unwrap().clear();
    }
}

impl Platform for TestPlatform {
    fn heap_initialized(&self) -> bool {
        self.heap_up.load(Ordering::SeqCst)
    }

    fn heap_alloc(&self, size: usize) -> *mut u8 {
        self.heap_outstanding.fetch_add(1, Ordering::SeqCst);
        self.bump_alloc(size.max(1), 16) as *mut u8
    }

    unsafe fn heap_free(&self, _ptr: *mut u8, _size: usize) {
        self.heap_outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    fn page_size(&self) -> usize {
        PAGE
    }

    fn map_image_file(&self, file: Handle, _pre_heap: bool) -> Option<(usize, usize)> {
        let path = self.open_files.lock().unwrap().get(&(file as usize)).cloned()?;
        let image = self.files.lock().unwrap().get(&path).cloned()?;
        let base = self.raw_map(&image);
        self.live_mappings.fetch_add(1, Ordering::SeqCst);
        Some((base, image.len()))
    }

    unsafe fn unmap_image(&self, _base: usize, _size: usize, _pre_heap: bool) {
        self.live_mappings.fetch_sub(1, Ordering::SeqCst);
    }

    unsafe fn protect(&self, base: usize, size: usize, prot: PageProt) -> Option<PageProt> {
        let mut map = self.prot.lock().unwrap();
        let mut old = None;
        let mut page = base & !(PAGE - 1);
        while page < base + size {
            let prev = map.insert(page, prot).unwrap_or(PageProt::READ | PageProt::EXEC);
            old.get_or_insert(prev);
            page += PAGE;
        }
        old
    }

    fn is_host_address(&self, addr: usize) -> bool {
        addr >= self.arena_base && addr < self.arena_base + self.arena_size
    }

    fn add_host_exec_region(&self, start: usize, end: usize) {
        self.exec_regions.lock().unwrap().push((start, end));
    }

    fn is_readable(&self, addr: usize, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        addr >= self.arena_base && addr + size <= self.arena_base + self.arena_size
    }

    fn safe_read_word(&self, addr: usize) -> Option<usize> {
        if addr == 0 {
            return None;
        }
        Some(unsafe { core::ptr::read_unaligned(addr as *const usize) })
    }

    fn file_exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn file_open_image(&self, path: &str) -> Option<Handle> {
        if !self.file_exists(path) {
            return None;
        }
        let handle = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        self.open_files
            .lock()
            .unwrap()
            .insert(handle, path.to_string());
        Some(handle as Handle)
    }

    fn file_close(&self, file: Handle) {
        self.open_files.lock().unwrap().remove(&(file as usize));
    }

    fn process_heap(&self) -> Handle {
        PROCESS_HEAP as Handle
    }

    fn system_root(&self) -> Option<String> {
        Some("C:/Windows".to_string())
    }

    fn current_thread_id(&self) -> usize {
        thread_local! {
            static TID: std::cell::OnceCell<usize> = const { std::cell::OnceCell::new() };
        }
        TID.with(|tid| {
            *tid.get_or_init(|| self.next_tid.fetch_add(1, Ordering::SeqCst))
        })
    }

    fn allocation_size(&self, base: usize) -> usize {
        if base == self.ntdll.load(Ordering::SeqCst) {
            self.ntdll_size.load(Ordering::SeqCst)
        } else {
            PAGE
        }
    }

    fn ntdll_base(&self) -> usize {
        self.ntdll.load(Ordering::SeqCst)
    }

    fn host_image_base(&self) -> usize {
        self.host_base.load(Ordering::SeqCst)
    }

    fn host_image_name(&self) -> &'static str {
        "hostcore.dll"
    }

    fn user32_base(&self) -> Option<usize> {
        None
    }

    unsafe fn native_rtl_allocate_heap(&self, _heap: Handle, _flags: u32, size: usize) -> *mut u8 {
        self.native_heap_allocs.fetch_add(1, Ordering::SeqCst);
        Box::leak(vec![0u8; size.max(1)].into_boxed_slice()).as_mut_ptr()
    }

    unsafe fn native_rtl_reallocate_heap(
        &self,
        heap: Handle,
        flags: u32,
        _ptr: *mut u8,
        size: usize,
    ) -> *mut u8 {
        self.native_rtl_allocate_heap(heap, flags, size)
    }

    unsafe fn native_rtl_free_heap(&self, _heap: Handle, _flags: u32, _ptr: *mut u8) -> bool {
        self.native_heap_frees.fetch_add(1, Ordering::SeqCst);
        true
    }

    unsafe fn native_rtl_size_heap(&self, _heap: Handle, _flags: u32, _ptr: *mut u8) -> usize {
        0
    }

    unsafe fn native_free_unicode_string(&self, _string: *mut UnicodeString) {
        self.native_string_frees.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn native_free_ansi_string(&self, _string: *mut AnsiString) {
        self.native_string_frees.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn native_free_oem_string(&self, _string: *mut OemString) {
        self.native_string_frees.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn native_fls_alloc(&self, _cb: usize) -> u32 {
        self.native_fls_allocs.fetch_add(1, Ordering::SeqCst) + 1
    }

    unsafe fn native_get_module_handle(&self, _name: &str) -> Handle {
        self.native_module_handle_calls.fetch_add(1, Ordering::SeqCst);
        core::ptr::null_mut()
    }

    unsafe fn native_get_proc_address(&self, _module: Handle, _name: &str) -> *const core::ffi::c_void {
        core::ptr::null()
    }
}

// ============================================================================
// Test environment
// ============================================================================

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn global() -> &'static TestPlatform {
    static INSTANCE: OnceLock<&'static TestPlatform> = OnceLock::new();
    *INSTANCE.get_or_init(|| Box::leak(Box::new(TestPlatform::new())))
}

/// Serialized, reset loader environment for one test.
pub(crate) struct TestEnv {
    _guard: MutexGuard<'static, ()>,
    plat: &'static TestPlatform,
}

pub(crate) fn test_env() -> TestEnv {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let plat = global();
    platform::install(plat);
    registry::reset_for_tests();
    search::reset_for_tests();
    fls::reset_for_tests();
    plat.reset();
    TestEnv {
        _guard: guard,
        plat,
    }
}

/// Build the fixed external modules and run `loader_init`.
pub(crate) fn loader_init_for_tests(env: &TestEnv) {
    env.plat.ensure_fixed_modules();
    ldr::loader_init(env.plat);
}

/// Copy an image into the arena with no mapping bookkeeping; for header
/// and export tests that bypass the load path.
pub(crate) fn map_raw(image: &[u8]) -> usize {
    global().raw_map(image)
}

impl TestEnv {
    pub fn register_file(&self, path: &str, image: Vec<u8>) {
        self.plat
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), image);
    }

    pub fn set_heap_initialized(&self, up: bool) {
        self.plat.heap_up.store(up, Ordering::SeqCst);
    }

    pub fn process_heap(&self) -> Handle {
        self.plat.process_heap()
    }

    pub fn ntdll_base(&self) -> usize {
        self.plat.ensure_fixed_modules();
        self.plat.ntdll.load(Ordering::SeqCst)
    }

    pub fn is_host_address(&self, addr: usize) -> bool {
        self.plat.is_host_address(addr)
    }

    pub fn native_heap_alloc(&self, size: usize) -> *mut u8 {
        unsafe { self.plat.native_rtl_allocate_heap(core::ptr::null_mut(), 0, size) }
    }

    pub fn native_heap_alloc_count(&self) -> usize {
        self.plat.native_heap_allocs.load(Ordering::SeqCst)
    }

    pub fn native_heap_free_count(&self) -> usize {
        self.plat.native_heap_frees.load(Ordering::SeqCst)
    }

    pub fn native_string_free_count(&self) -> usize {
        self.plat.native_string_frees.load(Ordering::SeqCst)
    }

    pub fn native_fls_alloc_count(&self) -> u32 {
        self.plat.native_fls_allocs.load(Ordering::SeqCst)
    }

    pub fn native_module_handle_count(&self) -> usize {
        self.plat.native_module_handle_calls.load(Ordering::SeqCst)
    }

    pub fn host_exec_regions_contains(&self, pc: usize) -> bool {
        self.plat
            .exec_regions
            .lock()
            .unwrap()
            .iter()
            .any(|&(s, e)| pc >= s && pc < e)
    }

    /// Every mapped page is back at its map-time protection.
    pub fn protections_clean(&self) -> bool {
        self.plat
            .prot
            .lock()
            .unwrap()
            .values()
            .all(|&p| p == (PageProt::READ | PageProt::EXEC))
    }

    /// No live private mappings and no outstanding host-heap blocks.
    pub fn assert_no_leaks(&self) {
        assert_eq!(
            self.plat.live_mappings.load(Ordering::SeqCst),
            0,
            "private mappings leaked"
        );
        assert_eq!(
            self.plat.heap_outstanding.load(Ordering::SeqCst),
            0,
            "host heap blocks leaked"
        );
    }
}
