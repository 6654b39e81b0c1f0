//! Host platform interface
//!
//! The loader core is OS-agnostic: every effect it needs from the outside
//! world (host heap, virtual memory, file existence, the real NT loader and
//! heap routines it falls back to) comes through the [`Platform`] trait.
//! The host runtime installs its implementation once, before any library is
//! loaded; unit tests install an in-memory implementation.

use core::ffi::c_void;

use crate::rtl::string::{AnsiString, OemString, UnicodeString};

/// Opaque OS handle (files, heaps, modules).
pub type Handle = *mut c_void;

/// Null handle value.
pub const INVALID_HANDLE: Handle = core::ptr::null_mut();

bitflags::bitflags! {
    /// Page protection bits, host-neutral encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProt: u32 {
        const READ  = 0x1;
        const WRITE = 0x2;
        const EXEC  = 0x4;
    }
}

/// Machine context subset consumed by the per-thread-callback trampoline.
///
/// `xsp` is the stack pointer at the intercepted call; `xcx` is the
/// first-argument register (used on 64-bit, where the callback argument is
/// passed in a register rather than on the stack).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MContext {
    pub xsp: usize,
    pub xcx: usize,
}

/// Dispatch state handed to the loader by the host's dispatch loop.
///
/// When the trampoline redirects a callback it rewrites `mc.xsp` (stdcall
/// cleanup) and stores the continuation address in `next_tag`.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext {
    pub mc: MContext,
    pub next_tag: usize,
}

impl DispatchContext {
    pub fn new(xsp: usize, xcx: usize) -> Self {
        Self {
            mc: MContext { xsp, xcx },
            next_tag: 0,
        }
    }
}

/// Narrow interface onto the host runtime.
///
/// Methods taking raw addresses are `unsafe` where the loader passes
/// addresses it does not itself validate.
pub trait Platform: Sync {
    // --- host heap ---

    /// True once the host's global heap is usable. Before that, the loader
    /// runs in its static bootstrap mode.
    fn heap_initialized(&self) -> bool;

    /// Allocate `size` bytes on the host's global heap. Returns null on
    /// exhaustion. The result must satisfy [`Platform::is_host_address`].
    fn heap_alloc(&self, size: usize) -> *mut u8;

    /// Free a block previously returned by [`Platform::heap_alloc`].
    ///
    /// # Safety
    /// `ptr`/`size` must name exactly one live `heap_alloc` block.
    unsafe fn heap_free(&self, ptr: *mut u8, size: usize);

    // --- virtual memory ---

    fn page_size(&self) -> usize;

    /// Map an image section for the opened file: read|write|execute maximum
    /// protection, copy-on-write, per-segment protections from the section
    /// headers. `pre_heap` selects the low-level mapping primitive that is
    /// safe before the host heap exists (no region bookkeeping).
    fn map_image_file(&self, file: Handle, pre_heap: bool) -> Option<(usize, usize)>;

    /// Unmap an image mapped by [`Platform::map_image_file`].
    ///
    /// # Safety
    /// `base`/`size` must describe a live private mapping.
    unsafe fn unmap_image(&self, base: usize, size: usize, pre_heap: bool);

    /// Change the protection of `[base, base+size)`, returning the previous
    /// protection, or `None` on failure.
    ///
    /// # Safety
    /// `base` must be page-aligned and mapped.
    unsafe fn protect(&self, base: usize, size: usize, prot: PageProt) -> Option<PageProt>;

    /// True iff `addr` lies inside a host-owned region (host image, host
    /// heap, private mappings the host tracks).
    fn is_host_address(&self, addr: usize) -> bool;

    /// Record `[start, end)` in the host's executable-region index so the
    /// dispatch loop recognizes it as host-owned code.
    fn add_host_exec_region(&self, start: usize, end: usize);

    /// True iff `[addr, addr+size)` can be read without faulting.
    fn is_readable(&self, addr: usize, size: usize) -> bool;

    /// Fault-safe read of one machine word.
    fn safe_read_word(&self, addr: usize) -> Option<usize>;

    // --- files ---

    fn file_exists(&self, path: &str) -> bool;

    /// Open for read + execute with share-delete, as image mapping requires.
    fn file_open_image(&self, path: &str) -> Option<Handle>;

    fn file_close(&self, file: Handle);

    // --- process queries ---

    /// The default process heap handle (`PEB.ProcessHeap`).
    fn process_heap(&self) -> Handle;

    /// Windows installation directory, read once from the OS registry.
    fn system_root(&self) -> Option<alloc::string::String>;

    /// Non-zero identifier of the calling thread.
    fn current_thread_id(&self) -> usize;

    /// Allocation span of the OS mapping containing `base`.
    fn allocation_size(&self, base: usize) -> usize;

    /// Base of the OS-loaded `ntdll.dll`.
    fn ntdll_base(&self) -> usize;

    /// Base and short name of the host runtime's own image.
    fn host_image_base(&self) -> usize;
    fn host_image_name(&self) -> &'static str;

    /// Base of the application's `user32.dll`, if loaded.
    fn user32_base(&self) -> Option<usize>;

    // --- native OS-loader fallbacks for the redirection layer ---

    unsafe fn native_rtl_allocate_heap(&self, heap: Handle, flags: u32, size: usize) -> *mut u8;
    unsafe fn native_rtl_reallocate_heap(
        &self,
        heap: Handle,
        flags: u32,
        ptr: *mut u8,
        size: usize,
    ) -> *mut u8;
    unsafe fn native_rtl_free_heap(&self, heap: Handle, flags: u32, ptr: *mut u8) -> bool;
    unsafe fn native_rtl_size_heap(&self, heap: Handle, flags: u32, ptr: *mut u8) -> usize;

    unsafe fn native_free_unicode_string(&self, string: *mut UnicodeString);
    unsafe fn native_free_ansi_string(&self, string: *mut AnsiString);
    unsafe fn native_free_oem_string(&self, string: *mut OemString);

    unsafe fn native_fls_alloc(&self, cb: usize) -> u32;
    unsafe fn native_get_module_handle(&self, name: &str) -> Handle;
    unsafe fn native_get_proc_address(&self, module: Handle, name: &str) -> *const c_void;
}

static PLATFORM: spin::Once<&'static dyn Platform> = spin::Once::new();

/// Install the host platform. Idempotent: the first install wins. Must
/// happen before any load, including pre-heap client-library loads.
pub fn install(platform: &'static dyn Platform) {
    PLATFORM.call_once(|| platform);
}

/// The installed platform.
///
/// # Panics
/// Panics if no platform has been installed; that is a host integration
/// error, not a runtime condition.
pub(crate) fn get() -> &'static dyn Platform {
    match PLATFORM.get() {
        Some(p) => *p,
        None => panic!("host platform not installed"),
    }
}
