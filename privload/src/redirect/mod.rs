//! Import redirection tables
//!
//! Since a second copy of ntdll is impossible, private copies of kernel32
//! and friends bind against the application's ntdll; imports that would
//! touch shared loader or heap state are rewritten at bind time to
//! private implementations. Two small fixed tables (linear scan; switch to
//! a hashtable if they ever grow) keyed by the final resolving module's
//! short name.
//!
//! Tables are immutable after initialization; no locking needed.

pub mod kernel32;

use core::ffi::c_void;

use crate::fls;
use crate::rtl::{heap, string};

/// One redirected import: symbol name and replacement function.
pub(crate) struct RedirectEntry {
    pub name: &'static str,
    pub func: *const (),
}

// Raw fn addresses in a static table; they are immutable code pointers.
unsafe impl Sync for RedirectEntry {}

/// kernel32's initialization hands these ntdll routines function pointers
/// that it stores globally; letting a private kernel32 register its own
/// would bleed private callbacks into the OS loader. Accept and drop.
unsafe extern "system" fn redirect_ignore_arg1(_arg1: *mut c_void) -> bool {
    true
}

unsafe extern "system" fn redirect_ignore_arg2(_arg1: *mut c_void, _arg2: *mut c_void) -> bool {
    true
}

static REDIRECT_NTDLL: &[RedirectEntry] = &[
    RedirectEntry {
        name: "LdrSetDllManifestProber",
        func: redirect_ignore_arg1 as *const (),
    },
    RedirectEntry {
        name: "RtlSetThreadPoolStartFunc",
        func: redirect_ignore_arg2 as *const (),
    },
    RedirectEntry {
        name: "RtlSetUnhandledExceptionFilter",
        func: redirect_ignore_arg1 as *const (),
    },
    // Only PEB.ProcessHeap use is redirected; other heaps pass through.
    RedirectEntry {
        name: "RtlAllocateHeap",
        func: heap::redirect_rtl_allocate_heap as *const (),
    },
    RedirectEntry {
        name: "RtlReAllocateHeap",
        func: heap::redirect_rtl_reallocate_heap as *const (),
    },
    RedirectEntry {
        name: "RtlFreeHeap",
        func: heap::redirect_rtl_free_heap as *const (),
    },
    RedirectEntry {
        name: "RtlSizeHeap",
        func: heap::redirect_rtl_size_heap as *const (),
    },
    // String creation is not redirected; redirecting the frees keeps host
    // pointers out of the OS heap when creation was a bare RtlAllocateHeap.
    RedirectEntry {
        name: "RtlFreeUnicodeString",
        func: string::redirect_rtl_free_unicode_string as *const (),
    },
    RedirectEntry {
        name: "RtlFreeAnsiString",
        func: string::redirect_rtl_free_ansi_string as *const (),
    },
    RedirectEntry {
        name: "RtlFreeOemString",
        func: string::redirect_rtl_free_oem_string as *const (),
    },
];

static REDIRECT_KERNEL32: &[RedirectEntry] = &[
    // Keep the FlsCallback out of interpreted execution.
    RedirectEntry {
        name: "FlsAlloc",
        func: fls::redirect_fls_alloc as *const (),
    },
    // Loader queries answered from the private registry first; also needed
    // for the FlsAlloc that msvcrt's init locates dynamically.
    RedirectEntry {
        name: "GetModuleHandleA",
        func: kernel32::redirect_get_module_handle_a as *const (),
    },
    RedirectEntry {
        name: "GetProcAddress",
        func: kernel32::redirect_get_proc_address as *const (),
    },
];

/// Replacement for `(module, symbol)`, if one is mandated. Both names
/// compare case-insensitively.
pub(crate) fn redirect_imports(module_name: &str, symbol: &str) -> Option<*const ()> {
    let table = if module_name.eq_ignore_ascii_case("ntdll.dll") {
        REDIRECT_NTDLL
    } else if module_name.eq_ignore_ascii_case("kernel32.dll") {
        REDIRECT_KERNEL32
    } else {
        return None;
    };
    table
        .iter()
        .find(|e| e.name.eq_ignore_ascii_case(symbol))
        .map(|e| e.func)
}
