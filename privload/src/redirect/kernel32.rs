//! Loader-aware kernel32 replacements
//!
//! `GetModuleHandleA` and `GetProcAddress` consult the private registry
//! before the OS loader, so a private library asking about its own world
//! gets private answers. Intercepting at the Ldr level would be more
//! complete; this is the narrow version the private graph needs.

use core::ffi::c_void;

use log::trace;

use crate::ldr::{self, pe};
use crate::platform::{self, Handle};
use crate::redirect;

/// `GetModuleHandleA` replacement: private registry first, OS loader on a
/// miss.
///
/// # Safety
/// `name` must be null or a readable NUL-terminated string.
pub unsafe extern "system" fn redirect_get_module_handle_a(name: *const u8) -> Handle {
    if name.is_null() {
        return platform::get().native_get_module_handle("");
    }
    let name = pe::cstr(name);
    let private = {
        let _guard = ldr::lock_loader();
        ldr::registry::lookup(name).map(|m| m.base)
    };
    match private {
        Some(base) => {
            trace!("[LDR] GetModuleHandleA {} => {:#x}", name, base);
            base as Handle
        }
        None => platform::get().native_get_module_handle(name),
    }
}

/// `GetProcAddress` replacement. For a private module the redirection
/// table is consulted first (so a dynamically looked-up `RtlAllocateHeap`
/// still lands on the private heap), then the module's export table;
/// forwarded exports resolve to null, as the OS routine reports them.
/// Unknown bases go to the OS loader.
///
/// # Safety
/// `name` must be a readable NUL-terminated string; `module` a module
/// handle.
pub unsafe extern "system" fn redirect_get_proc_address(
    module: Handle,
    name: *const u8,
) -> *const c_void {
    let name = pe::cstr(name);
    trace!("[LDR] GetProcAddress {:p}!{}", module, name);
    let private = {
        let _guard = ldr::lock_loader();
        match ldr::registry::lookup_by_base(module as usize) {
            Some(m) => {
                let resolved = match redirect::redirect_imports(&m.name, name) {
                    Some(replacement) => replacement as *const c_void,
                    None => match pe::get_proc_address_ex(module as *const u8, name) {
                        Ok((Some(func), _)) => func as *const c_void,
                        _ => core::ptr::null(),
                    },
                };
                Some(resolved)
            }
            None => None,
        }
    };
    match private {
        Some(res) => res,
        None => platform::get().native_get_proc_address(module, name),
    }
}
