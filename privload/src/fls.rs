//! Per-thread-callback (FLS) trampoline
//!
//! FLS callbacks registered by private libraries must run natively, not be
//! interpreted by the host. `FlsAlloc` is redirected here: callbacks that
//! point into a private library are recorded, the callback address is
//! added to the host's executable-region index, and the real `FlsAlloc`
//! still runs so the OS allocates the slot. When the host's dispatch loop
//! later lands on a recorded callback address it calls
//! [`private_lib_handle_cb`], which invokes the callback natively and
//! resumes the caller.
//!
//! The list has a permanent sentinel head (inserts never write the head
//! pointer) and entries are never removed: a callback can fire at thread
//! exit or at explicit FLS teardown, and the dispatch context does not say
//! which, so stale entries are preferred to use-after-free.

use alloc::boxed::Box;
use core::ffi::c_void;
use core::mem::size_of;
use core::ptr;

use log::{debug, trace};

use crate::ldr;
use crate::platform::{self, DispatchContext};

struct FlsNode {
    /// Callback address; 0 marks the sentinel.
    cb: usize,
    next: *mut FlsNode,
}

struct FlsList {
    head: *mut FlsNode,
}

// Nodes are owned by the list and only touched under its lock.
unsafe impl Send for FlsList {}

/// Non-recursive and separate from the loader lock: callback lookups sit
/// on the dispatch hot path and must not contend with loads.
static FLS_CB_LIST: spin::Mutex<FlsList> = spin::Mutex::new(FlsList {
    head: ptr::null_mut(),
});

/// Allocate the permanent sentinel. Called from `loader_init`.
pub(crate) fn init() {
    let mut list = FLS_CB_LIST.lock();
    if list.head.is_null() {
        list.head = Box::into_raw(Box::new(FlsNode {
            cb: 0,
            next: ptr::null_mut(),
        }));
    }
}

/// Free the whole list, sentinel included. Called from `loader_exit`.
pub(crate) fn exit() {
    let mut list = FLS_CB_LIST.lock();
    let mut node = list.head;
    list.head = ptr::null_mut();
    while !node.is_null() {
        let boxed = unsafe { Box::from_raw(node) };
        node = boxed.next;
    }
}

/// `FlsAlloc` replacement. Records private-library callbacks, publishes
/// the callback address as host-owned executable code, then delegates so
/// the OS still allocates the slot.
///
/// # Safety
/// `cb` must be a callable FLS callback or null; this is the OS contract
/// for `FlsAlloc` itself.
pub unsafe extern "system" fn redirect_fls_alloc(cb: *const c_void) -> u32 {
    let pc = cb as usize;
    if ldr::in_private_library(pc) {
        {
            let mut list = FLS_CB_LIST.lock();
            if !list.head.is_null() {
                let node = Box::into_raw(Box::new(FlsNode {
                    cb: pc,
                    next: (*list.head).next,
                }));
                (*list.head).next = node;
            }
        }
        let plat = platform::get();
        if !plat.is_host_address(pc) {
            // Never removed: cheap to keep, and future executions of the
            // same callback stay recognizable.
            plat.add_host_exec_region(pc, pc + 1);
        }
        debug!("[LDR] recorded private FLS callback {:#x}", pc);
    }
    platform::get().native_fls_alloc(pc)
}

/// Handle a dispatch-loop arrival at `pc`. If `pc` is a recorded private
/// FLS callback, invoke it natively with its argument, perform the
/// stdcall cleanup on the context's stack pointer, and point `next_tag`
/// at the extracted return address. Returns true when redirected.
pub fn private_lib_handle_cb(ctx: &mut DispatchContext, pc: usize) -> bool {
    let list = FLS_CB_LIST.lock();
    let mut node = list.head;
    let mut redirected = false;
    while !node.is_null() {
        let entry = unsafe { &*node };
        trace!("[LDR] comparing cb {:#x} to pc {:#x}", entry.cb, pc);
        if entry.cb != 0 && entry.cb == pc {
            redirected = true;
            let plat = platform::get();
            let Some(retaddr) = plat.safe_read_word(ctx.mc.xsp) else {
                // Unreadable stack: let the host interpret the routine.
                redirected = false;
                break;
            };

            #[cfg(target_pointer_width = "64")]
            let arg = ctx.mc.xcx;
            #[cfg(target_pointer_width = "32")]
            let arg = plat
                .safe_read_word(ctx.mc.xsp + size_of::<usize>())
                .unwrap_or(0);

            trace!(
                "[LDR] native call to FLS cb {:#x}, resume at {:#x}",
                pc,
                retaddr
            );
            unsafe {
                let func: unsafe extern "system" fn(*mut c_void) =
                    core::mem::transmute(entry.cb);
                func(arg as *mut c_void);
            }
            // stdcall cleanup: pop the return address, and on 32-bit the
            // stack-passed argument too.
            ctx.mc.xsp += size_of::<usize>();
            #[cfg(target_pointer_width = "32")]
            {
                ctx.mc.xsp += size_of::<usize>();
            }
            ctx.next_tag = retaddr;
            break;
        }
        node = entry.next;
    }
    redirected
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    exit();
}
