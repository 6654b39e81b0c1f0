//! Process-heap redirection
//!
//! Private libraries allocate through `RtlAllocateHeap(PEB.ProcessHeap, …)`.
//! Redirecting those calls onto the host heap keeps private allocations
//! out of the application's heap entirely. Only the default process heap
//! is redirected; explicitly created heaps pass through.
//!
//! Each private allocation is prefixed with a machine-word header holding
//! the total block size, so free/realloc/size recover it without a side
//! table. Ownership on the release side is decided by the host's
//! address-range predicate, which tolerates alloc/free pairs that cross
//! the redirection boundary (an allocation intercepted here but freed via
//! a pointer obtained natively, and vice-versa).

use core::mem::size_of;
use core::ptr;

use log::{trace, warn};

use crate::platform::{self, Handle};

/// Size header prepended to every private allocation.
pub const HEAP_HEADER_SIZE: usize = size_of::<usize>();

/// Required alignment of process-heap allocations.
pub const HEAP_ALIGNMENT: usize = size_of::<usize>();

// The header must not break allocation alignment.
const _: () = assert!(HEAP_HEADER_SIZE >= HEAP_ALIGNMENT);

bitflags::bitflags! {
    /// Heap API flags. Only `ZERO_MEMORY` changes behavior here;
    /// `GENERATE_EXCEPTIONS` is diagnosed and ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        /// Caller handles locking
        const NO_SERIALIZE        = 0x0000_0001;
        /// Heap is growable
        const GROWABLE            = 0x0000_0002;
        /// Raise on allocation failure
        const GENERATE_EXCEPTIONS = 0x0000_0004;
        /// Zero the allocation
        const ZERO_MEMORY         = 0x0000_0008;
    }
}

/// `RtlAllocateHeap` replacement: process-heap requests come from the
/// host heap, everything else passes through.
///
/// # Safety
/// Standard heap-API contract; `heap` must be a heap handle.
pub unsafe extern "system" fn redirect_rtl_allocate_heap(
    heap: Handle,
    flags: u32,
    size: usize,
) -> *mut u8 {
    let plat = platform::get();
    if heap != plat.process_heap() {
        let res = plat.native_rtl_allocate_heap(heap, flags, size);
        trace!("[RTL] native alloc {:p} {:#x}", res, size);
        return res;
    }

    let flags = HeapFlags::from_bits_truncate(flags);
    let total = size + HEAP_HEADER_SIZE;
    let block = plat.heap_alloc(total);
    if block.is_null() {
        if flags.contains(HeapFlags::GENERATE_EXCEPTIONS) {
            warn!("[RTL] HEAP_GENERATE_EXCEPTIONS not supported");
        }
        return ptr::null_mut();
    }
    ptr::write(block as *mut usize, total);
    let payload = block.add(HEAP_HEADER_SIZE);
    if flags.contains(HeapFlags::ZERO_MEMORY) {
        ptr::write_bytes(payload, 0, size);
    }
    trace!("[RTL] alloc {:p} {:#x}", payload, size);
    payload
}

/// `RtlFreeHeap` replacement. Frees privately only when the pointer is a
/// process-heap request *and* lies in host-owned memory; a native pointer
/// reaching us (alloc intercepted elsewhere up the stack) falls through.
///
/// # Safety
/// `ptr` must be live if non-null.
pub unsafe extern "system" fn redirect_rtl_free_heap(
    heap: Handle,
    flags: u32,
    ptr_arg: *mut u8,
) -> bool {
    let plat = platform::get();
    if heap == plat.process_heap() {
        if ptr_arg.is_null() {
            return false;
        }
        if plat.is_host_address(ptr_arg as usize) {
            trace!("[RTL] free {:p}", ptr_arg);
            let block = ptr_arg.sub(HEAP_HEADER_SIZE);
            let total = ptr::read(block as *const usize);
            plat.heap_free(block, total);
            return true;
        }
    }
    trace!("[RTL] native free {:p}", ptr_arg);
    plat.native_rtl_free_heap(heap, flags, ptr_arg)
}

/// `RtlSizeHeap` replacement: recovers the requested size from the block
/// header for private allocations.
///
/// # Safety
/// `ptr` must be live if non-null.
pub unsafe extern "system" fn redirect_rtl_size_heap(
    heap: Handle,
    flags: u32,
    ptr_arg: *mut u8,
) -> usize {
    let plat = platform::get();
    if heap == plat.process_heap() {
        if ptr_arg.is_null() {
            return 0;
        }
        if plat.is_host_address(ptr_arg as usize) {
            let total = ptr::read(ptr_arg.sub(HEAP_HEADER_SIZE) as *const usize);
            return total - HEAP_HEADER_SIZE;
        }
    }
    plat.native_rtl_size_heap(heap, flags, ptr_arg)
}

/// `RtlReAllocateHeap` replacement. A null pointer allocates fresh (the
/// OS routine re-allocates zero-sized too).
///
/// # Safety
/// `ptr` must be live if non-null.
pub unsafe extern "system" fn redirect_rtl_reallocate_heap(
    heap: Handle,
    flags: u32,
    ptr_arg: *mut u8,
    size: usize,
) -> *mut u8 {
    let plat = platform::get();
    if heap == plat.process_heap()
        && (ptr_arg.is_null() || plat.is_host_address(ptr_arg as usize))
    {
        trace!("[RTL] realloc {:p} {:#x}", ptr_arg, size);
        let fresh = redirect_rtl_allocate_heap(heap, flags, size);
        if !fresh.is_null() && !ptr_arg.is_null() {
            let old_total = ptr::read(ptr_arg.sub(HEAP_HEADER_SIZE) as *const usize);
            let preserved = core::cmp::min(old_total - HEAP_HEADER_SIZE, size);
            ptr::copy_nonoverlapping(ptr_arg, fresh, preserved);
        }
        if !ptr_arg.is_null() {
            redirect_rtl_free_heap(heap, flags, ptr_arg);
        }
        return fresh;
    }
    let res = plat.native_rtl_reallocate_heap(heap, flags, ptr_arg, size);
    trace!("[RTL] native realloc {:p} {:#x}", res, size);
    res
}
