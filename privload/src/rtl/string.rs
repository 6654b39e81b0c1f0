//! NT counted strings (UNICODE_STRING, ANSI_STRING, OEM_STRING)
//!
//! NT strings carry an explicit length and buffer capacity and are not
//! necessarily NUL-terminated. The loader cares about their `buffer`
//! field: descriptors whose buffer was allocated by the redirected
//! process-heap routines must be released there, not handed to the OS.

use core::ptr;

use crate::platform;
use crate::rtl::heap;

/// Wide counted string, equivalent to NT's UNICODE_STRING.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UnicodeString {
    /// Current length in bytes (not characters)
    pub length: u16,
    /// Buffer capacity in bytes
    pub maximum_length: u16,
    /// UTF-16LE buffer
    pub buffer: *mut u16,
}

impl UnicodeString {
    pub const fn empty() -> Self {
        Self {
            length: 0,
            maximum_length: 0,
            buffer: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// 8-bit counted string, equivalent to NT's ANSI_STRING.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AnsiString {
    pub length: u16,
    pub maximum_length: u16,
    pub buffer: *mut u8,
}

impl AnsiString {
    pub const fn empty() -> Self {
        Self {
            length: 0,
            maximum_length: 0,
            buffer: ptr::null_mut(),
        }
    }
}

/// OEM strings share the ANSI layout.
pub type OemString = AnsiString;

/// Free a UNICODE_STRING. A buffer on the host heap (a private allocation
/// that reached the OS free path from a different caller) is released
/// privately and the descriptor zeroed; anything else goes to the OS.
///
/// # Safety
/// `string` must point to a live descriptor.
pub unsafe extern "system" fn redirect_rtl_free_unicode_string(string: *mut UnicodeString) {
    let plat = platform::get();
    let buffer = (*string).buffer;
    if plat.is_host_address(buffer as usize) {
        heap::redirect_rtl_free_heap(plat.process_heap(), 0, buffer as *mut u8);
        ptr::write(string, UnicodeString::empty());
    } else {
        plat.native_free_unicode_string(string);
    }
}

/// ANSI analog of [`redirect_rtl_free_unicode_string`].
///
/// # Safety
/// `string` must point to a live descriptor.
pub unsafe extern "system" fn redirect_rtl_free_ansi_string(string: *mut AnsiString) {
    let plat = platform::get();
    let buffer = (*string).buffer;
    if plat.is_host_address(buffer as usize) {
        heap::redirect_rtl_free_heap(plat.process_heap(), 0, buffer);
        ptr::write(string, AnsiString::empty());
    } else {
        plat.native_free_ansi_string(string);
    }
}

/// OEM analog of [`redirect_rtl_free_unicode_string`].
///
/// # Safety
/// `string` must point to a live descriptor.
pub unsafe extern "system" fn redirect_rtl_free_oem_string(string: *mut OemString) {
    let plat = platform::get();
    let buffer = (*string).buffer;
    if plat.is_host_address(buffer as usize) {
        heap::redirect_rtl_free_heap(plat.process_heap(), 0, buffer);
        ptr::write(string, OemString::empty());
    } else {
        plat.native_free_oem_string(string);
    }
}
