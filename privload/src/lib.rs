//! Private PE image loader
//!
//! Loads auxiliary libraries (instrumentation clients and their transitive
//! dependencies, e.g. a second copy of the C runtime) inside the address
//! space of an in-process host runtime, without going through the OS
//! user-mode loader. Privately-loaded libraries get their own bases, their
//! own import tables, their own heap allocations, and their own per-thread
//! callbacks, so the host never re-enters application code and never
//! perturbs application-visible loader state.
//!
//! # Architecture
//!
//! ```text
//! load_private_library(path)
//!        |
//!        v
//! +--------------+     +-------------+     +-----------------+
//! | map/relocate | --> | PE reader   | --> | module registry |
//! | (ldr)        |     | (ldr::pe)   |     | (ldr::registry) |
//! +--------------+     +-------------+     +-----------------+
//!        |                                        |
//!        v                                        v
//! +---------------+    +--------------+    +--------------+
//! | import binder | -> | redirection  | -> | entry point  |
//! | (ldr::imports)|    | (redirect,   |    | dispatch     |
//! +---------------+    |  rtl, fls)   |    | (ldr)        |
//!                      +--------------+    +--------------+
//! ```
//!
//! The host supplies the narrow OS surface (mapping, page protection, file
//! existence, the real loader/heap routines) through [`platform::Platform`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fls;
pub mod ldr;
pub mod platform;
pub mod redirect;
pub mod rtl;
pub mod sync;

pub use crate::ldr::{
    in_private_library, load_private_library, loader_exit, loader_init, loader_thread_exit,
    loader_thread_init, unload_private_library, LoadError,
};

pub use crate::fls::private_lib_handle_cb;
pub use crate::platform::{DispatchContext, MContext, Platform};
