//! Private library loader (ldr)
//!
//! Maps PE images, relocates them, binds their imports (recursively
//! loading dependencies and following forwarder chains), invokes their
//! entry points with attach/detach notifications, and unloads in
//! dependency-safe order under reference counts.
//!
//! # Load pipeline
//!
//! ```text
//! load_private_library(path)
//!   map + relocate        (platform mapping, pe::module_rebase)
//!   insert into registry  (before imports: mutual dependencies must
//!                          find the partially-initialized module)
//!   process imports       (recursing into locate-and-load per dependency)
//!   PROCESS_ATTACH        (failure unwinds the whole transitive load)
//! ```
//!
//! All loader state is serialized by one recursive lock: redirected
//! routines (the loader-aware `GetModuleHandleA`, `FlsAlloc`) re-enter the
//! loader from inside private entry points that already hold it.

pub mod pe;

pub(crate) mod imports;
pub(crate) mod registry;
pub(crate) mod search;

#[cfg(test)]
pub(crate) mod fixture;

use alloc::string::ToString;
use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, error, trace, warn};

use crate::platform::{self, Handle, Platform};
use crate::sync::{RecursiveGuard, RecursiveLock};
use crate::fls;

use self::registry::PrivMod;

/// Entry-point notification reasons.
pub const DLL_PROCESS_DETACH: u32 = 0;
pub const DLL_PROCESS_ATTACH: u32 = 1;
pub const DLL_THREAD_ATTACH: u32 = 2;
pub const DLL_THREAD_DETACH: u32 = 3;

/// PE entry points take three args.
type DllMain = unsafe extern "system" fn(Handle, u32, *mut c_void) -> i32;

/// Soft bound on mutual-dependency recursion; deeper chains are permitted
/// but flagged as a probable cycle.
const MAX_LOAD_RECURSION: u32 = 10;

/// Loader failure kinds. The public API surfaces these as null returns
/// after logging; nothing here is an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Could not open the file read|execute|share-delete
    FileOpenFailed,
    /// Image-section mapping failed
    MappingFailed,
    /// Displaced from preferred base with no relocation directory
    NotRelocatable,
    /// Applying base relocations failed
    RelocationFailed,
    /// Directory data unreadable within its declared size
    PartialMap,
    /// A dependency could not be located or loaded
    MissingDependency,
    /// An imported name resolved nowhere, or a forwarder chain dead-ended
    MissingSymbol,
    /// Import by ordinal
    OrdinalUnsupported,
    /// Could not flip IAT page protection
    IATProtectFailed,
    /// PROCESS_ATTACH returned false
    EntryReturnedFailure,
    /// Forwarder module name exceeds the path cap
    ForwarderStringTooLong,
    /// Pre-heap static module table exhausted
    BootstrapTableFull,
    /// Malformed or unreadable PE headers
    InvalidImage,
}

/// Recursive: redirected routines are invoked from private-library entry
/// points that already run under this lock.
static PRIVLOAD_LOCK: RecursiveLock = RecursiveLock::new();

/// Diagnostic depth of the current transitive load.
static PRIVLOAD_RECURSE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Acquire the loader lock (recursively) for the calling thread.
pub(crate) fn lock_loader() -> RecursiveGuard<'static> {
    PRIVLOAD_LOCK.lock()
}

/// Process-level bring-up: installs the host platform, registers the
/// externally-loaded images (the OS `ntdll`, the host's own image, the
/// application's `user32` if present), resolves the system root, and
/// finalizes client libraries that were mapped before the host heap
/// existed.
///
/// # Panics
/// Panics if the initial externally-loaded modules cannot be registered;
/// the host cannot proceed without them.
pub fn loader_init(platform_impl: &'static dyn Platform) {
    platform::install(platform_impl);
    fls::init();

    let _guard = lock_loader();
    let plat = platform::get();
    search::init_systemroot();

    let ntdll = plat.ntdll_base();
    if ntdll == 0 {
        panic!("loader_init: cannot register ntdll");
    }
    registry::insert(None, ntdll, plat.allocation_size(ntdll), "ntdll.dll", true);

    let host = plat.host_image_base();
    if host == 0 {
        panic!("loader_init: cannot register host image");
    }
    registry::insert(
        None,
        host,
        plat.allocation_size(host),
        plat.host_image_name(),
        true,
    );

    // A private user32 would register callbacks the kernel dispatches to;
    // we adopt the application's copy instead.
    if let Some(user32) = plat.user32_base() {
        registry::insert(None, user32, plat.allocation_size(user32), "user32.dll", true);
    }

    // Client libs mapped before the heap existed: transfer to the real
    // registry (carrying any re-load references) and run normal
    // import/entry processing.
    for (base, size, name, refs) in registry::bootstrap_drain() {
        registry::insert(None, base, size, &name, false);
        for _ in 1..refs {
            registry::inc_ref(base);
        }
        debug!("[LDR] processing imports for {}", name);
        if let Err(e) = privload_load_finalize(base) {
            error!("[LDR] failed to finalize client library {}: {:?}", name, e);
        }
    }
}

/// Process-level shutdown: unloads every module. The registry's
/// reverse-dependent order makes a front-first unload loop safe.
pub fn loader_exit() {
    {
        let _guard = lock_loader();
        while let Some(front) = registry::front() {
            privload_unload(front);
        }
    }
    fls::exit();
}

/// Deliver THREAD_ATTACH to every private module, front to back.
pub fn loader_thread_init() {
    let _guard = lock_loader();
    for (base, external) in registry::snapshot() {
        if external {
            continue;
        }
        if let Some(module) = registry::lookup_by_base(base) {
            unsafe {
                privload_call_entry(&module, DLL_THREAD_ATTACH);
            }
        }
    }
}

/// Deliver THREAD_DETACH to every private module, front to back.
pub fn loader_thread_exit() {
    let _guard = lock_loader();
    for (base, external) in registry::snapshot() {
        if external {
            continue;
        }
        if let Some(module) = registry::lookup_by_base(base) {
            unsafe {
                privload_call_entry(&module, DLL_THREAD_DETACH);
            }
        }
    }
}

/// Load a private library, returning its base, or `None` on failure. A
/// library already resident gains a reference and reports its existing
/// base.
pub fn load_private_library(path: &str) -> Option<usize> {
    let _guard = lock_loader();

    let short_name = file_name_of(path);
    if let Some(existing) = registry::lookup(short_name) {
        // Each successful public load pairs with one unload.
        registry::inc_ref(existing.base);
        return Some(existing.base);
    }
    // Modules mapped before the heap existed are parked in the bootstrap
    // table and invisible to the registry until loader_init splices them;
    // a re-load must still find them there rather than mapping again.
    if let Some(parked) = registry::bootstrap_lookup(short_name) {
        registry::bootstrap_inc_ref(parked);
        return Some(parked);
    }

    PRIVLOAD_RECURSE_COUNT.store(0, Ordering::Relaxed);
    match privload_load(path, None) {
        Ok(module) => Some(module.base),
        Err(e) => {
            warn!("[LDR] failed to load {}: {:?}", path, e);
            None
        }
    }
}

/// Drop one reference to the library at `base`; unloads when the count
/// reaches zero. Returns false for an unknown base.
pub fn unload_private_library(base: usize) -> bool {
    let _guard = lock_loader();
    if registry::lookup_by_base(base).is_none() {
        return false;
    }
    privload_unload(base);
    true
}

/// Is `pc` inside any private (not externally-loaded) library?
pub fn in_private_library(pc: usize) -> bool {
    registry::areas_contains(pc)
}

/// Map, register, and (heap permitting) finalize one library. The record
/// is visible to `registry::lookup` before import processing so mutually
/// dependent libraries resolve against the partially-initialized module.
pub(crate) fn privload_load(path: &str, dependent: Option<&PrivMod>) -> Result<PrivMod, LoadError> {
    let depth = PRIVLOAD_RECURSE_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    if depth >= MAX_LOAD_RECURSION {
        warn!(
            "[LDR] load recursion depth {} at {}: dependency cycle?",
            depth, path
        );
    }
    debug!("[LDR] loading {}", path);

    let plat = platform::get();
    let pre_heap = !plat.heap_initialized();
    let (base, size) = privload_map_and_relocate(path, pre_heap)?;

    unsafe {
        if let Ok(info) = pe::parse_pe(base as *const u8) {
            if pe::data_directory(
                base as *const u8,
                &info,
                pe::directory_entry::IMAGE_DIRECTORY_ENTRY_TLS,
            )
            .is_some()
            {
                debug!("[LDR] {} has a TLS directory: not supported", path);
            }
        }
    }

    let name = match unsafe { pe::get_dll_short_name(base as *const u8) } {
        Ok(Some(n)) => n.to_string(),
        _ => file_name_of(path).to_string(),
    };

    if pre_heap {
        // Keep the lib's directory for searching, and park the record in
        // the static table; loader_init finalizes it.
        search::record_client_dir(path);
        if let Err(e) = registry::bootstrap_insert(base, size, &name) {
            unsafe { plat.unmap_image(base, size, true) };
            return Err(e);
        }
        return Ok(PrivMod {
            base,
            size,
            name,
            ref_count: 1,
            externally_loaded: false,
        });
    }

    registry::insert(dependent.map(|d| d.base), base, size, &name, false);
    privload_load_finalize(base)?;
    Ok(PrivMod {
        base,
        size,
        name,
        ref_count: 1,
        externally_loaded: false,
    })
}

/// Post-insert half of a load: address index, imports, PROCESS_ATTACH.
/// Any failure unloads the partial module (which unwinds dependency
/// refcounts) before returning.
fn privload_load_finalize(base: usize) -> Result<(), LoadError> {
    let module = registry::lookup_by_base(base).ok_or(LoadError::InvalidImage)?;

    if !module.externally_loaded {
        registry::areas_add(module.base, module.size);
    }

    if let Err(e) = unsafe { imports::process_imports(&module) } {
        warn!("[LDR] failed to process imports for {}: {:?}", module.name, e);
        privload_unload(base);
        return Err(e);
    }

    if !unsafe { privload_call_entry(&module, DLL_PROCESS_ATTACH) } {
        warn!("[LDR] {} entry routine failed", module.name);
        privload_unload(base);
        return Err(LoadError::EntryReturnedFailure);
    }

    debug!("[LDR] loaded {} @ {:#x}", module.name, module.base);
    Ok(())
}

/// Decrement the refcount of the module at `base`; at zero, detach,
/// release its imports, and unmap. Returns true when the module was freed.
pub(crate) fn privload_unload(base: usize) -> bool {
    let Some(new_count) = registry::dec_ref(base) else {
        return false;
    };
    let Some(module) = registry::lookup_by_base(base) else {
        return false;
    };
    trace!("[LDR] {} refcount => {}", module.name, new_count);
    if new_count > 0 {
        return false;
    }

    debug!("[LDR] unloading {} @ {:#x}", module.name, module.base);
    registry::remove(base);
    if !module.externally_loaded {
        unsafe {
            privload_call_entry(&module, DLL_PROCESS_DETACH);
            // May unload further modules; our record is already unlinked.
            let _ = imports::unload_imports(&module);
            registry::areas_remove(base);
            platform::get().unmap_image(module.base, module.size, false);
        }
    }
    true
}

/// Search the fixed path order for a dependency short name and load the
/// first hit. Failed candidates are skipped, not fatal.
pub(crate) fn privload_locate_and_load(
    short_name: &str,
    dependent: Option<&PrivMod>,
) -> Option<PrivMod> {
    let plat = platform::get();
    for path in search::candidate_paths(short_name) {
        trace!("[LDR] looking for {}", path);
        if !plat.file_exists(&path) {
            continue;
        }
        match privload_load(&path, dependent) {
            Ok(module) => return Some(module),
            Err(e) => warn!("[LDR] candidate {} failed: {:?}", path, e),
        }
    }
    warn!("[LDR] unable to locate dependency {}", short_name);
    None
}

/// Open, image-map, and if displaced rebase one file. The descriptor is
/// closed as soon as the mapping exists. On any later failure the mapping
/// is released before returning.
fn privload_map_and_relocate(path: &str, pre_heap: bool) -> Result<(usize, usize), LoadError> {
    let plat = platform::get();

    // read|execute is required to create an rwx section; share-delete
    // allows renames while we hold the mapping.
    let fd = plat.file_open_image(path).ok_or(LoadError::FileOpenFailed)?;
    let mapped = plat.map_image_file(fd, pre_heap);
    plat.file_close(fd);
    let (base, size) = mapped.ok_or(LoadError::MappingFailed)?;

    let fail = |e: LoadError| -> LoadError {
        unsafe { plat.unmap_image(base, size, pre_heap) };
        e
    };

    let pref = match unsafe { pe::get_module_preferred_base(base as *const u8) } {
        Ok(p) => p,
        Err(e) => return Err(fail(e)),
    };
    if pref != base {
        debug!("[LDR] relocating {} from {:#x} to {:#x}", path, pref, base);
        match unsafe { pe::module_file_relocatable(base as *const u8) } {
            Ok(true) => {}
            Ok(false) => return Err(fail(LoadError::NotRelocatable)),
            Err(e) => return Err(fail(e)),
        }
        let delta = base.wrapping_sub(pref) as isize;
        if let Err(e) = unsafe { pe::module_rebase(base as *mut u8, size, delta) } {
            return Err(fail(e));
        }
    }
    Ok((base, size))
}

/// Invoke the module entry for `reason`. Modules with no entry point
/// (entry address equal to the base, the address helper's convention for
/// an RVA of zero) are skipped. Returns false only when the entry itself
/// reports failure.
unsafe fn privload_call_entry(module: &PrivMod, reason: u32) -> bool {
    let entry = match pe::get_module_entry(module.base as *const u8) {
        Ok(e) => e,
        Err(e) => {
            warn!("[LDR] cannot read entry of {}: {:?}", module.name, e);
            return true;
        }
    };
    if entry == module.base {
        return true;
    }
    trace!(
        "[LDR] calling {} entry {:#x} for reason {}",
        module.name,
        entry,
        reason
    );
    let func: DllMain = core::mem::transmute(entry);
    func(module.base as Handle, reason, core::ptr::null_mut()) != 0
}

/// Final path component of `path`.
fn file_name_of(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(i) => &path[i + 1..],
        None => path,
    }
}
