//! Import binding
//!
//! Walks a module's import directory, loading (or re-referencing) each
//! dependency, resolving every imported name through export tables and
//! forwarder chains, consulting the redirection table, and writing the
//! result into the IAT under temporary page-protection flips.
//!
//! The descriptor walk terminates on the zero descriptor, never on the
//! directory's declared size: kernel32 on win2k declares 10 trailing bytes
//! past the last descriptor.

use alloc::format;
use alloc::string::String;
use core::mem::size_of;
use core::ptr;

use log::{debug, trace, warn};

use crate::platform::{self, PageProt};
use crate::redirect;

use super::pe::{self, directory_entry, ImageImportDescriptor, IMAGE_ORDINAL_FLAG};
use super::registry::{self, PrivMod};
use super::search::MAXIMUM_PATH;
use super::LoadError;

/// Temporary writability for the IAT page under the cursor. The original
/// protection is restored on every page crossing and when binding ends,
/// on success and failure alike.
struct IatProtect {
    page: usize,
    orig: PageProt,
    page_size: usize,
    active: bool,
}

impl IatProtect {
    unsafe fn open(addr: usize) -> Result<Self, LoadError> {
        let page_size = platform::get().page_size();
        let page = addr & !(page_size - 1);
        let orig = platform::get()
            .protect(page, page_size, PageProt::READ | PageProt::WRITE)
            .ok_or(LoadError::IATProtectFailed)?;
        Ok(Self {
            page,
            orig,
            page_size,
            active: true,
        })
    }

    /// Move the writable window when `addr` has crossed a page boundary.
    unsafe fn advance(&mut self, addr: usize) -> Result<(), LoadError> {
        let page = addr & !(self.page_size - 1);
        if page == self.page {
            return Ok(());
        }
        platform::get()
            .protect(self.page, self.page_size, self.orig)
            .ok_or(LoadError::IATProtectFailed)?;
        self.active = false;
        self.orig = platform::get()
            .protect(page, self.page_size, PageProt::READ | PageProt::WRITE)
            .ok_or(LoadError::IATProtectFailed)?;
        self.page = page;
        self.active = true;
        Ok(())
    }

    unsafe fn finish(&mut self) -> Result<(), LoadError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        platform::get()
            .protect(self.page, self.page_size, self.orig)
            .ok_or(LoadError::IATProtectFailed)?;
        Ok(())
    }
}

/// Bind every import of `module`, loading dependencies as needed.
///
/// # Safety
/// `module.base` must be a live mapped image; the loader lock must be held.
pub(crate) unsafe fn process_imports(module: &PrivMod) -> Result<(), LoadError> {
    let base = module.base as *const u8;
    let info = pe::parse_pe(base)?;
    let Some((imports_start, imports_size)) =
        pe::directory_bounds(base, &info, directory_entry::IMAGE_DIRECTORY_ENTRY_IMPORT)?
    else {
        debug!("[LDR] {} has no imports", module.name);
        return Ok(());
    };
    let imports_end = imports_start + imports_size;

    let mut desc_va = imports_start;
    loop {
        let desc: ImageImportDescriptor =
            ptr::read_unaligned(desc_va as *const ImageImportDescriptor);
        if desc.original_first_thunk == 0 {
            break;
        }
        let impname = pe::cstr((module.base + desc.name as usize) as *const u8);

        if desc.time_date_stamp == u32::MAX {
            // "New bind": would require walking the bound-import directory.
            debug!("[LDR] {} has new bind imports, ignoring", module.name);
        } else if desc.time_date_stamp != 0 {
            debug!("[LDR] {} has old bind imports, ignoring", module.name);
        }

        let dep = match registry::lookup(impname) {
            Some(dep) => {
                registry::inc_ref(dep.base);
                dep
            }
            None => super::privload_locate_and_load(impname, Some(module))
                .ok_or(LoadError::MissingDependency)?,
        };
        debug!("[LDR] {} imports from {}", module.name, impname);

        bind_thunks(module, &dep, &desc)?;

        desc_va += size_of::<ImageImportDescriptor>();
        // Zero terminator governs; the declared size is advisory only.
        if desc_va + size_of::<ImageImportDescriptor>() > imports_end {
            trace!(
                "[LDR] {} import directory size ends before terminator",
                module.name
            );
        }
    }
    Ok(())
}

/// Walk one descriptor's lookup table and IAT in lockstep, writing
/// resolved (possibly redirected) addresses.
unsafe fn bind_thunks(
    module: &PrivMod,
    dep: &PrivMod,
    desc: &ImageImportDescriptor,
) -> Result<(), LoadError> {
    let mut lookup_va = module.base + desc.original_first_thunk as usize;
    let iat_va = module.base + desc.first_thunk as usize;

    let mut prot = IatProtect::open(iat_va)?;
    let result = bind_thunks_inner(module, dep, &mut lookup_va, iat_va, &mut prot);
    let restored = prot.finish();
    result.and(restored)
}

unsafe fn bind_thunks_inner(
    module: &PrivMod,
    dep: &PrivMod,
    lookup_va: &mut usize,
    mut iat_va: usize,
    prot: &mut IatProtect,
) -> Result<(), LoadError> {
    loop {
        let thunk = ptr::read_unaligned(*lookup_va as *const usize);
        if thunk == 0 {
            return Ok(());
        }
        if thunk & IMAGE_ORDINAL_FLAG != 0 {
            warn!(
                "[LDR] {} imports ordinal {} from {}: unsupported",
                module.name,
                thunk & 0xFFFF,
                dep.name
            );
            return Err(LoadError::OrdinalUnsupported);
        }

        // IMAGE_IMPORT_BY_NAME: u16 hint, then the NUL-terminated name.
        let sym = pe::cstr((module.base + (thunk & !IMAGE_ORDINAL_FLAG) + 2) as *const u8);
        let addr = resolve_one_import(module, dep, sym)?;
        trace!("[LDR] \timport {} => {:#x}", sym, addr);
        ptr::write_unaligned(iat_va as *mut usize, addr);

        *lookup_va += size_of::<usize>();
        iat_va += size_of::<usize>();
        prot.advance(iat_va)?;
    }
}

/// Resolve one imported name in `dep`, following forwarder chains and
/// applying redirection against the final resolving module.
unsafe fn resolve_one_import(
    module: &PrivMod,
    dep: &PrivMod,
    sym: &str,
) -> Result<usize, LoadError> {
    let (mut func, mut forwarder) = pe::get_proc_address_ex(dep.base as *const u8, sym)?;
    let mut final_mod_name = dep.name.clone();
    let mut final_sym = String::from(sym);

    let func = loop {
        if let Some(f) = func {
            break f;
        }
        let Some(fw) = forwarder else {
            warn!(
                "[LDR] import {} not found in {}",
                final_sym, final_mod_name
            );
            return Err(LoadError::MissingSymbol);
        };
        let Some(dot) = fw.find('.') else {
            warn!("[LDR] malformed forwarder string {}", fw);
            return Err(LoadError::MissingSymbol);
        };
        let (mod_part, sym_part) = (&fw[..dot], &fw[dot + 1..]);
        if mod_part.len() + ".dll".len() >= MAXIMUM_PATH {
            warn!("[LDR] forwarder string {} too long", fw);
            return Err(LoadError::ForwarderStringTooLong);
        }
        let forwmod_name = format!("{}.dll", mod_part);
        trace!("[LDR] \tforwarder {} => {} {}", fw, forwmod_name, sym_part);

        // Forwarder targets are not ref-counted per slot: they unload when
        // the modules importing them directly release them.
        let forwmod = match registry::lookup(&forwmod_name) {
            Some(m) => m,
            None => super::privload_locate_and_load(&forwmod_name, Some(module))
                .ok_or(LoadError::MissingDependency)?,
        };

        let next_sym = String::from(sym_part);
        let (f, fw_next) = pe::get_proc_address_ex(forwmod.base as *const u8, &next_sym)?;
        func = f;
        forwarder = fw_next;
        final_mod_name = forwmod.name;
        final_sym = next_sym;
    };

    match redirect::redirect_imports(&final_mod_name, &final_sym) {
        Some(replacement) => Ok(replacement as usize),
        None => Ok(func),
    }
}

/// Release the dependencies named by `module`'s import directory.
/// Dependencies missing from the registry (partial-failure loads) are
/// tolerated.
///
/// # Safety
/// `module.base` must still be mapped; the loader lock must be held.
pub(crate) unsafe fn unload_imports(module: &PrivMod) -> Result<(), LoadError> {
    let base = module.base as *const u8;
    let info = pe::parse_pe(base)?;
    let Some((imports_start, _)) =
        pe::directory_bounds(base, &info, directory_entry::IMAGE_DIRECTORY_ENTRY_IMPORT)?
    else {
        debug!("[LDR] {} has no imports", module.name);
        return Ok(());
    };

    let mut desc_va = imports_start;
    loop {
        let desc: ImageImportDescriptor =
            ptr::read_unaligned(desc_va as *const ImageImportDescriptor);
        if desc.original_first_thunk == 0 {
            return Ok(());
        }
        let impname = pe::cstr((module.base + desc.name as usize) as *const u8);
        match registry::lookup(impname) {
            Some(dep) => {
                super::privload_unload(dep.base);
            }
            None => trace!("[LDR] {} dependency {} already gone", module.name, impname),
        }
        desc_va += size_of::<ImageImportDescriptor>();
    }
}
