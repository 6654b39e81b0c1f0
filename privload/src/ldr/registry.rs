//! Private module registry
//!
//! Ordered record of every privately-loaded (or externally-adopted) image.
//! The sequence is kept in reverse-dependent order: every module appears
//! after its direct dependents, so a front-to-back walk is a valid unload
//! order and thread attach/detach notifications reach dependencies first
//! when walked the same way from the back of a dependency chain.
//!
//! We assume only a handful of privately-loaded modules, so lookups are
//! linear walks and the address index is a sorted vector.
//!
//! Client libraries can be mapped before the host heap exists; their
//! records are carved from a small static table and spliced into the real
//! registry by `loader_init`.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::LoadError;

/// Capacity of the pre-heap bootstrap table.
pub const PRIVMOD_STATIC_NUM: usize = 6;

/// Longest short name a bootstrap slot can hold.
const BOOTSTRAP_NAME_MAX: usize = 64;

/// One privately-loaded (or externally-adopted) image.
#[derive(Debug, Clone)]
pub(crate) struct PrivMod {
    pub base: usize,
    pub size: usize,
    /// Canonical short name, compared case-insensitively.
    pub name: String,
    /// Number of dependents holding this module, including the explicit
    /// `load_private_library` caller. Created at 1.
    pub ref_count: u32,
    /// True for modules mapped by the OS and only adopted here: never
    /// unmapped, relocated, or entry-called.
    pub externally_loaded: bool,
}

struct ModuleList {
    /// Reverse-dependent order; index 0 unloads first.
    mods: Vec<PrivMod>,
    /// `[start, end)` spans of non-external modules, sorted by start.
    areas: Vec<(usize, usize)>,
}

impl ModuleList {
    const fn new() -> Self {
        Self {
            mods: Vec::new(),
            areas: Vec::new(),
        }
    }

    fn position_by_base(&self, base: usize) -> Option<usize> {
        self.mods.iter().position(|m| m.base == base)
    }
}

static MODLIST: spin::Mutex<ModuleList> = spin::Mutex::new(ModuleList::new());

/// Case-insensitive short-name lookup.
pub(crate) fn lookup(name: &str) -> Option<PrivMod> {
    let list = MODLIST.lock();
    list.mods
        .iter()
        .find(|m| m.name.eq_ignore_ascii_case(name))
        .cloned()
}

/// Exact base-address lookup.
pub(crate) fn lookup_by_base(base: usize) -> Option<PrivMod> {
    let list = MODLIST.lock();
    list.mods.iter().find(|m| m.base == base).cloned()
}

/// Insert a record with refcount 1. A module with direct dependent `after`
/// goes immediately after it (preserving forward-can-unload order); a root
/// is prepended.
pub(crate) fn insert(after: Option<usize>, base: usize, size: usize, name: &str, external: bool) {
    let mut list = MODLIST.lock();
    let record = PrivMod {
        base,
        size,
        name: name.to_string(),
        ref_count: 1,
        externally_loaded: external,
    };
    let index = match after {
        Some(dep_base) => match list.position_by_base(dep_base) {
            Some(i) => i + 1,
            None => 0,
        },
        None => 0,
    };
    list.mods.insert(index, record);
}

/// Increment a module's refcount; returns the new count.
pub(crate) fn inc_ref(base: usize) -> Option<u32> {
    let mut list = MODLIST.lock();
    let i = list.position_by_base(base)?;
    list.mods[i].ref_count += 1;
    Some(list.mods[i].ref_count)
}

/// Decrement a module's refcount; returns the new count.
pub(crate) fn dec_ref(base: usize) -> Option<u32> {
    let mut list = MODLIST.lock();
    let i = list.position_by_base(base)?;
    debug_assert!(list.mods[i].ref_count > 0);
    list.mods[i].ref_count -= 1;
    Some(list.mods[i].ref_count)
}

/// Unlink a record; the caller handles teardown.
pub(crate) fn remove(base: usize) -> Option<PrivMod> {
    let mut list = MODLIST.lock();
    let i = list.position_by_base(base)?;
    Some(list.mods.remove(i))
}

/// Base of the front (most-dependent) module.
pub(crate) fn front() -> Option<usize> {
    MODLIST.lock().mods.first().map(|m| m.base)
}

/// Snapshot of `(base, externally_loaded)` in registry order, for walks
/// that invoke entry points and must not hold the interior lock.
pub(crate) fn snapshot() -> Vec<(usize, bool)> {
    MODLIST
        .lock()
        .mods
        .iter()
        .map(|m| (m.base, m.externally_loaded))
        .collect()
}

pub(crate) fn is_empty() -> bool {
    MODLIST.lock().mods.is_empty()
}

// ============================================================================
// Address-range index
// ============================================================================

/// Add `[base, base+size)` to the private-address index. External modules
/// are never added.
pub(crate) fn areas_add(base: usize, size: usize) {
    let mut list = MODLIST.lock();
    let entry = (base, base + size);
    let pos = list.areas.partition_point(|&(start, _)| start < base);
    list.areas.insert(pos, entry);
}

pub(crate) fn areas_remove(base: usize) {
    let mut list = MODLIST.lock();
    list.areas.retain(|&(start, _)| start != base);
}

/// O(log N) membership: is `pc` inside any private library?
pub(crate) fn areas_contains(pc: usize) -> bool {
    let list = MODLIST.lock();
    let pos = list.areas.partition_point(|&(start, _)| start <= pc);
    pos > 0 && pc < list.areas[pos - 1].1
}

pub(crate) fn areas_is_empty() -> bool {
    MODLIST.lock().areas.is_empty()
}

// ============================================================================
// Pre-heap bootstrap table
// ============================================================================

#[derive(Clone, Copy)]
struct BootstrapSlot {
    base: usize,
    size: usize,
    name: [u8; BOOTSTRAP_NAME_MAX],
    name_len: usize,
    ref_count: u32,
}

impl BootstrapSlot {
    const EMPTY: Self = Self {
        base: 0,
        size: 0,
        name: [0; BOOTSTRAP_NAME_MAX],
        name_len: 0,
        ref_count: 0,
    };

    fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("")
    }
}

struct BootstrapTable {
    slots: [BootstrapSlot; PRIVMOD_STATIC_NUM],
    count: usize,
}

static BOOTSTRAP: spin::Mutex<BootstrapTable> = spin::Mutex::new(BootstrapTable {
    slots: [BootstrapSlot::EMPTY; PRIVMOD_STATIC_NUM],
    count: 0,
});

/// Record a module mapped before the host heap exists, with refcount 1.
/// No registry links are established; `loader_init` splices these into
/// the real registry. Callers dedup by name first: the table never holds
/// two slots for the same short name.
pub(crate) fn bootstrap_insert(base: usize, size: usize, name: &str) -> Result<(), LoadError> {
    let mut table = BOOTSTRAP.lock();
    if table.count >= PRIVMOD_STATIC_NUM {
        return Err(LoadError::BootstrapTableFull);
    }
    let idx = table.count;
    let slot = &mut table.slots[idx];
    slot.base = base;
    slot.size = size;
    let bytes = name.as_bytes();
    let len = bytes.len().min(BOOTSTRAP_NAME_MAX);
    slot.name[..len].copy_from_slice(&bytes[..len]);
    slot.name_len = len;
    slot.ref_count = 1;
    table.count += 1;
    Ok(())
}

/// Case-insensitive short-name lookup over the bootstrap table, so a
/// pre-heap re-load finds the resident module even though it is not yet
/// linked into the registry.
pub(crate) fn bootstrap_lookup(name: &str) -> Option<usize> {
    let table = BOOTSTRAP.lock();
    table
        .slots
        .iter()
        .take(table.count)
        .find(|s| s.name_str().eq_ignore_ascii_case(name))
        .map(|s| s.base)
}

/// Bump a bootstrap slot's refcount; carried into the registry record at
/// splice time.
pub(crate) fn bootstrap_inc_ref(base: usize) -> Option<u32> {
    let mut table = BOOTSTRAP.lock();
    let count = table.count;
    let slot = table.slots[..count].iter_mut().find(|s| s.base == base)?;
    slot.ref_count += 1;
    Some(slot.ref_count)
}

/// Drain the bootstrap table into `(base, size, name, ref_count)` tuples,
/// oldest first, clearing it.
pub(crate) fn bootstrap_drain() -> Vec<(usize, usize, String, u32)> {
    let mut table = BOOTSTRAP.lock();
    let mut out = Vec::with_capacity(table.count);
    for slot in table.slots.iter().take(table.count) {
        out.push((slot.base, slot.size, slot.name_str().to_string(), slot.ref_count));
    }
    table.count = 0;
    out
}

#[cfg(test)]
pub(crate) fn bootstrap_len() -> usize {
    BOOTSTRAP.lock().count
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let mut list = MODLIST.lock();
    list.mods.clear();
    list.areas.clear();
    BOOTSTRAP.lock().count = 0;
}
