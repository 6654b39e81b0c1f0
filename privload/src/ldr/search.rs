//! Dependency search paths
//!
//! The OS loader searches exe dir, cwd, system dir, windows dir, then
//! `PATH`. We replace "exe dir" with the directories of the client
//! libraries (recorded as they are loaded, before the host heap exists),
//! do not support cwd or `PATH`, and resolve the system root once from the
//! OS registry at initialization.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::platform;

use super::registry::PRIVMOD_STATIC_NUM;

/// Longest path we record or assemble.
pub const MAXIMUM_PATH: usize = 260;

struct SearchPaths {
    /// Client-library directories in registration order. Fixed buffers:
    /// recording happens before the host heap exists.
    dirs: [[u8; MAXIMUM_PATH]; PRIVMOD_STATIC_NUM],
    lens: [usize; PRIVMOD_STATIC_NUM],
    count: usize,
    systemroot: [u8; MAXIMUM_PATH],
    systemroot_len: usize,
}

static SEARCH: spin::Mutex<SearchPaths> = spin::Mutex::new(SearchPaths {
    dirs: [[0; MAXIMUM_PATH]; PRIVMOD_STATIC_NUM],
    lens: [0; PRIVMOD_STATIC_NUM],
    count: 0,
    systemroot: [0; MAXIMUM_PATH],
    systemroot_len: 0,
});

/// Record the directory of a client library path for later searches.
/// Pre-heap safe (no allocation). Paths too long to record are dropped
/// with a diagnostic; a client library path should never be that big.
pub(crate) fn record_client_dir(path: &str) {
    let Some(split) = path.rfind(['/', '\\']) else {
        return;
    };
    let dir = &path.as_bytes()[..split];
    let mut search = SEARCH.lock();
    if search.count >= PRIVMOD_STATIC_NUM || dir.len() >= MAXIMUM_PATH {
        log::warn!("[LDR] cannot record client search path {}", path);
        return;
    }
    let idx = search.count;
    search.dirs[idx][..dir.len()].copy_from_slice(dir);
    search.lens[idx] = dir.len();
    search.count += 1;
}

/// Resolve and cache the Windows installation directory from the OS
/// registry. Called once from `loader_init`.
pub(crate) fn init_systemroot() {
    let Some(root) = platform::get().system_root() else {
        log::warn!("[LDR] unable to determine systemroot");
        return;
    };
    let bytes = root.as_bytes();
    let mut search = SEARCH.lock();
    let len = bytes.len().min(MAXIMUM_PATH);
    search.systemroot[..len].copy_from_slice(&bytes[..len]);
    search.systemroot_len = len;
}

/// Candidate full paths for a dependency short name, in search order:
/// client-library directories, then `<systemroot>/system32`, then
/// `<systemroot>`. Heap-backed; only called during import processing,
/// which runs after the host heap is up.
pub(crate) fn candidate_paths(short_name: &str) -> Vec<String> {
    let search = SEARCH.lock();
    let mut out = Vec::new();
    for i in 0..search.count {
        let dir = core::str::from_utf8(&search.dirs[i][..search.lens[i]]).unwrap_or("");
        out.push(format!("{}/{}", dir, short_name));
    }
    if search.systemroot_len != 0 {
        let root =
            core::str::from_utf8(&search.systemroot[..search.systemroot_len]).unwrap_or("");
        out.push(format!("{}/system32/{}", root, short_name));
        out.push(format!("{}/{}", root, short_name));
    }
    out
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let mut search = SEARCH.lock();
    search.count = 0;
    search.systemroot_len = 0;
}
