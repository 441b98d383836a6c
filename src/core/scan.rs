// Enumeration of shared objects currently mapped into the calling process.
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::dylib::Dylib;

/// One shared object found in the process image. `filepath` is the
/// canonicalized real path and is the identity key; `handle` refers to the
/// live, already-loaded instance.
#[derive(Clone, Debug)]
pub struct DiscoveredLibrary {
    pub filepath: PathBuf,
    pub handle: Arc<Dylib>,
}

/// Lists every shared object mapped into this process, in enumeration order,
/// deduplicated by real path. Side-effect-free: nothing is loaded or
/// unloaded. Platforms without a loader enumeration API yield an empty list.
pub fn scan() -> Vec<DiscoveredLibrary> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for path in loaded_module_paths() {
        // Symlinked and relative aliases of one file collapse to a single
        // entry; the first occurrence wins.
        let Ok(real) = std::fs::canonicalize(&path) else {
            continue;
        };
        if !seen.insert(real.clone()) {
            continue;
        }
        // Attach by the loader-reported name so RTLD_NOLOAD finds the live
        // instance. An entry that raced an unload is skipped.
        let Some(handle) = Dylib::attach(&path) else {
            continue;
        };
        found.push(DiscoveredLibrary {
            filepath: real,
            handle: Arc::new(handle),
        });
    }
    found
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn loaded_module_paths() -> Vec<PathBuf> {
    use std::ffi::{CStr, OsStr, c_int, c_void};
    use std::os::unix::ffi::OsStrExt;

    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let paths = unsafe { &mut *(data as *mut Vec<PathBuf>) };
        let name = unsafe { (*info).dlpi_name };
        if !name.is_null() {
            let bytes = unsafe { CStr::from_ptr(name) }.to_bytes();
            // The empty name is the main executable; vdso entries have no
            // backing file.
            if !bytes.is_empty()
                && !bytes.starts_with(b"linux-vdso")
                && !bytes.starts_with(b"linux-gate")
            {
                paths.push(PathBuf::from(OsStr::from_bytes(bytes)));
            }
        }
        0
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut paths as *mut Vec<PathBuf> as *mut c_void);
    }
    paths
}

#[cfg(target_os = "macos")]
fn loaded_module_paths() -> Vec<PathBuf> {
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;

    unsafe extern "C" {
        fn _dyld_image_count() -> u32;
        fn _dyld_get_image_name(image_index: u32) -> *const libc::c_char;
    }

    let mut paths = Vec::new();
    let count = unsafe { _dyld_image_count() };
    for index in 0..count {
        let name = unsafe { _dyld_get_image_name(index) };
        if name.is_null() {
            continue;
        }
        let bytes = unsafe { CStr::from_ptr(name) }.to_bytes();
        if !bytes.is_empty() {
            paths.push(PathBuf::from(OsStr::from_bytes(bytes)));
        }
    }
    paths
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "macos"
)))]
fn loaded_module_paths() -> Vec<PathBuf> {
    Vec::new()
}
