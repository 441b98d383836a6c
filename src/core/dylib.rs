// dlopen/dlsym access to shared objects already resident in the process.
use std::ffi::{CStr, CString, c_void};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

/// Handle to one loaded shared object.
///
/// `attach` binds to the instance the dynamic loader already holds
/// (`RTLD_NOLOAD`), so the handle shares the library's static state with the
/// rest of the process. `load` pulls a new library in and is only meant for
/// callers that want to force a library to be present before a scan.
pub struct Dylib {
    handle: *mut c_void,
    path: PathBuf,
}

// The handle is only used for dlsym lookups, which the loader serializes.
unsafe impl Send for Dylib {}
unsafe impl Sync for Dylib {}

impl Dylib {
    /// Attaches to the already-loaded instance of `path`, or returns `None`
    /// when no such instance is resident. Never loads a fresh copy.
    pub fn attach(path: &Path) -> Option<Self> {
        let c_path = path_to_cstring(path)?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_LAZY) };
        if handle.is_null() {
            return None;
        }
        Some(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    /// Loads `path` into the process. The scanner never calls this; it exists
    /// for the CLI's `--load` option and for tests that need a library in.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let c_path = path_to_cstring(path).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("library path contains a NUL byte")
                .with_path(path)
        })?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(last_dl_error().unwrap_or_else(|| "dlopen failed".to_string()))
                .with_path(path));
        }
        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw address of `name` in this library, or `None` if it does not
    /// resolve. Callers transmute the address to the correct fn type.
    pub fn symbol(&self, name: &str) -> Option<*mut c_void> {
        let c_name = CString::new(name).ok()?;
        let addr = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        if addr.is_null() { None } else { Some(addr) }
    }

    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbol(name).is_some()
    }

    /// Like `symbol`, but a missing symbol is an error naming the library and
    /// the symbol. Used by controller constructors for their required entry
    /// points.
    pub fn required_symbol(&self, name: &str) -> Result<*mut c_void, Error> {
        self.symbol(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("required symbol did not resolve")
                .with_path(&self.path)
                .with_symbol(name)
        })
    }
}

impl Drop for Dylib {
    fn drop(&mut self) {
        // Releases only the reference this handle took; the loader keeps the
        // library mapped while anyone else still holds it.
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

impl fmt::Debug for Dylib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dylib").field("path", &self.path).finish()
    }
}

#[cfg(unix)]
fn path_to_cstring(path: &Path) -> Option<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).ok()
}

#[cfg(not(unix))]
fn path_to_cstring(path: &Path) -> Option<CString> {
    CString::new(path.to_str()?).ok()
}

fn last_dl_error() -> Option<String> {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned())
}
