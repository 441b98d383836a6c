// FlexiBLAS thread-count control plus backend introspection/switching.
use std::any::Any;
use std::ffi::{CStr, CString};
use std::mem;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::core::controller::LibController;
use crate::core::dylib::Dylib;
use crate::core::error::{Error, ErrorKind};

type GetNumThreadsFn = unsafe extern "C" fn() -> c_int;
type SetNumThreadsFn = unsafe extern "C" fn(c_int);
type GetVersionFn = unsafe extern "C" fn(*mut c_int, *mut c_int, *mut c_int);
type ListFn = unsafe extern "C" fn(*mut c_char, libc::size_t, isize) -> isize;
type CurrentBackendFn = unsafe extern "C" fn(*mut c_char, libc::size_t) -> isize;
type LoadBackendFn = unsafe extern "C" fn(*const c_char) -> c_int;
type SwitchFn = unsafe extern "C" fn(c_int) -> c_int;

const BACKEND_NAME_CAPACITY: usize = 1024;

pub struct FlexiBlas {
    lib: Arc<Dylib>,
    get_num_threads: GetNumThreadsFn,
    set_num_threads: SetNumThreadsFn,
}

impl FlexiBlas {
    pub fn new(lib: Arc<Dylib>) -> Result<Self, Error> {
        let get = lib.required_symbol("flexiblas_get_num_threads")?;
        let set = lib.required_symbol("flexiblas_set_num_threads")?;
        Ok(Self {
            lib,
            get_num_threads: unsafe { mem::transmute::<*mut libc::c_void, GetNumThreadsFn>(get) },
            set_num_threads: unsafe { mem::transmute::<*mut libc::c_void, SetNumThreadsFn>(set) },
        })
    }

    /// Backends FlexiBLAS knows about (loaded or not).
    pub fn available_backends(&self) -> Vec<String> {
        self.backend_list("flexiblas_list")
    }

    /// Backends currently mapped into the process.
    pub fn loaded_backends(&self) -> Vec<String> {
        self.backend_list("flexiblas_list_loaded")
    }

    pub fn current_backend(&self) -> Option<String> {
        let addr = self.lib.symbol("flexiblas_current_backend")?;
        let current: CurrentBackendFn = unsafe { mem::transmute(addr) };
        let mut buf = [0u8; BACKEND_NAME_CAPACITY];
        let rc = unsafe { (current)(buf.as_mut_ptr() as *mut c_char, buf.len()) };
        if rc < 0 {
            return None;
        }
        Some(cstr_buf_to_string(&buf))
    }

    /// Loads and activates the named backend (a plain name from the FlexiBLAS
    /// configuration, or a path to a backend library). Switching can pull new
    /// shared libraries into the process, so callers must re-scan afterwards
    /// instead of trusting any existing aggregate.
    pub fn switch_backend(&self, backend: &str) -> Result<(), Error> {
        let loader_symbol = if backend.contains(std::path::is_separator) {
            "flexiblas_load_backend_library"
        } else {
            "flexiblas_load_backend"
        };
        let load_addr = self.lib.required_symbol(loader_symbol)?;
        let switch_addr = self.lib.required_symbol("flexiblas_switch")?;
        let load_backend: LoadBackendFn = unsafe { mem::transmute(load_addr) };
        let switch: SwitchFn = unsafe { mem::transmute(switch_addr) };

        let c_backend = CString::new(backend).map_err(|_| {
            Error::new(ErrorKind::Usage)
                .with_message("backend name contains a NUL byte")
                .with_backend(backend)
        })?;
        let index = unsafe { (load_backend)(c_backend.as_ptr()) };
        if index < 0 {
            return Err(Error::new(ErrorKind::Backend)
                .with_message(format!("failed to load backend {backend:?}"))
                .with_path(self.lib.path())
                .with_backend(backend));
        }
        unsafe {
            (switch)(index);
        }
        Ok(())
    }

    fn backend_list(&self, symbol: &str) -> Vec<String> {
        let Some(addr) = self.lib.symbol(symbol) else {
            return Vec::new();
        };
        let list: ListFn = unsafe { mem::transmute(addr) };
        let count = unsafe { (list)(std::ptr::null_mut(), 0, 0) };
        let mut backends = Vec::new();
        for position in 0..count.max(0) {
            let mut buf = [0u8; BACKEND_NAME_CAPACITY];
            let rc = unsafe { (list)(buf.as_mut_ptr() as *mut c_char, buf.len(), position) };
            if rc < 0 {
                continue;
            }
            backends.push(cstr_buf_to_string(&buf));
        }
        backends
    }
}

impl std::fmt::Debug for FlexiBlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlexiBlas").field("lib", &self.lib).finish()
    }
}

impl LibController for FlexiBlas {
    fn num_threads(&self) -> usize {
        let count = unsafe { (self.get_num_threads)() };
        usize::try_from(count).unwrap_or(0)
    }

    fn set_num_threads(&self, num_threads: usize) -> Result<(), Error> {
        unsafe {
            (self.set_num_threads)(num_threads as c_int);
        }
        Ok(())
    }

    fn version(&self) -> Option<String> {
        let addr = self.lib.symbol("flexiblas_get_version")?;
        let get_version: GetVersionFn = unsafe { mem::transmute(addr) };
        let (mut major, mut minor, mut patch) = (0 as c_int, 0 as c_int, 0 as c_int);
        unsafe {
            (get_version)(&mut major, &mut minor, &mut patch);
        }
        Some(format!("{major}.{minor}.{patch}"))
    }

    fn extra_info(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("available_backends".to_string(), json!(self.available_backends()));
        extra.insert("loaded_backends".to_string(), json!(self.loaded_backends()));
        extra.insert("current_backend".to_string(), json!(self.current_backend()));
        extra
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn cstr_buf_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|byte| *byte == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
