// BLIS thread-count control. BLIS sizes (`dim_t`, `gint_t`) are 64-bit
// signed integers in the default configuration.
use std::any::Any;
use std::ffi::CStr;
use std::mem;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::controller::{LibController, ThreadingLayer};
use crate::core::dylib::Dylib;
use crate::core::error::Error;

type GetNumThreadsFn = unsafe extern "C" fn() -> i64;
type SetNumThreadsFn = unsafe extern "C" fn(i64);
type GetStrFn = unsafe extern "C" fn() -> *const c_char;
type GetFlagFn = unsafe extern "C" fn() -> i64;
type ArchQueryIdFn = unsafe extern "C" fn() -> c_int;
type ArchStringFn = unsafe extern "C" fn(c_int) -> *const c_char;

pub struct Blis {
    lib: Arc<Dylib>,
    get_num_threads: GetNumThreadsFn,
    set_num_threads: SetNumThreadsFn,
}

impl Blis {
    pub fn new(lib: Arc<Dylib>) -> Result<Self, Error> {
        let get = lib.required_symbol("bli_thread_get_num_threads")?;
        let set = lib.required_symbol("bli_thread_set_num_threads")?;
        Ok(Self {
            lib,
            get_num_threads: unsafe { mem::transmute::<*mut libc::c_void, GetNumThreadsFn>(get) },
            set_num_threads: unsafe { mem::transmute::<*mut libc::c_void, SetNumThreadsFn>(set) },
        })
    }

    fn flag(&self, symbol: &str) -> Option<bool> {
        let addr = self.lib.symbol(symbol)?;
        let get_flag: GetFlagFn = unsafe { mem::transmute(addr) };
        Some(unsafe { (get_flag)() } != 0)
    }
}

impl std::fmt::Debug for Blis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blis").field("lib", &self.lib).finish()
    }
}

impl LibController for Blis {
    fn num_threads(&self) -> usize {
        // BLIS reports -1 when threading is disabled.
        let count = unsafe { (self.get_num_threads)() };
        if count < 1 { 1 } else { count as usize }
    }

    fn set_num_threads(&self, num_threads: usize) -> Result<(), Error> {
        unsafe {
            (self.set_num_threads)(num_threads as i64);
        }
        Ok(())
    }

    fn version(&self) -> Option<String> {
        let addr = self.lib.symbol("bli_info_get_version_str")?;
        let get_version: GetStrFn = unsafe { mem::transmute(addr) };
        let raw = unsafe { (get_version)() };
        if raw.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned())
    }

    fn threading_layer(&self) -> Option<ThreadingLayer> {
        match (
            self.flag("bli_info_get_enable_openmp"),
            self.flag("bli_info_get_enable_pthreads"),
        ) {
            (Some(true), _) => Some(ThreadingLayer::Openmp),
            (_, Some(true)) => Some(ThreadingLayer::Pthreads),
            (Some(false), Some(false)) => Some(ThreadingLayer::Disabled),
            _ => Some(ThreadingLayer::Unknown),
        }
    }

    fn extra_info(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        if let (Some(query_addr), Some(string_addr)) = (
            self.lib.symbol("bli_arch_query_id"),
            self.lib.symbol("bli_arch_string"),
        ) {
            let arch_query_id: ArchQueryIdFn = unsafe { mem::transmute(query_addr) };
            let arch_string: ArchStringFn = unsafe { mem::transmute(string_addr) };
            let raw = unsafe { (arch_string)((arch_query_id)()) };
            if !raw.is_null() {
                let name = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
                extra.insert("architecture".to_string(), Value::String(name));
            }
        }
        extra
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
