// OpenBLAS thread-count control through its undocumented C entry points.
//
// LP64 builds expose the plain symbol family; ILP64 builds append a `64_`
// suffix to every name, so the registry installs one signature per family
// and the suffix rides along here.
use std::any::Any;
use std::ffi::CStr;
use std::mem;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::controller::{LibController, ThreadingLayer};
use crate::core::dylib::Dylib;
use crate::core::error::Error;

type GetNumThreadsFn = unsafe extern "C" fn() -> c_int;
type SetNumThreadsFn = unsafe extern "C" fn(c_int);
type GetStrFn = unsafe extern "C" fn() -> *const c_char;
type GetParallelFn = unsafe extern "C" fn() -> c_int;

pub struct OpenBlas {
    lib: Arc<Dylib>,
    suffix: &'static str,
    get_num_threads: GetNumThreadsFn,
    set_num_threads: SetNumThreadsFn,
}

impl OpenBlas {
    pub fn new(lib: Arc<Dylib>, suffix: &'static str) -> Result<Self, Error> {
        let get = lib.required_symbol(&format!("openblas_get_num_threads{suffix}"))?;
        let set = lib.required_symbol(&format!("openblas_set_num_threads{suffix}"))?;
        Ok(Self {
            lib,
            suffix,
            get_num_threads: unsafe { mem::transmute::<*mut libc::c_void, GetNumThreadsFn>(get) },
            set_num_threads: unsafe { mem::transmute::<*mut libc::c_void, SetNumThreadsFn>(set) },
        })
    }

    fn config_string(&self) -> Option<String> {
        let addr = self.lib.symbol(&format!("openblas_get_config{}", self.suffix))?;
        let get_config: GetStrFn = unsafe { mem::transmute(addr) };
        let raw = unsafe { (get_config)() };
        if raw.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned())
    }
}

impl std::fmt::Debug for OpenBlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenBlas")
            .field("lib", &self.lib)
            .field("suffix", &self.suffix)
            .finish()
    }
}

impl LibController for OpenBlas {
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
        // OpenBLAS only started reporting its version in the config string
        // with 0.3.4; older builds are reported as version-less.
        parse_version(&self.config_string()?)
    }

    fn threading_layer(&self) -> Option<ThreadingLayer> {
        let Some(addr) = self.lib.symbol(&format!("openblas_get_parallel{}", self.suffix)) else {
            return Some(ThreadingLayer::Unknown);
        };
        let get_parallel: GetParallelFn = unsafe { mem::transmute(addr) };
        Some(match unsafe { (get_parallel)() } {
            0 => ThreadingLayer::Disabled,
            1 => ThreadingLayer::Pthreads,
            2 => ThreadingLayer::Openmp,
            _ => ThreadingLayer::Unknown,
        })
    }

    fn extra_info(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        if let Some(addr) = self.lib.symbol(&format!("openblas_get_corename{}", self.suffix)) {
            let get_corename: GetStrFn = unsafe { mem::transmute(addr) };
            let raw = unsafe { (get_corename)() };
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

/// Extracts the version from an `openblas_get_config()` string such as
/// `"OpenBLAS 0.3.21 USE64BITINT DYNAMIC_ARCH ..."`.
fn parse_version(config: &str) -> Option<String> {
    let mut words = config.split_whitespace();
    if words.next()? != "OpenBLAS" {
        return None;
    }
    words.next().map(|version| version.to_string())
}
