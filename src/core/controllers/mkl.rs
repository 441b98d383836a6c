// Intel MKL thread-count control.
use std::any::Any;
use std::mem;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use crate::core::controller::{LibController, ThreadingLayer};
use crate::core::dylib::Dylib;
use crate::core::error::Error;

type GetMaxThreadsFn = unsafe extern "C" fn() -> c_int;
type SetNumThreadsFn = unsafe extern "C" fn(c_int);
type GetVersionStringFn = unsafe extern "C" fn(*mut c_char, c_int);
type SetThreadingLayerFn = unsafe extern "C" fn(c_int) -> c_int;

pub struct Mkl {
    lib: Arc<Dylib>,
    get_max_threads: GetMaxThreadsFn,
    set_num_threads: SetNumThreadsFn,
}

impl Mkl {
    pub fn new(lib: Arc<Dylib>) -> Result<Self, Error> {
        let get = lib.required_symbol("MKL_Get_Max_Threads")?;
        let set = lib.required_symbol("MKL_Set_Num_Threads")?;
        Ok(Self {
            lib,
            get_max_threads: unsafe { mem::transmute::<*mut libc::c_void, GetMaxThreadsFn>(get) },
            set_num_threads: unsafe { mem::transmute::<*mut libc::c_void, SetNumThreadsFn>(set) },
        })
    }
}

impl std::fmt::Debug for Mkl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mkl").field("lib", &self.lib).finish()
    }
}

impl LibController for Mkl {
    fn num_threads(&self) -> usize {
        let count = unsafe { (self.get_max_threads)() };
        usize::try_from(count).unwrap_or(0)
    }

    fn set_num_threads(&self, num_threads: usize) -> Result<(), Error> {
        unsafe {
            (self.set_num_threads)(num_threads as c_int);
        }
        Ok(())
    }

    fn version(&self) -> Option<String> {
        let addr = self.lib.symbol("mkl_get_version_string")?;
        let get_version: GetVersionStringFn = unsafe { mem::transmute(addr) };
        let mut buf = [0u8; 200];
        unsafe {
            (get_version)(buf.as_mut_ptr() as *mut c_char, buf.len() as c_int);
        }
        let end = buf.iter().position(|byte| *byte == 0)?;
        parse_version(&String::from_utf8_lossy(&buf[..end]))
    }

    fn threading_layer(&self) -> Option<ThreadingLayer> {
        // Passing a negative value leaves the layer untouched and returns the
        // current one.
        let Some(addr) = self.lib.symbol("MKL_Set_Threading_Layer") else {
            return Some(ThreadingLayer::Unknown);
        };
        let set_threading_layer: SetThreadingLayerFn = unsafe { mem::transmute(addr) };
        Some(match unsafe { (set_threading_layer)(-1) } {
            0 => ThreadingLayer::Intel,
            1 => ThreadingLayer::Sequential,
            2 => ThreadingLayer::Pgi,
            3 => ThreadingLayer::Gnu,
            4 => ThreadingLayer::Tbb,
            _ => ThreadingLayer::Unknown,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Extracts the version from an `mkl_get_version_string` banner such as
/// `"Intel(R) oneAPI Math Kernel Library Version 2021.4-Product Build ..."`.
fn parse_version(banner: &str) -> Option<String> {
    let (_, tail) = banner.split_once("Version ")?;
    tail.split_whitespace().next().map(|version| version.to_string())
}
