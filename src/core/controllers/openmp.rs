// OpenMP runtime thread-count control (GNU libgomp, LLVM libomp, Intel
// libiomp, MSVC vcomp). None of them expose a version symbol.
use std::any::Any;
use std::mem;
use std::os::raw::c_int;
use std::sync::Arc;

use crate::core::controller::{LibController, ThreadingLayer};
use crate::core::dylib::Dylib;
use crate::core::error::Error;

type GetMaxThreadsFn = unsafe extern "C" fn() -> c_int;
type SetNumThreadsFn = unsafe extern "C" fn(c_int);

pub struct OpenMp {
    lib: Arc<Dylib>,
    get_max_threads: GetMaxThreadsFn,
    set_num_threads: SetNumThreadsFn,
}

impl OpenMp {
    pub fn new(lib: Arc<Dylib>) -> Result<Self, Error> {
        let get = lib.required_symbol("omp_get_max_threads")?;
        let set = lib.required_symbol("omp_set_num_threads")?;
        Ok(Self {
            lib,
            get_max_threads: unsafe { mem::transmute::<*mut libc::c_void, GetMaxThreadsFn>(get) },
            set_num_threads: unsafe { mem::transmute::<*mut libc::c_void, SetNumThreadsFn>(set) },
        })
    }
}

impl std::fmt::Debug for OpenMp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenMp").field("lib", &self.lib).finish()
    }
}

impl LibController for OpenMp {
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

    fn threading_layer(&self) -> Option<ThreadingLayer> {
        Some(ThreadingLayer::Openmp)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
