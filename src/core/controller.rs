// Uniform capability surface over one discovered native library.
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::Error;

/// Parallel runtime a BLAS-family library dispatches to. MKL reports its own
/// layer names; everything else maps onto openmp/pthreads/disabled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadingLayer {
    Openmp,
    Pthreads,
    Disabled,
    Intel,
    Gnu,
    Tbb,
    Sequential,
    Pgi,
    Unknown,
}

impl ThreadingLayer {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadingLayer::Openmp => "openmp",
            ThreadingLayer::Pthreads => "pthreads",
            ThreadingLayer::Disabled => "disabled",
            ThreadingLayer::Intel => "intel",
            ThreadingLayer::Gnu => "gnu",
            ThreadingLayer::Tbb => "tbb",
            ThreadingLayer::Sequential => "sequential",
            ThreadingLayer::Pgi => "pgi",
            ThreadingLayer::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ThreadingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Library-specific thread-count protocol behind the uniform surface.
///
/// One implementor per internal API. `num_threads` re-queries the live
/// library on every call; `set_num_threads` requests an upper bound that the
/// library may clamp. Optional probes return `None` rather than failing.
pub trait LibController: fmt::Debug + Send + Sync {
    fn num_threads(&self) -> usize;

    fn set_num_threads(&self, num_threads: usize) -> Result<(), Error>;

    fn version(&self) -> Option<String> {
        None
    }

    fn threading_layer(&self) -> Option<ThreadingLayer> {
        None
    }

    /// Internal-API-specific attributes merged into `info()`, e.g. the CPU
    /// architecture for OpenBLAS/BLIS or the backend lists for FlexiBLAS.
    fn extra_info(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Escape hatch to the concrete controller for internal-API-specific
    /// operations such as FlexiBLAS backend switching.
    fn as_any(&self) -> &dyn Any;
}

/// One discovered library with its classification identity and the dispatch
/// object for its internal API. Identity fields are immutable; the observed
/// thread count is live state.
#[derive(Debug)]
pub struct Controller {
    user_api: String,
    internal_api: String,
    prefix: String,
    filepath: PathBuf,
    inner: Box<dyn LibController>,
}

impl Controller {
    pub fn new(
        user_api: impl Into<String>,
        internal_api: impl Into<String>,
        prefix: impl Into<String>,
        filepath: impl Into<PathBuf>,
        inner: Box<dyn LibController>,
    ) -> Self {
        Self {
            user_api: user_api.into(),
            internal_api: internal_api.into(),
            prefix: prefix.into(),
            filepath: filepath.into(),
            inner,
        }
    }

    pub fn user_api(&self) -> &str {
        &self.user_api
    }

    pub fn internal_api(&self) -> &str {
        &self.internal_api
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    pub fn num_threads(&self) -> usize {
        self.inner.num_threads()
    }

    pub fn set_num_threads(&self, num_threads: usize) -> Result<(), Error> {
        self.inner.set_num_threads(num_threads)
    }

    pub fn version(&self) -> Option<String> {
        self.inner.version()
    }

    pub fn threading_layer(&self) -> Option<ThreadingLayer> {
        self.inner.threading_layer()
    }

    /// Concrete controller access, e.g.
    /// `controller.downcast_ref::<FlexiBlas>()`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref()
    }

    /// Concrete FlexiBLAS controller, for backend listing and switching.
    ///
    /// A successful `switch_backend` can pull new shared libraries into the
    /// process, which invalidates every existing `ControllerSet`; build a
    /// fresh one afterwards instead of reusing the set this controller came
    /// from.
    pub fn as_flexiblas(&self) -> Option<&crate::core::controllers::FlexiBlas> {
        self.downcast_ref()
    }

    /// Live snapshot of identity fields plus internal-API-specific extras.
    pub fn info(&self) -> LibraryInfo {
        LibraryInfo {
            user_api: self.user_api.clone(),
            internal_api: self.internal_api.clone(),
            prefix: self.prefix.clone(),
            filepath: self.filepath.clone(),
            version: self.version(),
            threading_layer: self.threading_layer().map(|layer| layer.as_str().to_string()),
            num_threads: self.num_threads(),
            extra: self.inner.extra_info(),
        }
    }
}

/// Exported snapshot record for one controller. Two aggregates are considered
/// equal when their snapshot sequences are equal element-wise, including the
/// re-sampled `num_threads`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub user_api: String,
    pub internal_api: String,
    pub prefix: String,
    pub filepath: PathBuf,
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub threading_layer: Option<String>,
    pub num_threads: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
