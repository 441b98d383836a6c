// Aggregate over the classified libraries of the process: selection,
// introspection, and entry point to the limiting stack.
use std::sync::Arc;

use crate::core::controller::{Controller, LibraryInfo};
use crate::core::error::Error;
use crate::core::limits::{LimitGuard, LimitSpec};
use crate::core::registry::{self, Registry};
use crate::core::scan;

/// Filter over a controller set. Keys compose with AND; repeating a key ORs
/// its values, so `prefix("libblis").prefix("libgomp")` selects either.
#[derive(Clone, Debug, Default)]
pub struct Selector {
    user_apis: Vec<String>,
    internal_apis: Vec<String>,
    prefixes: Vec<String>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_api(mut self, api: impl Into<String>) -> Self {
        self.user_apis.push(api.into());
        self
    }

    pub fn internal_api(mut self, api: impl Into<String>) -> Self {
        self.internal_apis.push(api.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    fn matches(&self, controller: &Controller) -> bool {
        let any_or_empty = |values: &[String], candidate: &str| {
            values.is_empty() || values.iter().any(|value| value == candidate)
        };
        any_or_empty(&self.user_apis, controller.user_api())
            && any_or_empty(&self.internal_apis, controller.internal_api())
            && any_or_empty(&self.prefixes, controller.prefix())
    }
}

/// Every recognized threading library of the current process, in the stable
/// order the scan reported them.
///
/// A set reflects the process at construction time. Anything that loads new
/// shared libraries afterwards (a FlexiBLAS backend switch, a `dlopen`)
/// leaves it stale; build a fresh set to observe them.
#[derive(Debug)]
pub struct ControllerSet {
    controllers: Vec<Arc<Controller>>,
}

impl ControllerSet {
    /// Scans the process and classifies against the process-global registry.
    pub fn new() -> Self {
        let registry = registry::process_registry()
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Self::with_registry(&registry)
    }

    /// Scans the process and classifies against an explicit registry.
    pub fn with_registry(registry: &Registry) -> Self {
        let controllers = scan::scan()
            .iter()
            .filter_map(|library| registry.classify(library))
            .map(Arc::new)
            .collect();
        let set = Self { controllers };
        set.warn_on_dual_openmp();
        set
    }

    /// Builds a set from pre-made controllers, bypassing the scan. Mainly
    /// useful to exercise the limiting stack without native libraries.
    pub fn from_controllers(controllers: Vec<Arc<Controller>>) -> Self {
        Self { controllers }
    }

    pub fn controllers(&self) -> &[Arc<Controller>] {
        &self.controllers
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Narrows to the controllers the selector matches. Handles stay shared
    /// with the parent set.
    pub fn select(&self, selector: &Selector) -> ControllerSet {
        let controllers = self
            .controllers
            .iter()
            .filter(|controller| selector.matches(controller))
            .map(Arc::clone)
            .collect();
        Self { controllers }
    }

    /// Snapshot of every library's current state, reading live values.
    pub fn info(&self) -> Vec<LibraryInfo> {
        self.controllers
            .iter()
            .map(|controller| controller.info())
            .collect()
    }

    /// Opens a limiting scope over this set. `None` limits produce a guard
    /// with an empty restore frame.
    pub fn limit(
        &self,
        limits: Option<&LimitSpec>,
        user_api: Option<&str>,
    ) -> Result<LimitGuard, Error> {
        LimitGuard::apply(self, limits, user_api)
    }

    /// Runs `body` inside a limiting scope and restores afterwards, whether
    /// the scope was a no-op or not.
    pub fn wrap<R>(
        &self,
        limits: Option<&LimitSpec>,
        user_api: Option<&str>,
        body: impl FnOnce() -> R,
    ) -> Result<R, Error> {
        let mut guard = self.limit(limits, user_api)?;
        let result = body();
        guard.restore();
        Ok(result)
    }

    // Both LLVM and Intel OpenMP runtimes loaded at once is a known source
    // of crashes on Linux; surfacing it early beats debugging the segfault.
    fn warn_on_dual_openmp(&self) {
        if !cfg!(target_os = "linux") {
            return;
        }
        let has_prefix = |prefix: &str| {
            self.controllers
                .iter()
                .any(|controller| controller.prefix() == prefix)
        };
        if has_prefix("libomp") && has_prefix("libiomp") {
            tracing::warn!(
                "both libomp (LLVM) and libiomp (Intel) are loaded; running them \
                 in one process is known to cause crashes on Linux"
            );
        }
    }
}

impl Default for ControllerSet {
    fn default() -> Self {
        Self::new()
    }
}
