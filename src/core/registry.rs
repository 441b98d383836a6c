// Signature table mapping discovered libraries to controller constructors.
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};

use crate::core::controller::{Controller, LibController};
use crate::core::controllers::{Blis, FlexiBlas, Mkl, OpenBlas, OpenMp};
use crate::core::dylib::Dylib;
use crate::core::error::Error;
use crate::core::scan::DiscoveredLibrary;

/// Everything a signature's constructor gets to see about the library it
/// matched.
pub struct SignatureMatch {
    pub handle: Arc<Dylib>,
    pub filepath: PathBuf,
    pub prefix: String,
}

pub type ControllerFactory =
    Arc<dyn Fn(&SignatureMatch) -> Result<Box<dyn LibController>, Error> + Send + Sync>;

/// One classification rule: filename prefixes name the candidates, required
/// symbols confirm the ABI, and the factory builds the controller for the
/// matched instance.
#[derive(Clone)]
pub struct Signature {
    pub user_api: String,
    pub internal_api: String,
    pub filename_prefixes: Vec<String>,
    pub check_symbols: Vec<String>,
    pub constructor: ControllerFactory,
}

impl Signature {
    pub fn new(
        user_api: impl Into<String>,
        internal_api: impl Into<String>,
        filename_prefixes: &[&str],
        check_symbols: &[&str],
        constructor: ControllerFactory,
    ) -> Self {
        Self {
            user_api: user_api.into(),
            internal_api: internal_api.into(),
            filename_prefixes: filename_prefixes.iter().map(|p| p.to_string()).collect(),
            check_symbols: check_symbols.iter().map(|s| s.to_string()).collect(),
            constructor,
        }
    }

    fn matching_prefix(&self, basename: &str) -> Option<&str> {
        self.filename_prefixes
            .iter()
            .map(String::as_str)
            .find(|prefix| basename.starts_with(prefix))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signature")
            .field("user_api", &self.user_api)
            .field("internal_api", &self.internal_api)
            .field("filename_prefixes", &self.filename_prefixes)
            .field("check_symbols", &self.check_symbols)
            .finish()
    }
}

/// Ordered, append-only signature table. Built-ins come first; user
/// signatures follow in registration order. A library matches at most one
/// signature: the first whose prefixes match the basename and whose required
/// symbols all resolve.
pub struct Registry {
    signatures: Vec<Signature>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for signature in builtin_signatures() {
            registry.register(signature);
        }
        registry
    }

    pub fn register(&mut self, signature: Signature) {
        self.signatures.push(signature);
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Distinct user APIs in signature order.
    pub fn user_apis(&self) -> Vec<String> {
        let mut apis: Vec<String> = Vec::new();
        for signature in &self.signatures {
            if !apis.contains(&signature.user_api) {
                apis.push(signature.user_api.clone());
            }
        }
        apis
    }

    /// Builds a controller for `discovered`, or `None` when no signature
    /// matches. A prefix match with missing symbols falls through to the next
    /// signature, which is what tells a genuine OpenBLAS `libblas` apart from
    /// an MKL or netlib one.
    pub fn classify(&self, discovered: &DiscoveredLibrary) -> Option<Controller> {
        let basename = discovered.filepath.file_name()?.to_str()?;
        for signature in &self.signatures {
            let Some(prefix) = signature.matching_prefix(basename) else {
                continue;
            };
            if !signature
                .check_symbols
                .iter()
                .all(|symbol| discovered.handle.has_symbol(symbol))
            {
                continue;
            }
            let matched = SignatureMatch {
                handle: Arc::clone(&discovered.handle),
                filepath: discovered.filepath.clone(),
                prefix: prefix.to_string(),
            };
            match (signature.constructor)(&matched) {
                Ok(inner) => {
                    return Some(Controller::new(
                        signature.user_api.clone(),
                        signature.internal_api.clone(),
                        matched.prefix,
                        matched.filepath,
                        inner,
                    ));
                }
                Err(err) => {
                    tracing::debug!(
                        library = %discovered.filepath.display(),
                        internal_api = %signature.internal_api,
                        error = %err,
                        "controller construction failed; trying next signature"
                    );
                    continue;
                }
            }
        }
        None
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn builtin_signatures() -> Vec<Signature> {
    vec![
        Signature::new(
            "blas",
            "openblas",
            &["libopenblas", "libblas", "libscipy_openblas"],
            &["openblas_get_num_threads", "openblas_set_num_threads"],
            Arc::new(|matched| Ok(Box::new(OpenBlas::new(Arc::clone(&matched.handle), "")?))),
        ),
        // ILP64 OpenBLAS builds suffix every symbol with `64_`.
        Signature::new(
            "blas",
            "openblas",
            &["libopenblas", "libblas", "libscipy_openblas"],
            &["openblas_get_num_threads64_", "openblas_set_num_threads64_"],
            Arc::new(|matched| Ok(Box::new(OpenBlas::new(Arc::clone(&matched.handle), "64_")?))),
        ),
        Signature::new(
            "blas",
            "mkl",
            &["libmkl_rt", "mkl_rt", "libblas"],
            &["MKL_Get_Max_Threads", "MKL_Set_Num_Threads"],
            Arc::new(|matched| Ok(Box::new(Mkl::new(Arc::clone(&matched.handle))?))),
        ),
        Signature::new(
            "blas",
            "blis",
            &["libblis", "libblas"],
            &["bli_thread_get_num_threads", "bli_thread_set_num_threads"],
            Arc::new(|matched| Ok(Box::new(Blis::new(Arc::clone(&matched.handle))?))),
        ),
        Signature::new(
            "blas",
            "flexiblas",
            &["libflexiblas"],
            &["flexiblas_get_num_threads", "flexiblas_set_num_threads"],
            Arc::new(|matched| Ok(Box::new(FlexiBlas::new(Arc::clone(&matched.handle))?))),
        ),
        Signature::new(
            "openmp",
            "openmp",
            &["libiomp", "libgomp", "libomp", "vcomp"],
            &["omp_get_max_threads", "omp_set_num_threads"],
            Arc::new(|matched| Ok(Box::new(OpenMp::new(Arc::clone(&matched.handle))?))),
        ),
    ]
}

static PROCESS_REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();

/// The process-wide registry backing the crate-level convenience functions.
/// Callers that want no global state build their own `Registry` and use
/// `ControllerSet::with_registry`.
pub fn process_registry() -> &'static RwLock<Registry> {
    PROCESS_REGISTRY.get_or_init(|| RwLock::new(Registry::with_builtins()))
}

/// Appends `signature` to the process-wide registry. Must run before the
/// first scan that should recognize it; there is no unregister.
pub fn register(signature: Signature) {
    let mut registry = process_registry()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    registry.register(signature);
}

#[cfg(test)]
mod tests {
    use super::{Registry, Signature};
    use crate::core::controller::LibController;
    use crate::core::error::Error;
    use crate::core::scan::{DiscoveredLibrary, scan};
    use std::any::Any;
    use std::sync::Arc;

    fn dummy_signature(user_api: &str, internal_api: &str, prefixes: &[&str]) -> Signature {
        Signature::new(
            user_api,
            internal_api,
            prefixes,
            &[],
            Arc::new(|_| unreachable!("constructor not exercised")),
        )
    }

    #[derive(Debug)]
    struct FixedThreads(usize);

    impl LibController for FixedThreads {
        fn num_threads(&self) -> usize {
            self.0
        }

        fn set_num_threads(&self, _num_threads: usize) -> Result<(), Error> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    // Any process running these tests has its allocator's library mapped, so
    // a `malloc`-bearing shared object is a reliable classification target.
    fn malloc_bearing_library() -> Option<(DiscoveredLibrary, String)> {
        let discovered = scan()
            .into_iter()
            .find(|lib| lib.handle.has_symbol("malloc"))?;
        let basename = discovered.filepath.file_name()?.to_str()?.to_string();
        Some((discovered, basename))
    }

    #[test]
    fn builtins_cover_known_apis_in_order() {
        let registry = Registry::with_builtins();
        let internal: Vec<_> = registry
            .signatures()
            .iter()
            .map(|sig| sig.internal_api.as_str())
            .collect();
        assert_eq!(
            internal,
            ["openblas", "openblas", "mkl", "blis", "flexiblas", "openmp"]
        );
        assert_eq!(registry.user_apis(), ["blas", "openmp"]);
    }

    #[test]
    fn user_signatures_extend_user_apis() {
        let mut registry = Registry::with_builtins();
        registry.register(dummy_signature("my_threaded_lib", "my_threaded_lib", &["libmy"]));
        assert_eq!(registry.user_apis(), ["blas", "openmp", "my_threaded_lib"]);
    }

    #[test]
    fn symbol_mismatch_falls_through_to_the_next_signature() {
        // Unsupported platforms scan nothing; there is no library to classify.
        let Some((discovered, basename)) = malloc_bearing_library() else {
            return;
        };

        let mut registry = Registry::new();
        registry.register(Signature::new(
            "blas",
            "wrong_abi",
            &[basename.as_str()],
            &["threadctl_no_such_symbol"],
            Arc::new(|_| Ok(Box::new(FixedThreads(1)))),
        ));
        registry.register(Signature::new(
            "blas",
            "right_abi",
            &[basename.as_str()],
            &["malloc"],
            Arc::new(|_| Ok(Box::new(FixedThreads(2)))),
        ));

        let controller = registry.classify(&discovered).expect("classified");
        assert_eq!(controller.internal_api(), "right_abi");
        assert_eq!(controller.prefix(), basename);
        assert_eq!(controller.num_threads(), 2);
    }

    #[test]
    fn prefix_match_without_symbols_classifies_to_none() {
        let Some((discovered, basename)) = malloc_bearing_library() else {
            return;
        };

        let mut registry = Registry::new();
        registry.register(Signature::new(
            "blas",
            "wrong_abi",
            &[basename.as_str()],
            &["threadctl_no_such_symbol"],
            Arc::new(|_| Ok(Box::new(FixedThreads(1)))),
        ));
        assert!(registry.classify(&discovered).is_none());
    }

    #[test]
    fn library_matching_no_signature_is_dropped() {
        let registry = Registry::new();
        for discovered in scan() {
            assert!(registry.classify(&discovered).is_none());
        }
    }

    #[test]
    fn prefix_matching_is_case_sensitive_and_ordered() {
        let signature = dummy_signature("blas", "openblas", &["libopenblas", "libblas"]);
        assert_eq!(
            signature.matching_prefix("libopenblas64_.so.0"),
            Some("libopenblas")
        );
        assert_eq!(signature.matching_prefix("libblas.so.3"), Some("libblas"));
        assert_eq!(signature.matching_prefix("libBLAS.so"), None);
        assert_eq!(signature.matching_prefix("liblapack.so"), None);
    }
}
