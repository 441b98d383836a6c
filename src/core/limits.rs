// Nestable thread-count limiting with exact restoration of prior state.
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::core::aggregate::ControllerSet;
use crate::core::controller::{Controller, LibraryInfo, ThreadingLayer};
use crate::core::error::{Error, ErrorKind};
use crate::core::registry;

/// How target thread counts are computed for one limiting scope.
#[derive(Clone, Debug, PartialEq)]
pub enum LimitSpec {
    /// Uniform upper bound for every selected controller.
    Max(usize),
    /// Per-prefix bounds; controllers with unlisted prefixes are untouched.
    ByPrefix(BTreeMap<String, usize>),
    /// Restore a previously exported state wholesale, matched by filepath.
    Snapshot(Vec<LibraryInfo>),
    /// Bound BLAS libraries to one thread, unless any of them dispatches to
    /// OpenMP (limiting it would also limit the shared OpenMP runtime, so the
    /// whole scope becomes a no-op instead).
    SequentialBlasUnderOpenmp,
}

impl LimitSpec {
    /// Parses an untyped limit value. `null` is the valid no-op spec and maps
    /// to `Ok(None)`; anything outside the accepted shapes is a usage error.
    pub fn from_json(value: &Value) -> Result<Option<Self>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Number(number) => {
                let limit = number.as_u64().ok_or_else(bad_limits_shape)?;
                Ok(Some(LimitSpec::Max(limit as usize)))
            }
            Value::String(text) if text == "sequential_blas_under_openmp" => {
                Ok(Some(LimitSpec::SequentialBlasUnderOpenmp))
            }
            Value::Object(map) => {
                let mut by_prefix = BTreeMap::new();
                for (prefix, limit) in map {
                    let limit = limit.as_u64().ok_or_else(bad_limits_shape)?;
                    by_prefix.insert(prefix.clone(), limit as usize);
                }
                Ok(Some(LimitSpec::ByPrefix(by_prefix)))
            }
            Value::Array(items) => {
                let mut records = Vec::with_capacity(items.len());
                for item in items {
                    let record: LibraryInfo =
                        serde_json::from_value(item.clone()).map_err(|_| bad_limits_shape())?;
                    records.push(record);
                }
                Ok(Some(LimitSpec::Snapshot(records)))
            }
            _ => Err(bad_limits_shape()),
        }
    }
}

fn bad_limits_shape() -> Error {
    Error::new(ErrorKind::Usage).with_message(
        "limits must be an integer, a prefix-to-limit map, a sequence of library \
         info records, the string \"sequential_blas_under_openmp\", or null",
    )
}

#[derive(Debug)]
struct RestoreRecord {
    controller: Arc<Controller>,
    original_num_threads: usize,
}

/// One entry of the limiting stack: the libraries this scope modified and
/// the thread count each held immediately before the modification.
///
/// Restoration runs on drop (scope form) or through `restore` (held-object
/// form); `persist` leaves the limits applied. Because each record holds the
/// value observed right before this scope's own change, an inner scope
/// restores to the outer scope's applied value, and stacking composes at any
/// depth.
#[derive(Debug)]
pub struct LimitGuard {
    frame: Vec<RestoreRecord>,
    restored: bool,
}

impl LimitGuard {
    pub(crate) fn apply(
        set: &ControllerSet,
        limits: Option<&LimitSpec>,
        user_api: Option<&str>,
    ) -> Result<Self, Error> {
        let accepted_apis = accepted_user_apis(set);
        if let Some(api) = user_api {
            if !accepted_apis.iter().any(|known| known == api) {
                return Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "user_api must be one of {accepted_apis:?} or unset, got {api:?}"
                )));
            }
        }

        // The sequential-BLAS policy is decided against the live aggregate
        // before selection happens.
        let (effective_limits, effective_api) = match limits {
            None => (None, user_api.map(str::to_string)),
            Some(LimitSpec::SequentialBlasUnderOpenmp) => {
                if blas_dispatches_to_openmp(set) {
                    (None, None)
                } else {
                    (Some(LimitSpec::Max(1)), Some("blas".to_string()))
                }
            }
            Some(other) => (Some(other.clone()), user_api.map(str::to_string)),
        };

        let targets = compute_targets(set, effective_limits.as_ref(), effective_api.as_deref());

        let mut frame = Vec::with_capacity(targets.len());
        for (controller, target) in targets {
            let original = controller.num_threads();
            match controller.set_num_threads(target) {
                Ok(()) => frame.push(RestoreRecord {
                    controller,
                    original_num_threads: original,
                }),
                Err(err) => {
                    // Local failure: the rest of the bulk operation proceeds
                    // and everything already applied stays restorable.
                    tracing::warn!(
                        library = %controller.filepath().display(),
                        error = %err,
                        "failed to apply thread limit; leaving library untouched"
                    );
                }
            }
        }

        Ok(Self {
            frame,
            restored: false,
        })
    }

    /// Number of libraries this scope modified.
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Thread counts the touched libraries had before this scope's own
    /// modification, keyed by user API. A user API this scope did not modify
    /// is absent; differing originals under one user API report their minimum
    /// with a warning.
    pub fn get_original_num_threads(&self) -> BTreeMap<String, usize> {
        let mut minima: BTreeMap<String, usize> = BTreeMap::new();
        let mut ambiguous: BTreeSet<String> = BTreeSet::new();
        for record in &self.frame {
            let api = record.controller.user_api();
            match minima.entry(api.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(record.original_num_threads);
                }
                Entry::Occupied(mut slot) => {
                    if *slot.get() != record.original_num_threads {
                        ambiguous.insert(api.to_string());
                        let current = slot.get_mut();
                        *current = (*current).min(record.original_num_threads);
                    }
                }
            }
        }
        for api in &ambiguous {
            tracing::warn!(
                user_api = %api,
                "multiple original thread counts for one user API; reporting the minimum"
            );
        }
        minima
    }

    /// Restores every library this scope recorded to its frame-local
    /// original value. Idempotent; also runs on drop.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        for record in &self.frame {
            if let Err(err) = record
                .controller
                .set_num_threads(record.original_num_threads)
            {
                tracing::warn!(
                    library = %record.controller.filepath().display(),
                    error = %err,
                    "failed to restore thread count"
                );
            }
        }
    }

    /// Consumes the guard, leaving the limits applied. The caller can undo
    /// later by re-applying a snapshot taken before the scope was opened.
    pub fn persist(mut self) {
        self.restored = true;
    }
}

impl Drop for LimitGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

fn accepted_user_apis(set: &ControllerSet) -> Vec<String> {
    let mut apis = registry::process_registry()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .user_apis();
    // Sets built from an explicit registry may carry user APIs the process
    // registry has never seen.
    for controller in set.controllers() {
        if !apis.iter().any(|api| api == controller.user_api()) {
            apis.push(controller.user_api().to_string());
        }
    }
    apis
}

fn blas_dispatches_to_openmp(set: &ControllerSet) -> bool {
    set.controllers().iter().any(|controller| {
        controller.user_api() == "blas"
            && controller.threading_layer() == Some(ThreadingLayer::Openmp)
    })
}

fn compute_targets(
    set: &ControllerSet,
    limits: Option<&LimitSpec>,
    user_api: Option<&str>,
) -> Vec<(Arc<Controller>, usize)> {
    match limits {
        None => Vec::new(),
        Some(LimitSpec::Max(limit)) => set
            .controllers()
            .iter()
            .filter(|controller| user_api.is_none_or(|api| controller.user_api() == api))
            .map(|controller| (Arc::clone(controller), *limit))
            .collect(),
        // Prefix and snapshot specs carry their own selection; a user_api
        // argument does not narrow them further.
        Some(LimitSpec::ByPrefix(by_prefix)) => set
            .controllers()
            .iter()
            .filter_map(|controller| {
                by_prefix
                    .get(controller.prefix())
                    .map(|limit| (Arc::clone(controller), *limit))
            })
            .collect(),
        Some(LimitSpec::Snapshot(records)) => set
            .controllers()
            .iter()
            .filter_map(|controller| {
                records
                    .iter()
                    .find(|record| record.filepath == controller.filepath())
                    .map(|record| (Arc::clone(controller), record.num_threads))
            })
            .collect(),
        Some(LimitSpec::SequentialBlasUnderOpenmp) => {
            unreachable!("resolved to an effective spec before target computation")
        }
    }
}
