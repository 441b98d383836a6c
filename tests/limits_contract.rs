// Limiting-stack contract tests over in-memory controllers, so the whole
// apply/restore/nesting surface is exercised without native BLAS installed.
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use threadctl::{
    Controller, ControllerSet, Error, ErrorKind, LibController, LimitSpec, Selector,
    ThreadingLayer,
};

#[derive(Debug)]
struct FakePool {
    threads: AtomicUsize,
    layer: Option<ThreadingLayer>,
    reject_set: bool,
}

impl FakePool {
    fn new(threads: usize, layer: Option<ThreadingLayer>) -> Self {
        Self {
            threads: AtomicUsize::new(threads),
            layer,
            reject_set: false,
        }
    }

    fn rejecting(threads: usize) -> Self {
        Self {
            reject_set: true,
            ..Self::new(threads, Some(ThreadingLayer::Pthreads))
        }
    }
}

impl LibController for FakePool {
    fn num_threads(&self) -> usize {
        self.threads.load(Ordering::SeqCst)
    }

    fn set_num_threads(&self, num_threads: usize) -> Result<(), Error> {
        if self.reject_set {
            return Err(Error::new(ErrorKind::Backend).with_message("set_num_threads rejected"));
        }
        self.threads.store(num_threads, Ordering::SeqCst);
        Ok(())
    }

    fn version(&self) -> Option<String> {
        Some("0.0.0-fake".to_string())
    }

    fn threading_layer(&self) -> Option<ThreadingLayer> {
        self.layer
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn blas(prefix: &str, threads: usize, layer: ThreadingLayer) -> Arc<Controller> {
    Arc::new(Controller::new(
        "blas",
        "openblas",
        prefix,
        format!("/fake/{prefix}.so.0"),
        Box::new(FakePool::new(threads, Some(layer))),
    ))
}

fn openmp(threads: usize) -> Arc<Controller> {
    Arc::new(Controller::new(
        "openmp",
        "openmp",
        "libgomp",
        "/fake/libgomp.so.1",
        Box::new(FakePool::new(threads, Some(ThreadingLayer::Openmp))),
    ))
}

#[test]
fn limit_applies_and_restores_on_drop() {
    let ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let set = ControllerSet::from_controllers(vec![Arc::clone(&ctrl)]);

    {
        let _guard = set
            .limit(Some(&LimitSpec::Max(2)), None)
            .expect("apply limit");
        assert_eq!(ctrl.num_threads(), 2);
    }
    assert_eq!(ctrl.num_threads(), 8);
}

#[test]
fn nested_scopes_restore_to_the_enclosing_value() {
    let ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let set = ControllerSet::from_controllers(vec![Arc::clone(&ctrl)]);

    let outer = set.limit(Some(&LimitSpec::Max(1)), None).expect("outer");
    assert_eq!(ctrl.num_threads(), 1);
    {
        let _inner = set.limit(Some(&LimitSpec::Max(4)), None).expect("inner");
        assert_eq!(ctrl.num_threads(), 4);
    }
    assert_eq!(ctrl.num_threads(), 1);
    drop(outer);
    assert_eq!(ctrl.num_threads(), 8);
}

#[test]
fn user_api_narrows_a_uniform_limit() {
    let blas_ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let omp_ctrl = openmp(6);
    let set =
        ControllerSet::from_controllers(vec![Arc::clone(&blas_ctrl), Arc::clone(&omp_ctrl)]);

    let _guard = set
        .limit(Some(&LimitSpec::Max(1)), Some("blas"))
        .expect("apply");
    assert_eq!(blas_ctrl.num_threads(), 1);
    assert_eq!(omp_ctrl.num_threads(), 6);
}

#[test]
fn by_prefix_limits_only_listed_prefixes() {
    let blas_ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let omp_ctrl = openmp(6);
    let set =
        ControllerSet::from_controllers(vec![Arc::clone(&blas_ctrl), Arc::clone(&omp_ctrl)]);

    let mut by_prefix = BTreeMap::new();
    by_prefix.insert("libopenblas".to_string(), 3);
    let _guard = set
        .limit(Some(&LimitSpec::ByPrefix(by_prefix)), None)
        .expect("apply");
    assert_eq!(blas_ctrl.num_threads(), 3);
    assert_eq!(omp_ctrl.num_threads(), 6);
}

#[test]
fn snapshot_restores_an_exported_state() {
    let blas_ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let omp_ctrl = openmp(6);
    let set =
        ControllerSet::from_controllers(vec![Arc::clone(&blas_ctrl), Arc::clone(&omp_ctrl)]);

    let snapshot = set.info();
    blas_ctrl.set_num_threads(1).expect("set");
    omp_ctrl.set_num_threads(1).expect("set");

    set.limit(Some(&LimitSpec::Snapshot(snapshot)), None)
        .expect("apply")
        .persist();
    assert_eq!(blas_ctrl.num_threads(), 8);
    assert_eq!(omp_ctrl.num_threads(), 6);
}

#[test]
fn sequential_blas_limits_when_blas_runs_its_own_threads() {
    let blas_ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let omp_ctrl = openmp(6);
    let set =
        ControllerSet::from_controllers(vec![Arc::clone(&blas_ctrl), Arc::clone(&omp_ctrl)]);

    let guard = set
        .limit(Some(&LimitSpec::SequentialBlasUnderOpenmp), None)
        .expect("apply");
    assert_eq!(blas_ctrl.num_threads(), 1);
    assert_eq!(omp_ctrl.num_threads(), 6);
    drop(guard);
    assert_eq!(blas_ctrl.num_threads(), 8);
}

#[test]
fn sequential_blas_is_a_noop_when_blas_dispatches_to_openmp() {
    let blas_ctrl = blas("libopenblas", 8, ThreadingLayer::Openmp);
    let omp_ctrl = openmp(6);
    let set =
        ControllerSet::from_controllers(vec![Arc::clone(&blas_ctrl), Arc::clone(&omp_ctrl)]);

    let guard = set
        .limit(Some(&LimitSpec::SequentialBlasUnderOpenmp), None)
        .expect("apply");
    assert!(guard.is_empty());
    assert_eq!(blas_ctrl.num_threads(), 8);
    assert_eq!(omp_ctrl.num_threads(), 6);
}

#[test]
fn none_limits_open_an_empty_scope() {
    let ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let set = ControllerSet::from_controllers(vec![Arc::clone(&ctrl)]);

    let guard = set.limit(None, None).expect("apply");
    assert!(guard.is_empty());
    assert_eq!(ctrl.num_threads(), 8);
}

#[test]
fn unknown_user_api_is_a_usage_error_naming_the_accepted_set() {
    let set = ControllerSet::from_controllers(vec![blas(
        "libopenblas",
        8,
        ThreadingLayer::Pthreads,
    )]);

    let err = set
        .limit(Some(&LimitSpec::Max(1)), Some("cuda"))
        .expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::Usage);
    let message = err.message().unwrap_or_default();
    assert!(message.contains("blas"), "message: {message}");
    assert!(message.contains("openmp"), "message: {message}");
    assert!(message.contains("cuda"), "message: {message}");
}

#[test]
fn get_original_num_threads_reports_pre_scope_values() {
    let blas_ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let omp_ctrl = openmp(6);
    let set =
        ControllerSet::from_controllers(vec![Arc::clone(&blas_ctrl), Arc::clone(&omp_ctrl)]);

    let guard = set.limit(Some(&LimitSpec::Max(2)), None).expect("apply");
    let originals = guard.get_original_num_threads();
    assert_eq!(originals.get("blas"), Some(&8));
    assert_eq!(originals.get("openmp"), Some(&6));
}

#[test]
fn untouched_apis_are_absent_from_original_num_threads() {
    let set = ControllerSet::from_controllers(vec![openmp(6)]);

    let guard = set
        .limit(Some(&LimitSpec::Max(2)), Some("blas"))
        .expect("apply");
    assert!(guard.get_original_num_threads().is_empty());
}

#[test]
fn ambiguous_originals_report_the_minimum() {
    let a = blas("libopenblas", 4, ThreadingLayer::Pthreads);
    let b = blas("libblis", 9, ThreadingLayer::Pthreads);
    let set = ControllerSet::from_controllers(vec![a, b]);

    let guard = set.limit(Some(&LimitSpec::Max(1)), None).expect("apply");
    assert_eq!(guard.get_original_num_threads().get("blas"), Some(&4));
}

#[test]
fn matching_originals_report_the_shared_value() {
    let a = blas("libopenblas", 4, ThreadingLayer::Pthreads);
    let b = blas("libblis", 4, ThreadingLayer::Pthreads);
    let set = ControllerSet::from_controllers(vec![a, b]);

    let guard = set.limit(Some(&LimitSpec::Max(1)), None).expect("apply");
    assert_eq!(guard.get_original_num_threads().get("blas"), Some(&4));
}

#[test]
fn manual_restore_is_idempotent() {
    let ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let set = ControllerSet::from_controllers(vec![Arc::clone(&ctrl)]);

    let mut guard = set.limit(Some(&LimitSpec::Max(2)), None).expect("apply");
    guard.restore();
    assert_eq!(ctrl.num_threads(), 8);
    ctrl.set_num_threads(5).expect("set");
    guard.restore();
    drop(guard);
    assert_eq!(ctrl.num_threads(), 5);
}

#[test]
fn persist_keeps_the_limits_applied() {
    let ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let set = ControllerSet::from_controllers(vec![Arc::clone(&ctrl)]);

    set.limit(Some(&LimitSpec::Max(2)), None)
        .expect("apply")
        .persist();
    assert_eq!(ctrl.num_threads(), 2);
}

#[test]
fn wrap_restores_around_the_body() {
    let ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let set = ControllerSet::from_controllers(vec![Arc::clone(&ctrl)]);

    let observed = set
        .wrap(Some(&LimitSpec::Max(3)), None, || ctrl.num_threads())
        .expect("wrap");
    assert_eq!(observed, 3);
    assert_eq!(ctrl.num_threads(), 8);
}

#[test]
fn failing_controller_is_skipped_and_the_rest_apply() {
    let healthy = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let broken = Arc::new(Controller::new(
        "blas",
        "mkl",
        "libmkl_rt",
        "/fake/libmkl_rt.so.2",
        Box::new(FakePool::rejecting(12)),
    ));
    let set = ControllerSet::from_controllers(vec![Arc::clone(&healthy), Arc::clone(&broken)]);

    let guard = set.limit(Some(&LimitSpec::Max(2)), None).expect("apply");
    assert_eq!(guard.len(), 1);
    assert_eq!(healthy.num_threads(), 2);
    assert_eq!(broken.num_threads(), 12);
    drop(guard);
    assert_eq!(healthy.num_threads(), 8);
}

#[test]
fn select_composes_keys_with_and_and_values_with_or() {
    let a = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let b = blas("libblis", 4, ThreadingLayer::Pthreads);
    let c = openmp(6);
    let set = ControllerSet::from_controllers(vec![a, b, c]);

    let both_blas = set.select(&Selector::new().user_api("blas"));
    assert_eq!(both_blas.len(), 2);

    let either_prefix = set.select(&Selector::new().prefix("libblis").prefix("libgomp"));
    assert_eq!(either_prefix.len(), 2);

    let narrowed = set.select(&Selector::new().user_api("blas").prefix("libblis"));
    assert_eq!(narrowed.len(), 1);
    assert_eq!(narrowed.controllers()[0].internal_api(), "openblas");
}

#[test]
fn limits_parsed_from_json_round_trip_through_the_guard() {
    let ctrl = blas("libopenblas", 8, ThreadingLayer::Pthreads);
    let set = ControllerSet::from_controllers(vec![Arc::clone(&ctrl)]);

    let spec = LimitSpec::from_json(&json!({"libopenblas": 2}))
        .expect("parse")
        .expect("some");
    let _guard = set.limit(Some(&spec), None).expect("apply");
    assert_eq!(ctrl.num_threads(), 2);
}
