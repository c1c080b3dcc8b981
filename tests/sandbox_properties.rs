// tests/sandbox_properties.rs
//! End-to-end guarantees of the engines behind the dispatcher

mod common;

use proptest::prelude::*;
use sandbox_engine::dispatcher::{TaskId, TaskOutput, TaskState};
use sandbox_engine::runtime::filesystem::FsOp;
use sandbox_engine::runtime::micro_vm::MicroOp;
use sandbox_engine::runtime::process_manager::ProcessRequest;
use sandbox_engine::runtime::resource_limiter::ResourceLimits;
use sandbox_engine::runtime::wasm::{ModuleSource, WasmCapabilities, WasmOp};
use sandbox_engine::runtime::{EngineOp, FilesystemEngine, Payload};
use sandbox_engine::utils::config::{FilesystemConfig, QuotaConfig};
use sandbox_engine::{EngineError, ErrorCode, ResourceGovernor, SessionContext, Workspace};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn write_op(path: &str, content: Payload) -> EngineOp {
    EngineOp::Filesystem(FsOp::Write {
        path: path.to_string(),
        content,
        create_parents: true,
    })
}

/// Code of a rejection, whether at dispatch or during execution
async fn failure_code(h: &common::Harness, dispatched: sandbox_engine::Result<TaskId>) -> ErrorCode {
    match dispatched {
        Err(err) => err.code(),
        Ok(id) => {
            let snapshot = h.dispatcher.wait(id).await.unwrap();
            assert_eq!(snapshot.state, TaskState::Failed);
            snapshot.error.unwrap().code
        }
    }
}

fn escaping_path() -> impl Strategy<Value = String> {
    (
        prop::collection::vec("[a-z]{1,6}", 0..4),
        prop::collection::vec("[a-z]{1,6}", 0..4),
        any::<bool>(),
    )
        .prop_map(|(before, after, absolute)| {
            let mut segments = before;
            segments.push("..".to_string());
            segments.extend(after);
            let joined = segments.join("/");
            if absolute {
                format!("/{}", joined)
            } else {
                joined
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_parent_segments_never_leave_the_workspace(path in escaping_path()) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path().join("ws")).unwrap();
        let session = SessionContext::new("u", "s", workspace);
        let governor = Arc::new(ResourceGovernor::new(QuotaConfig::default()));
        let engine = FilesystemEngine::new(FilesystemConfig::default(), governor);

        let written = engine.write_bytes(&session, &path, b"x", true, &ResourceLimits::default());
        prop_assert!(matches!(written, Err(EngineError::PathEscape(_))), "{:?}", written);
        let read = engine.read_bytes(&session.workspace, &path, 1024);
        prop_assert!(matches!(read, Err(EngineError::PathEscape(_))), "{:?}", read);

        // Nothing was created anywhere under the temp dir besides the root.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        prop_assert_eq!(entries.len(), 1);
        prop_assert_eq!(std::fs::read_dir(session.workspace.root()).unwrap().count(), 0);
    }
}

#[tokio::test]
async fn test_symlink_out_of_workspace_is_an_escape() {
    let h = common::harness();
    let outside = h.dir.path().join("outside");
    std::fs::create_dir_all(&outside).unwrap();
    std::os::unix::fs::symlink(&outside, h.session.workspace.root().join("link")).unwrap();

    let result = h.dispatcher.dispatch(h.task(write_op("link/secret.txt", Payload::text("x"))));
    assert_eq!(failure_code(&h, result).await, ErrorCode::PathEscape);
    assert!(!outside.join("secret.txt").exists());
}

#[tokio::test]
async fn test_write_size_boundary() {
    let h = common::harness();
    let exact = "a".repeat(512 * 1024);
    let id = h.dispatcher.dispatch(h.task(write_op("exact.bin", Payload::text(exact)))).unwrap();
    assert_eq!(h.dispatcher.wait(id).await.unwrap().state, TaskState::Completed);

    let over = "a".repeat(512 * 1024 + 1);
    let result = h.dispatcher.dispatch(h.task(write_op("over.bin", Payload::text(over))));
    assert_eq!(failure_code(&h, result).await, ErrorCode::SizeExceeded);
    assert!(!h.session.workspace.root().join("over.bin").exists());
}

#[tokio::test]
async fn test_cancel_after_completion_is_idempotent() {
    let h = common::harness();
    let op = EngineOp::Process(ProcessRequest::new("echo", &["done"]));
    let id = h.dispatcher.dispatch(h.task(op)).unwrap();
    let completed = h.dispatcher.wait(id).await.unwrap();
    assert_eq!(completed.state, TaskState::Completed);

    for _ in 0..3 {
        assert_eq!(h.dispatcher.cancel(id).await.unwrap(), completed);
    }
}

#[tokio::test]
async fn test_sleeping_process_times_out_within_margin() {
    let h = common::harness();
    let op = EngineOp::Process(ProcessRequest::new("sh", &["-c", "sleep 60"]));
    let started = Instant::now();
    let id = h
        .dispatcher
        .dispatch(h.task(op).with_timeout(Duration::from_secs(1)))
        .unwrap();
    let snapshot = h.dispatcher.wait(id).await.unwrap();

    assert!(started.elapsed() <= Duration::from_millis(1_500), "{:?}", started.elapsed());
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.error.unwrap().code, ErrorCode::Timeout);
}

#[tokio::test]
async fn test_wasm_fuel_exhaustion_is_deterministic() {
    let h = common::harness();
    let spin = wat::parse_str(r#"(module (func (export "spin") (loop br 0)))"#).unwrap();

    let mut messages = Vec::new();
    for _ in 0..3 {
        let op = EngineOp::Wasm(WasmOp::Call {
            module: ModuleSource::Inline {
                wasm: Payload::from_bytes(spin.clone()),
            },
            function: "spin".into(),
            args: vec![],
            fuel: Some(25_000),
            capabilities: WasmCapabilities::default(),
        });
        let id = h.dispatcher.dispatch(h.task(op)).unwrap();
        let snapshot = h.dispatcher.wait(id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        let error = snapshot.error.unwrap();
        assert_eq!(error.code, ErrorCode::ResourceExceeded);
        messages.push(error.message);
    }
    assert!(messages[0].contains("25000"), "{}", messages[0]);
    assert!(messages.iter().all(|m| m == &messages[0]));
}

#[tokio::test]
async fn test_same_path_writes_never_interleave() {
    let h = common::harness();
    let first = "1".repeat(500 * 1024);
    let second = "2".repeat(300 * 1024);

    let a = h.dispatcher.dispatch(h.task(write_op("shared.txt", Payload::text(first)))).unwrap();
    let b = h.dispatcher.dispatch(h.task(write_op("shared.txt", Payload::text(second.clone())))).unwrap();
    let a = h.dispatcher.wait(a).await.unwrap();
    let b = h.dispatcher.wait(b).await.unwrap();

    assert_eq!(a.state, TaskState::Completed);
    assert_eq!(b.state, TaskState::Completed);
    assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
    let content = std::fs::read_to_string(h.session.workspace.root().join("shared.txt")).unwrap();
    assert_eq!(content, second);
}

#[tokio::test]
async fn test_sequential_micro_runs_stay_within_pool_capacity() {
    let h = common::harness();
    for i in 0..5 {
        let op = EngineOp::MicroVm(MicroOp::Run {
            image: "sh".into(),
            code: format!("echo step-{}", i),
            timeout_ms: None,
        });
        let id = h.dispatcher.dispatch(h.task(op)).unwrap();
        let snapshot = h.dispatcher.wait(id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Completed, "{:?}", snapshot.error);
        let Some(TaskOutput::Engine(output)) = snapshot.output else {
            panic!("expected engine output");
        };
        assert_eq!(output.execution().unwrap().stdout_text(), format!("step-{}\n", i));
    }

    let pool = h.dispatcher.engines().micro.pool();
    assert!(pool.total_instances() <= h.config.micro.pool_capacity);
    let stats = &pool.stats()[0];
    assert!(stats.booted as usize <= h.config.micro.pool_capacity);
}
