//! Process controller behaviour against real child processes
//!
//! These tests drive `sh`, so they only run on Unix.

#![cfg(unix)]

use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ytwrap::process::{
    DirectSignal, ProcessContext, ProcessController, SpawnRequest, TermSignal, Terminator,
    TransformStep, TreeSignal,
};
use ytwrap::{ProcessError, ProgressEvent, ProgressTransform};

fn context() -> ProcessContext {
    ProcessContext::new(Duration::ZERO)
}

fn sh(script: &str) -> SpawnRequest {
    SpawnRequest::new("sh")
        .args(["-c", script])
        .try_count(1)
        .settle_interval(Duration::from_millis(50))
}

async fn launch<T: 'static>(ctx: &ProcessContext, request: SpawnRequest<T>) -> ProcessController<T> {
    ctx.spawn(request).await.expect("sh should launch")
}

async fn collect<T>(controller: &ProcessController<T>) -> Vec<T> {
    controller
        .listen()
        .map(|item| item.expect("transform should not fail"))
        .collect()
        .await
}

/// Terminator that counts deliveries and forwards them to `DirectSignal`
#[derive(Default)]
struct CountingTerminator {
    calls: AtomicUsize,
}

impl Terminator for CountingTerminator {
    fn terminate(&self, pid: u32, signal: TermSignal) -> ytwrap::error::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DirectSignal.terminate(pid, signal)
    }
}

// ============================================================================
// listen()
// ============================================================================

#[tokio::test]
async fn test_output_before_listen_is_yielded_in_order() {
    let ctx = context();
    let controller = launch(&ctx, sh("printf 'one\\ntwo\\nthree\\n'")).await;

    // Let the process finish so every line is buffered before anyone listens
    controller.wait().await;

    assert_eq!(collect(&controller).await, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_live_lines_follow_buffered_lines() {
    let ctx = context();
    let controller = launch(&ctx, sh("echo early; sleep 0.3; echo late")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(collect(&controller).await, vec!["early", "late"]);
}

#[tokio::test]
async fn test_stop_ends_sequence_before_the_stop_line() {
    let ctx = context();
    let request = sh("printf 'a\\nb\\nSTOP\\nc\\n'").transform(|line| {
        Ok(if line == "STOP" {
            TransformStep::Stop
        } else {
            TransformStep::Emit(line.to_uppercase())
        })
    });
    let controller = launch(&ctx, request).await;

    assert_eq!(collect(&controller).await, vec!["A", "B"]);
}

#[tokio::test]
async fn test_skipped_lines_are_dropped() {
    let ctx = context();
    let request =
        sh("printf '1\\nx\\n2\\n'").transform(|line| Ok(TransformStep::from(line.parse::<u32>().ok())));
    let controller = launch(&ctx, request).await;

    assert_eq!(collect(&controller).await, vec![1, 2]);
}

#[tokio::test]
async fn test_transform_error_is_yielded_once() {
    let ctx = context();
    let request = sh("printf 'ok\\nbad\\nlater\\n'").transform(|line| {
        if line == "bad" {
            anyhow::bail!("cannot decode {line}");
        }
        Ok(TransformStep::Emit(line.to_string()))
    });
    let controller = launch(&ctx, request).await;

    let mut stream = controller.listen();
    assert_eq!(stream.next().await.unwrap().unwrap(), "ok");
    match stream.next().await {
        Some(Err(ProcessError::Transform(e))) => assert!(e.to_string().contains("cannot decode bad")),
        other => panic!("Expected transform error, got {other:?}"),
    }
    assert!(stream.next().await.is_none(), "Stream should end after a transform error");
}

#[tokio::test]
async fn test_dropped_listener_hands_back_unread_lines() {
    let ctx = context();
    let controller = launch(&ctx, sh("printf 'a\\nb\\nc\\n'")).await;
    controller.wait().await;

    {
        let mut first = controller.listen();
        assert_eq!(first.next().await.unwrap().unwrap(), "a");
    }

    assert_eq!(collect(&controller).await, vec!["b", "c"]);
}

#[tokio::test]
async fn test_second_concurrent_listener_gets_nothing() {
    let ctx = context();
    let controller = launch(&ctx, sh("printf 'a\\nb\\n'")).await;
    controller.wait().await;

    let _first = controller.listen();
    let second: Vec<_> = controller.listen().collect().await;
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_abandoning_listen_does_not_kill() {
    let ctx = context();
    let controller = launch(&ctx, sh("echo start; sleep 0.3; echo done")).await;

    {
        let mut stream = controller.listen();
        assert_eq!(stream.next().await.unwrap().unwrap(), "start");
    }

    assert!(controller.is_running());
    let exit = controller.wait().await;
    assert_eq!(exit.code, Some(0));
    assert_eq!(collect(&controller).await, vec!["done"]);
}

// ============================================================================
// wait() and exit state
// ============================================================================

#[tokio::test]
async fn test_exit_code_is_captured() {
    let ctx = context();
    let controller = launch(&ctx, sh("exit 3")).await;

    let exit = controller.wait().await;
    assert_eq!(exit.code, Some(3));
    assert_eq!(exit.signal, None);
    assert!(!exit.success());
    assert!(!controller.is_running());
    assert_eq!(controller.exit_code(), Some(3));
}

#[tokio::test]
async fn test_wait_after_exit_returns_immediately() {
    let ctx = context();
    let controller = launch(&ctx, sh("true")).await;

    let first = controller.wait().await;
    let second = tokio::time::timeout(Duration::from_millis(100), controller.wait())
        .await
        .expect("wait on an exited process should not block");
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_exit_state_is_empty_while_running() {
    let ctx = context();
    let controller = launch(&ctx, sh("sleep 5")).await;

    assert!(controller.is_running());
    assert_eq!(controller.exit_state(), None);
    assert_eq!(controller.exit_code(), None);
    assert_eq!(controller.exit_signal(), None);

    controller.kill();
    controller.wait().await;
}

// ============================================================================
// from_id()
// ============================================================================

#[tokio::test]
async fn test_from_id_finds_live_controller() {
    let ctx = context();
    let controller = launch(&ctx, sh("sleep 5")).await;

    let found = ctx
        .from_id::<String>(controller.id())
        .expect("live controller should be registered");
    assert_eq!(found.id(), controller.id());
    assert_eq!(found.pid(), controller.pid());

    let snapshot = ctx.registry().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, controller.id());
    assert_eq!(snapshot[0].command, "sh");
    assert_eq!(snapshot[0].args, vec!["-c", "sleep 5"]);

    controller.kill();
    controller.wait().await;
}

#[tokio::test]
async fn test_from_id_is_none_right_after_exit() {
    let ctx = context();
    let controller = launch(&ctx, sh("true")).await;
    let id = controller.id().to_string();

    controller.wait().await;

    assert!(ctx.from_id::<String>(&id).is_none());
    assert!(!ctx.registry().contains(&id));
    assert!(ctx.registry().is_empty());
}

#[tokio::test]
async fn test_from_id_with_wrong_value_type() {
    let ctx = context();
    let controller = launch(&ctx, sh("sleep 5")).await;

    assert!(ctx.registry().contains(controller.id()));
    assert!(ctx.from_id::<u32>(controller.id()).is_none());

    controller.kill();
    controller.wait().await;
}

#[tokio::test]
async fn test_from_id_unknown() {
    let ctx = context();
    assert!(ctx.from_id::<String>("not-an-id").is_none());
}

// ============================================================================
// kill()
// ============================================================================

#[tokio::test]
async fn test_kill_records_signal() {
    let ctx = context();
    let controller = launch(&ctx, sh("sleep 30")).await;

    controller.kill();
    let exit = controller.wait().await;

    assert_eq!(exit.code, None);
    assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
    assert!(controller.is_killed());
}

#[tokio::test]
async fn test_kill_with_custom_signal() {
    let ctx = context();
    let controller = launch(&ctx, sh("sleep 30")).await;

    controller.kill_with(TermSignal::Kill);
    let exit = controller.wait().await;
    assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
}

#[tokio::test]
async fn test_second_kill_is_a_no_op() {
    let counter = Arc::new(CountingTerminator::default());
    let ctx = ProcessContext::with_terminator(Duration::ZERO, counter.clone());
    let controller = launch(&ctx, sh("sleep 30")).await;

    controller.kill();
    controller.kill();
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

    controller.wait().await;
    controller.kill();
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_kill_after_exit_is_ignored() {
    let counter = Arc::new(CountingTerminator::default());
    let ctx = ProcessContext::with_terminator(Duration::ZERO, counter.clone());
    let controller = launch(&ctx, sh("true")).await;

    controller.wait().await;
    controller.kill();

    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    assert!(!controller.is_killed());
}

#[tokio::test]
async fn test_tree_kill_reaches_grandchild() {
    let ctx = ProcessContext::with_terminator(Duration::ZERO, Arc::new(TreeSignal));
    let controller = launch(&ctx, sh("sleep 30 & echo $!; wait")).await;

    let mut stream = controller.listen();
    let grandchild: u32 = stream
        .next()
        .await
        .expect("shell should print the worker pid")
        .unwrap()
        .parse()
        .expect("pid should be numeric");
    drop(stream);

    controller.kill();
    controller.wait().await;

    let pid = sysinfo::Pid::from_u32(grandchild);
    let mut gone = false;
    for _ in 0..60 {
        let mut sys = sysinfo::System::new();
        sys.refresh_processes();
        gone = match sys.process(pid) {
            None => true,
            Some(p) => p.status() == sysinfo::ProcessStatus::Zombie,
        };
        if gone {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "Worker {grandchild} should be terminated with its parent");
}

// ============================================================================
// Progress decoding end to end
// ============================================================================

#[tokio::test]
async fn test_progress_line_yields_payload() {
    let ctx = context();
    let request = sh(r#"printf '[progress] {"a":1}\n'"#)
        .with_transform(ProgressTransform::default().into_transform());
    let controller = launch(&ctx, request).await;

    let events = collect(&controller).await;
    assert_eq!(events, vec![ProgressEvent::Progress(json!({"a": 1}))]);

    let exit = controller.wait().await;
    assert_eq!(exit.code, Some(0));
}

#[tokio::test]
async fn test_already_downloaded_yields_nothing() {
    let ctx = context();
    let request = sh(concat!(
        "echo '[download] /tmp/clip.mp4 has already been downloaded'; ",
        r#"printf '[progress] {"a":2}\n'"#
    ))
    .with_transform(ProgressTransform::new(true).into_transform());
    let controller = launch(&ctx, request).await;

    assert!(collect(&controller).await.is_empty());
    assert_eq!(controller.wait().await.code, Some(0));
}
