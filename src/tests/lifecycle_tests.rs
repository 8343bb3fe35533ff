//! End-to-end lifecycle tests driving the assembled kernel against a fake
//! agent CLI.

use std::sync::Arc;
use std::time::Duration;

use super::test_helpers::{fake_cli, reporting_cli, slow_cli, test_config, wait_for};
use crate::approvals::DecisionChoice;
use crate::bus::BusEvent;
use crate::models::{AgentState, Task, TaskStatus};
use crate::roles::StaticRoleOracle;
use crate::notify::LogDispatcher;
use crate::usage::Window;
use crate::Kernel;
use rust_decimal_macros::dec;

async fn kernel_with(cli: &std::path::Path, dir: &std::path::Path, cap: usize) -> Arc<Kernel> {
    let kernel = Kernel::new(test_config(dir, cli, cap)).await.unwrap();
    kernel.start().await;
    kernel
}

#[tokio::test]
async fn basic_spawn_is_metered_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let cli = reporting_cli(dir.path());
    let kernel = kernel_with(&cli, dir.path(), 2).await;
    let mut events = kernel.bus.subscribe();

    let task = Task::new("run tests", "run the suite and report").with_context("user_id", "u1");
    let task_id = kernel.dispatcher.submit(task).await.unwrap();

    let view = wait_for(Duration::from_secs(10), || async {
        let view = kernel.dispatcher.status(&task_id).await?;
        view.status.is_terminal().then_some(view)
    })
    .await
    .expect("task should reach a terminal state");

    assert_eq!(view.status, TaskStatus::Completed);

    // The description infers test-runner, which runs on haiku.
    let agent = kernel
        .spawner
        .status(view.agent_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(agent.state, AgentState::Completed);
    assert_eq!(agent.exit_code, Some(0));
    assert!(agent.stdout.iter().any(|l| l.contains("Input: 100 tokens")));

    // One usage record with the reported tokens at haiku rates.
    let records = kernel.meter.agent_metrics(&agent.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].input_tokens, 100);
    assert_eq!(records[0].output_tokens, 250);
    assert_eq!(records[0].cost, dec!(0.0003));
    assert!(!records[0].metadata.contains_key("estimated"));

    let summary = kernel.meter.summary(Window::Day, "u1").await.unwrap();
    assert_eq!(summary.total_calls, 1);
    assert_eq!(summary.total_cost, dec!(0.0003));

    let mut saw_tracked = false;
    while let Ok(event) = events.try_recv() {
        if let BusEvent::UsageTracked { user_id, .. } = event {
            assert_eq!(user_id, "u1");
            saw_tracked = true;
        }
    }
    assert!(saw_tracked);

    // The manifest was cleaned up on exit.
    let manifest_dir = dir.path().join(".ai-tasks");
    if manifest_dir.exists() {
        assert_eq!(std::fs::read_dir(&manifest_dir).unwrap().count(), 0);
    }

    kernel.shutdown().await;
}

#[tokio::test]
async fn concurrency_cap_holds_under_burst() {
    let dir = tempfile::tempdir().unwrap();
    let cli = slow_cli(dir.path(), "0.5");
    let kernel = kernel_with(&cli, dir.path(), 2).await;
    let mut events = kernel.bus.subscribe();

    let mut task_ids = Vec::new();
    for i in 0..5 {
        let task = Task::new(format!("bulk job {i}"), "work").with_context("user_id", "u1");
        task_ids.push(kernel.dispatcher.submit(task).await.unwrap());
    }

    // Everything eventually completes.
    for task_id in &task_ids {
        let view = wait_for(Duration::from_secs(15), || async {
            let view = kernel.dispatcher.status(task_id).await?;
            view.status.is_terminal().then_some(view)
        })
        .await
        .expect("burst task should finish");
        assert_eq!(view.status, TaskStatus::Completed);
    }

    // Replay the event stream: live agents never exceeded the cap.
    let mut live: i32 = 0;
    let mut max_live: i32 = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            BusEvent::AgentSpawned { .. } => {
                live += 1;
                max_live = max_live.max(live);
            }
            BusEvent::AgentStatus { state, .. } if state.is_terminal() => {
                live -= 1;
            }
            _ => {}
        }
    }
    assert!(max_live <= 2, "live agents peaked at {max_live}");

    kernel.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_dispatched_task_terminates_the_agent() {
    let dir = tempfile::tempdir().unwrap();
    let cli = slow_cli(dir.path(), "30");
    let kernel = kernel_with(&cli, dir.path(), 2).await;

    let task = Task::new("long running analysis job", "work forever")
        .with_context("user_id", "u1");
    let task_id = kernel.dispatcher.submit(task).await.unwrap();

    let agent_id = wait_for(Duration::from_secs(10), || async {
        kernel.dispatcher.status(&task_id).await?.agent_id
    })
    .await
    .expect("task should dispatch");

    kernel.dispatcher.cancel(&task_id).await.unwrap();

    let view = wait_for(Duration::from_secs(10), || async {
        let view = kernel.dispatcher.status(&task_id).await?;
        view.status.is_terminal().then_some(view)
    })
    .await
    .expect("cancelled task should settle");
    assert_eq!(view.status, TaskStatus::Cancelled);

    let agent = kernel.spawner.status(&agent_id).await.unwrap();
    assert_eq!(agent.state, AgentState::Terminated);

    // Usage is still recorded, flagged as terminated.
    let records = kernel.meter.agent_metrics(&agent_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].metadata.get("terminated").map(String::as_str), Some("true"));

    kernel.shutdown().await;
}

#[tokio::test]
async fn missing_cli_fails_the_task_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");
    let kernel = kernel_with(&missing, dir.path(), 2).await;

    let task = Task::new("doomed job", "nothing will run").with_context("user_id", "u1");
    let task_id = kernel.dispatcher.submit(task).await.unwrap();

    let view = wait_for(Duration::from_secs(10), || async {
        let view = kernel.dispatcher.status(&task_id).await?;
        view.status.is_terminal().then_some(view)
    })
    .await
    .expect("task should fail");
    assert_eq!(view.status, TaskStatus::Failed);

    let agent = kernel
        .spawner
        .status(view.agent_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(agent.state, AgentState::Failed);
    assert!(agent.stderr.iter().any(|l| l.contains("failed to spawn")));

    kernel.shutdown().await;
}

#[tokio::test]
async fn conflicting_tasks_serialize_on_their_lock() {
    let dir = tempfile::tempdir().unwrap();
    let cli = slow_cli(dir.path(), "0.4");
    let kernel = kernel_with(&cli, dir.path(), 4).await;

    let first = Task::new("first writer job", "write the file")
        .with_context("user_id", "u1")
        .with_context("locks", "file:/shared/report.md");
    let second = Task::new("second writer job", "write the file too")
        .with_context("user_id", "u1")
        .with_context("locks", "file:/shared/report.md");

    let first_id = kernel.dispatcher.submit(first).await.unwrap();
    let second_id = kernel.dispatcher.submit(second).await.unwrap();

    for task_id in [&first_id, &second_id] {
        let view = wait_for(Duration::from_secs(15), || async {
            let view = kernel.dispatcher.status(task_id).await?;
            view.status.is_terminal().then_some(view)
        })
        .await
        .expect("locked task should finish");
        assert_eq!(view.status, TaskStatus::Completed);
    }

    // Both agents ran, but never at the same time: the second started only
    // after the first ended.
    let first_agent = kernel
        .spawner
        .status(kernel.dispatcher.status(&first_id).await.unwrap().agent_id.as_deref().unwrap())
        .await
        .unwrap();
    let second_agent = kernel
        .spawner
        .status(kernel.dispatcher.status(&second_id).await.unwrap().agent_id.as_deref().unwrap())
        .await
        .unwrap();
    assert!(second_agent.started_at >= first_agent.ended_at.unwrap());

    // All task locks were released at completion.
    assert!(kernel.locks.active_locks().await.unwrap().is_empty());

    kernel.shutdown().await;
}

#[tokio::test]
async fn guarded_tasks_dispatch_only_after_approval() {
    let dir = tempfile::tempdir().unwrap();
    let cli = reporting_cli(dir.path());

    let roles = Arc::new(StaticRoleOracle::new());
    roles.assign("alice", "admin").await;
    let kernel = Kernel::with_collaborators(
        test_config(dir.path(), &cli, 2),
        roles,
        Arc::new(LogDispatcher),
    )
    .await
    .unwrap();
    kernel.start().await;

    let task = Task::new("ship the release build", "deploy it")
        .with_context("user_id", "dev-1")
        .with_context("approval_type", "code-deployment")
        .with_context("risk", "high")
        .with_context("resource", "/srv/production/api");
    let task_id = kernel.dispatcher.submit(task).await.unwrap();

    // The task parks awaiting approval.
    let view = wait_for(Duration::from_secs(10), || async {
        let view = kernel.dispatcher.status(&task_id).await?;
        (view.status == TaskStatus::AwaitingApproval).then_some(view)
    })
    .await
    .expect("task should await approval");
    assert!(view.agent_id.is_none());

    let pending = kernel.gate.pending_for("alice").await;
    assert_eq!(pending.len(), 1);

    kernel
        .gate
        .decide(&pending[0].id, "alice", DecisionChoice::Approve, None)
        .await
        .unwrap();

    let view = wait_for(Duration::from_secs(10), || async {
        let view = kernel.dispatcher.status(&task_id).await?;
        view.status.is_terminal().then_some(view)
    })
    .await
    .expect("approved task should run to completion");
    assert_eq!(view.status, TaskStatus::Completed);

    kernel.shutdown().await;
}

#[tokio::test]
async fn rejected_approval_fails_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let cli = reporting_cli(dir.path());

    let roles = Arc::new(StaticRoleOracle::new());
    roles.assign("alice", "admin").await;
    let kernel = Kernel::with_collaborators(
        test_config(dir.path(), &cli, 2),
        roles,
        Arc::new(LogDispatcher),
    )
    .await
    .unwrap();
    kernel.start().await;

    let task = Task::new("ship a risky change", "deploy it")
        .with_context("user_id", "dev-1")
        .with_context("approval_type", "code-deployment")
        .with_context("risk", "critical");
    let task_id = kernel.dispatcher.submit(task).await.unwrap();

    let pending = wait_for(Duration::from_secs(10), || async {
        let pending = kernel.gate.pending_for("alice").await;
        (!pending.is_empty()).then_some(pending)
    })
    .await
    .expect("approval request should appear");

    kernel
        .gate
        .decide(
            &pending[0].id,
            "alice",
            DecisionChoice::Reject,
            Some("not during the freeze".to_string()),
        )
        .await
        .unwrap();

    let view = wait_for(Duration::from_secs(10), || async {
        let view = kernel.dispatcher.status(&task_id).await?;
        view.status.is_terminal().then_some(view)
    })
    .await
    .expect("rejected task should settle");
    assert_eq!(view.status, TaskStatus::Failed);
    assert!(view.agent_id.is_none());

    kernel.shutdown().await;
}

#[tokio::test]
async fn dependencies_gate_dispatch_order() {
    let dir = tempfile::tempdir().unwrap();
    let cli = slow_cli(dir.path(), "0.3");
    let kernel = kernel_with(&cli, dir.path(), 4).await;

    let upstream = Task::new("produce the dataset first", "step one")
        .with_context("user_id", "u1");
    let upstream_id = kernel.dispatcher.submit(upstream).await.unwrap();

    let downstream = Task::new("consume the dataset afterwards", "step two")
        .with_context("user_id", "u1")
        .with_dependency(upstream_id.clone());
    let downstream_id = kernel.dispatcher.submit(downstream).await.unwrap();

    for task_id in [&upstream_id, &downstream_id] {
        let view = wait_for(Duration::from_secs(15), || async {
            let view = kernel.dispatcher.status(task_id).await?;
            view.status.is_terminal().then_some(view)
        })
        .await
        .expect("dependency chain should finish");
        assert_eq!(view.status, TaskStatus::Completed);
    }

    let upstream_agent = kernel
        .spawner
        .status(kernel.dispatcher.status(&upstream_id).await.unwrap().agent_id.as_deref().unwrap())
        .await
        .unwrap();
    let downstream_agent = kernel
        .spawner
        .status(kernel.dispatcher.status(&downstream_id).await.unwrap().agent_id.as_deref().unwrap())
        .await
        .unwrap();
    assert!(downstream_agent.started_at >= upstream_agent.ended_at.unwrap());

    kernel.shutdown().await;
}

#[tokio::test]
async fn progress_lines_surface_as_task_progress() {
    let dir = tempfile::tempdir().unwrap();
    let cli = fake_cli(
        dir.path(),
        "agent-progress.sh",
        "echo \"Progress: 40%\"\nsleep 0.2\necho \"Progress: 90%\"\necho \"Input: 1 tokens\"\necho \"Output: 1 tokens\"",
    );
    let kernel = kernel_with(&cli, dir.path(), 2).await;
    let mut events = kernel.bus.subscribe();

    let task = Task::new("chatty job", "report progress").with_context("user_id", "u1");
    let task_id = kernel.dispatcher.submit(task).await.unwrap();

    wait_for(Duration::from_secs(10), || async {
        let view = kernel.dispatcher.status(&task_id).await?;
        view.status.is_terminal().then_some(view)
    })
    .await
    .expect("chatty task should finish");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let BusEvent::TaskProgress { percent, .. } = event {
            seen.push(percent);
        }
    }
    assert!(seen.contains(&40));
    assert!(seen.contains(&90));

    let view = kernel.dispatcher.status(&task_id).await.unwrap();
    assert_eq!(view.progress, Some(90));

    kernel.shutdown().await;
}

#[tokio::test]
async fn kernel_status_aggregates_the_components() {
    let dir = tempfile::tempdir().unwrap();
    let cli = reporting_cli(dir.path());
    let kernel = kernel_with(&cli, dir.path(), 2).await;

    let task = Task::new("tiny status job", "work").with_context("user_id", "u1");
    let task_id = kernel.dispatcher.submit(task).await.unwrap();
    wait_for(Duration::from_secs(10), || async {
        let view = kernel.dispatcher.status(&task_id).await?;
        view.status.is_terminal().then_some(view)
    })
    .await
    .expect("status job should finish");

    let status = kernel.status().await.unwrap();
    assert!(status.uptime_secs >= 0.0);
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.locks.active_locks, 0);
    assert_eq!(
        status.spawner.by_state.get("completed").copied(),
        Some(1)
    );

    kernel.shutdown().await;
}
