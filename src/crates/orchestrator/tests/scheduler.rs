mod common;

use common::{count_events, orchestrator, start, AGENTS};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

use task_orchestrator::events::EventKind;
use task_orchestrator::executor::{EchoExecutor, ExecutorRegistry};
use task_orchestrator::model::{AgentType, StepStatus, Task, TaskStep};
use task_orchestrator::scheduler::{compute_ready_steps, validate_plan};
use task_orchestrator::state_machine::TransitionUpdates;
use task_orchestrator::{NewTask, OrchestratorError, TaskStatus};

fn diamond() -> Vec<TaskStep> {
    vec![
        TaskStep::new("a", "Collect", AgentType::Research).with_inputs(json!({"topic": "rust"})),
        TaskStep::new("b", "Draft intro", AgentType::Writer)
            .depends_on(["a"])
            .with_inputs(json!({"about": "{{a.topic}}"})),
        TaskStep::new("c", "Draft body", AgentType::Writer)
            .depends_on(["a"])
            .with_inputs(json!({"about": "{{a.output.topic}}"})),
        TaskStep::new("d", "Review", AgentType::Analyst)
            .depends_on(["b", "c"])
            .with_inputs(json!({"intro": "{{b.output}}", "summary": "intro on {{b.about}}"})),
    ]
}

#[tokio::test]
async fn test_only_roots_dispatch_first() {
    let (orch, exec) = orchestrator().await;
    let task = start(&orch, diamond()).await;

    let statuses: Vec<StepStatus> = task.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Running,
            StepStatus::Pending,
            StepStatus::Pending,
            StepStatus::Pending
        ]
    );
    assert!(exec.calls().is_empty());
    assert_eq!(count_events(&orch, &task.id, "step_dispatched"), 1);
}

#[tokio::test]
async fn test_diamond_runs_to_completion_with_resolved_inputs() {
    let (orch, exec) = orchestrator().await;
    let task = start(&orch, diamond()).await;
    assert_eq!(orch.drain_queue().await.unwrap(), 4);

    let done = orch.get_task(&task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.step("b").unwrap().output, Some(json!({"about": "rust"})));
    assert_eq!(done.step("c").unwrap().output, Some(json!({"about": "rust"})));
    assert_eq!(
        done.step("d").unwrap().output,
        Some(json!({"intro": {"about": "rust"}, "summary": "intro on rust"}))
    );

    let order: Vec<String> = exec.calls().into_iter().map(|(id, _)| id).collect();
    assert_eq!(order.first().map(String::as_str), Some("a"));
    assert_eq!(order.last().map(String::as_str), Some("d"));
}

#[tokio::test]
async fn test_siblings_share_an_auto_group() {
    let (orch, _) = orchestrator().await;
    let task = start(&orch, diamond()).await;
    orch.drain_queue().await.unwrap();

    let groups: Vec<(String, Option<String>)> = orch
        .replay_events(&task.id, None)
        .into_iter()
        .filter_map(|event| match event.event {
            EventKind::StepDispatched {
                step_id,
                parallel_group,
                ..
            } => Some((step_id, parallel_group)),
            _ => None,
        })
        .collect();

    let group_of = |id: &str| {
        groups
            .iter()
            .find(|(step, _)| step == id)
            .and_then(|(_, group)| group.clone())
    };
    assert_eq!(group_of("a"), None);
    assert_eq!(group_of("b"), Some("auto-writer-1".to_string()));
    assert_eq!(group_of("b"), group_of("c"));
}

#[tokio::test]
async fn test_concurrent_passes_never_double_dispatch() {
    let (orch, _) = orchestrator().await;
    let roots: Vec<TaskStep> = (0..5)
        .map(|i| TaskStep::new(format!("r{i}"), format!("Root {i}"), AgentType::Research))
        .collect();
    let task = orch
        .create_task(NewTask::new("org", "user", "fan out").with_steps(roots))
        .await
        .unwrap();
    orch.submit_plan(&task.id, Vec::new()).await.unwrap();
    orch.state_machine()
        .transition(&task.id, TaskStatus::Executing, TransitionUpdates::default())
        .await
        .unwrap();

    let scheduler = orch.scheduler();
    let passes = (0..8).map(|_| scheduler.schedule_ready_nodes(&task.id));
    let dispatched: usize = futures::future::join_all(passes)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .sum();

    assert_eq!(dispatched, 5);
    assert_eq!(count_events(&orch, &task.id, "step_dispatched"), 5);
    assert_eq!(orch.drain_queue().await.unwrap(), 5);
    assert_eq!(
        orch.get_task(&task.id).await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_duplicate_result_is_ignored() {
    let (orch, _) = orchestrator().await;
    let task = start(&orch, vec![TaskStep::new("a", "A", AgentType::Research)]).await;
    orch.drain_queue().await.unwrap();
    let done = orch.get_task(&task.id).await.unwrap();

    orch.handle_step_result(&task.id, "a", Ok(json!({"late": true})))
        .await
        .unwrap();
    let after = orch.get_task(&task.id).await.unwrap();
    assert_eq!(after.version, done.version);
    assert_eq!(after.step("a").unwrap().output, done.step("a").unwrap().output);
}

#[tokio::test]
async fn test_cancel_discards_in_flight_result() {
    let (orch, exec) = orchestrator().await;
    let task = start(
        &orch,
        vec![
            TaskStep::new("a", "A", AgentType::Research),
            TaskStep::new("b", "B", AgentType::Writer).depends_on(["a"]),
        ],
    )
    .await;

    // a is running, so cancellation waits for the next checkpoint
    let requested = orch.request_cancel(&task.id).await.unwrap();
    assert_eq!(requested.status, TaskStatus::Executing);

    orch.drain_queue().await.unwrap();
    let cancelled = orch.get_task(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.step("b").unwrap().status, StepStatus::Pending);
    assert!(exec.calls_for("b").is_empty());
    assert_eq!(count_events(&orch, &task.id, "task_cancelled"), 1);
}

#[tokio::test]
async fn test_plan_with_cycle_is_rejected() {
    let (orch, _) = orchestrator().await;
    let task = orch
        .create_task(NewTask::new("org", "user", "goal"))
        .await
        .unwrap();
    let steps = vec![
        TaskStep::new("a", "A", AgentType::Research).depends_on(["b"]),
        TaskStep::new("b", "B", AgentType::Research).depends_on(["a"]),
    ];
    let err = orch.submit_plan(&task.id, steps).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PlanValidation(_)));
}

#[tokio::test]
async fn test_template_outside_dependencies_is_rejected() {
    let (orch, _) = orchestrator().await;
    let task = orch
        .create_task(NewTask::new("org", "user", "goal"))
        .await
        .unwrap();
    let steps = vec![
        TaskStep::new("a", "A", AgentType::Research),
        TaskStep::new("b", "B", AgentType::Writer).with_inputs(json!({"x": "{{a.output}}"})),
    ];
    let err = orch.submit_plan(&task.id, steps).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PlanValidation(_)), "{err}");
}

fn echo_registry() -> ExecutorRegistry {
    AGENTS.into_iter().fold(ExecutorRegistry::new(), |registry, agent| {
        registry.with(agent, Arc::new(EchoExecutor))
    })
}

/// Random DAG: step i may depend on any step j < i
fn arb_dag() -> impl Strategy<Value = Vec<(Vec<usize>, StepStatus)>> {
    (1usize..12).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                (
                    proptest::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i),
                    prop_oneof![
                        Just(StepStatus::Pending),
                        Just(StepStatus::Running),
                        Just(StepStatus::Completed),
                        Just(StepStatus::Skipped),
                    ],
                )
            })
            .collect::<Vec<_>>()
    })
}

fn build(spec: &[(Vec<usize>, StepStatus)]) -> Vec<TaskStep> {
    spec.iter()
        .enumerate()
        .map(|(i, (deps, status))| {
            let mut step = TaskStep::new(format!("s{i}"), format!("Step {i}"), AGENTS[i % AGENTS.len()].clone())
                .depends_on(deps.iter().map(|d| format!("s{d}")));
            step.status = *status;
            step
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_forward_dags_validate(spec in arb_dag()) {
        let mut steps = build(&spec);
        for step in &mut steps {
            step.status = StepStatus::Pending;
        }
        prop_assert!(validate_plan(&mut steps, &echo_registry()).is_ok());
    }

    #[test]
    fn prop_back_edge_creates_rejected_cycle(spec in arb_dag()) {
        let mut steps = build(&spec);
        let n = steps.len();
        prop_assume!(n >= 2);
        steps[n - 1].dependencies.insert("s0".to_string());
        steps[0].dependencies.insert(format!("s{}", n - 1));
        let result = validate_plan(&mut steps, &echo_registry());
        prop_assert!(matches!(result, Err(OrchestratorError::PlanValidation(_))));
    }

    #[test]
    fn prop_ready_set_is_exact(spec in arb_dag()) {
        let task = Task::new("org", "user", "goal").with_steps(build(&spec));
        let ready: BTreeSet<String> = compute_ready_steps(&task)
            .into_iter()
            .map(|s| s.id.clone())
            .collect();

        for step in &task.steps {
            let deps_done = step.dependencies.iter().all(|d| {
                matches!(
                    task.step(d).map(|s| s.status),
                    Some(StepStatus::Completed) | Some(StepStatus::Skipped)
                )
            });
            let expected = step.status == StepStatus::Pending && deps_done;
            prop_assert_eq!(ready.contains(&step.id), expected, "step {}", step.id);
        }
    }
}
