mod common;

use chrono::{Duration, Utc};
use common::{count_events, orchestrator, start};
use common::ScriptedExecutor;
use serde_json::json;
use std::collections::HashSet;

use task_orchestrator::automation::TickOutcome;
use task_orchestrator::cache::{keys, CacheStore};
use task_orchestrator::executor::StepFailure;
use task_orchestrator::model::{AgentType, StepStatus, TaskStep};
use task_orchestrator::{NewAutomation, Orchestrator, OrchestratorError, Task, TaskStatus};

fn template_steps() -> Vec<TaskStep> {
    vec![
        TaskStep::new("gather", "Gather metrics", AgentType::Research)
            .with_inputs(json!({"window": "24h"})),
        TaskStep::new("analyze", "Analyze metrics", AgentType::Analyst)
            .depends_on(["gather"])
            .with_inputs(json!({"data": "{{gather.output}}"})),
        TaskStep::new("report", "Daily report", AgentType::Writer)
            .depends_on(["analyze"])
            .with_inputs(json!({"summary": "{{analyze.data}}"})),
    ]
}

async fn finished_template(orch: &Orchestrator) -> Task {
    let task = start(orch, template_steps()).await;
    orch.drain_queue().await.unwrap();
    let task = orch.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    task
}

fn fired_task(outcomes: &[TickOutcome]) -> String {
    match outcomes {
        [TickOutcome::Fired { task_id, .. }] => task_id.clone(),
        other => panic!("expected one fired automation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_schedules_are_rejected_at_creation() {
    let (orch, _) = orchestrator().await;
    let template = finished_template(&orch).await;

    let bad_cron = NewAutomation::recurring("bad", &template.id, "user-1", "org-1", "sometimes");
    let err = orch.create_automation(bad_cron).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AutomationSchedule(_)));
    assert!(err.is_client_error());

    let bad_tz = NewAutomation::recurring("tz", &template.id, "user-1", "org-1", "0 9 * * *")
        .in_timezone("Atlantis/Lost_City");
    assert!(matches!(
        orch.create_automation(bad_tz).await,
        Err(OrchestratorError::AutomationSchedule(_))
    ));

    let missing = NewAutomation::recurring("missing", "no-such-task", "user-1", "org-1", "0 9 * * *");
    assert!(matches!(
        orch.create_automation(missing).await,
        Err(OrchestratorError::AutomationSchedule(_))
    ));
}

#[tokio::test]
async fn test_recurring_automation_computes_next_run() {
    let (orch, _) = orchestrator().await;
    let template = finished_template(&orch).await;

    let automation = orch
        .create_automation(NewAutomation::recurring(
            "hourly",
            &template.id,
            "user-1",
            "org-1",
            "0 * * * *",
        ))
        .await
        .unwrap();

    let next = automation.next_run_at.unwrap();
    assert!(next > Utc::now() - Duration::seconds(1));
    assert!(next <= Utc::now() + Duration::hours(1));
    assert!(automation.enabled);
    assert_eq!(
        orch.list_automations("org-1").await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_materialized_runs_have_fresh_step_ids() {
    let (orch, _) = orchestrator().await;
    let template = finished_template(&orch).await;
    let automation = orch
        .create_automation(NewAutomation::once(
            "once",
            &template.id,
            "user-1",
            "org-1",
            Utc::now() - Duration::seconds(1),
        ))
        .await
        .unwrap();

    let first = orch.automations().materialize(&automation).await.unwrap();
    let second = orch.automations().materialize(&automation).await.unwrap();

    for run in [&first, &second] {
        assert_eq!(run.status, TaskStatus::Ready);
        assert_eq!(run.automation_id.as_deref(), Some(automation.id.as_str()));
        assert_eq!(run.steps.len(), 3);
        assert!(run.steps.iter().all(|s| s.output.is_none()));
    }

    let ids = |task: &Task| task.steps.iter().map(|s| s.id.clone()).collect::<HashSet<_>>();
    assert!(ids(&first).is_disjoint(&ids(&second)));
    assert!(ids(&first).is_disjoint(&ids(&template)));

    for (a, b) in first.steps.iter().zip(&second.steps) {
        assert_eq!(a.agent_type, b.agent_type);
        assert_eq!(
            a.inputs.as_object().map(|o| o.keys().cloned().collect::<Vec<_>>()),
            b.inputs.as_object().map(|o| o.keys().cloned().collect::<Vec<_>>()),
        );
    }

    // references follow the new ids
    let analyze = &first.steps[1];
    assert!(analyze.dependencies.contains(&first.steps[0].id));
    assert_eq!(
        analyze.inputs["data"],
        json!(format!("{{{{{}.output}}}}", first.steps[0].id))
    );
}

#[tokio::test]
async fn test_one_shot_fires_once_and_runs() {
    let (orch, exec) = orchestrator().await;
    let template = finished_template(&orch).await;
    let automation = orch
        .create_automation(NewAutomation::once(
            "once",
            &template.id,
            "user-1",
            "org-1",
            Utc::now() - Duration::seconds(1),
        ))
        .await
        .unwrap();

    let outcomes = orch.poll_automations(Utc::now()).await.unwrap();
    let run_id = fired_task(&outcomes);
    orch.drain_queue().await.unwrap();

    let run = orch.get_task(&run_id).await.unwrap();
    assert_eq!(run.status, TaskStatus::Completed);
    assert_eq!(run.parent_task_id.as_deref(), Some(template.id.as_str()));
    assert_eq!(exec.calls().len(), 6);
    assert_eq!(count_events(&orch, &run_id, "automation_triggered"), 1);

    let after = orch.get_automation(&automation.id).await.unwrap();
    assert!(!after.enabled);
    assert_eq!(after.next_run_at, None);
    assert_eq!(after.last_task_id.as_deref(), Some(run_id.as_str()));

    assert!(orch.poll_automations(Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_running_previous_run_is_skipped_not_doubled() {
    let (orch, _) = orchestrator().await;
    let template = finished_template(&orch).await;
    let automation = orch
        .create_automation(NewAutomation::recurring(
            "every minute",
            &template.id,
            "user-1",
            "org-1",
            "* * * * *",
        ))
        .await
        .unwrap();

    let first_tick = automation.next_run_at.unwrap() + Duration::seconds(1);
    let outcomes = orch.poll_automations(first_tick).await.unwrap();
    let run_id = fired_task(&outcomes);

    // the first run is still executing: its root step sits in the queue
    let second_tick = first_tick + Duration::minutes(2);
    let outcomes = orch.poll_automations(second_tick).await.unwrap();
    assert_eq!(
        outcomes,
        vec![TickOutcome::Skipped {
            automation_id: automation.id.clone(),
            running_task_id: run_id.clone(),
        }]
    );
    assert_eq!(count_events(&orch, &run_id, "automation_skipped"), 1);

    let after = orch.get_automation(&automation.id).await.unwrap();
    assert!(after.next_run_at.unwrap() > second_tick);
    assert_eq!(after.last_task_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(
        orch.store()
            .list_by_automation(&automation.id)
            .await
            .unwrap()
            .len(),
        1
    );

    // once the run finishes the next tick fires again
    orch.drain_queue().await.unwrap();
    let third_tick = after.next_run_at.unwrap() + Duration::seconds(1);
    let outcomes = orch.poll_automations(third_tick).await.unwrap();
    assert_ne!(fired_task(&outcomes), run_id);
}

#[tokio::test]
async fn test_held_lock_prevents_double_fire() {
    let (orch, _) = orchestrator().await;
    let template = finished_template(&orch).await;
    let automation = orch
        .create_automation(NewAutomation::once(
            "once",
            &template.id,
            "user-1",
            "org-1",
            Utc::now() - Duration::seconds(1),
        ))
        .await
        .unwrap();

    let cache = orch.store().cache().clone();
    cache
        .set(
            &keys::automation_lock(&automation.id),
            "other-poller".to_string(),
            Some(std::time::Duration::from_secs(60)),
        )
        .await
        .unwrap();

    let outcomes = orch.poll_automations(Utc::now()).await.unwrap();
    assert_eq!(
        outcomes,
        vec![TickOutcome::NotFired {
            automation_id: automation.id.clone(),
        }]
    );
    assert!(orch.get_automation(&automation.id).await.unwrap().enabled);
}

#[tokio::test]
async fn test_disable_and_reenable() {
    let (orch, _) = orchestrator().await;
    let template = finished_template(&orch).await;
    let automation = orch
        .create_automation(NewAutomation::recurring(
            "daily",
            &template.id,
            "user-1",
            "org-1",
            "0 6 * * *",
        ))
        .await
        .unwrap();

    let disabled = orch
        .set_automation_enabled(&automation.id, false)
        .await
        .unwrap();
    assert!(!disabled.enabled);
    let far_future = Utc::now() + Duration::days(3);
    assert!(orch.poll_automations(far_future).await.unwrap().is_empty());

    let enabled = orch
        .set_automation_enabled(&automation.id, true)
        .await
        .unwrap();
    assert!(enabled.enabled);
    assert!(enabled.next_run_at.unwrap() > Utc::now());
}

fn by_name<'a>(task: &'a Task, name: &str) -> &'a TaskStep {
    task.steps.iter().find(|s| s.name == name).unwrap()
}

async fn minutely(orch: &Orchestrator, template: &Task) -> task_orchestrator::Automation {
    orch.create_automation(NewAutomation::recurring(
        "every minute",
        &template.id,
        "user-1",
        "org-1",
        "* * * * *",
    ))
    .await
    .unwrap()
}

async fn fallback_template(orch: &Orchestrator, exec: &ScriptedExecutor) -> Task {
    exec.fail("primary", vec![StepFailure::unavailable("primary index down")]);
    exec.respond("backup", json!({"hits": 4}));
    let steps = vec![
        TaskStep::new("seed", "Seed", AgentType::Research),
        TaskStep::new("primary", "Search primary", AgentType::Integration)
            .depends_on(["seed"])
            .with_fallback("backup"),
        TaskStep::new("backup", "Search backup", AgentType::Research),
        TaskStep::new("report", "Report", AgentType::Writer)
            .depends_on(["primary"])
            .with_inputs(json!({"count": "{{primary.hits}}"})),
    ];
    let task = start(orch, steps).await;
    orch.drain_queue().await.unwrap();
    let task = orch.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.step("report").unwrap().dependencies.contains("backup"));
    task
}

#[tokio::test]
async fn test_template_that_used_its_fallback_still_fires() {
    let (orch, exec) = orchestrator().await;
    let template = fallback_template(&orch, &exec).await;
    let automation = minutely(&orch, &template).await;

    let tick = automation.next_run_at.unwrap() + Duration::seconds(1);
    let run_id = fired_task(&orch.poll_automations(tick).await.unwrap());
    orch.drain_queue().await.unwrap();

    let run = orch.get_task(&run_id).await.unwrap();
    assert_eq!(run.status, TaskStatus::Completed);

    // the run follows the plan as written: primary feeds the report again
    let primary = by_name(&run, "Search primary");
    let backup = by_name(&run, "Search backup");
    let report = by_name(&run, "Report");
    assert_eq!(primary.status, StepStatus::Completed);
    assert_eq!(backup.status, StepStatus::Skipped);
    assert!(backup.dependencies.is_empty());
    assert!(report.dependencies.contains(&primary.id));
    assert!(!report.dependencies.contains(&backup.id));
    assert!(run.modifications.is_empty());
}

#[tokio::test]
async fn test_run_that_never_started_does_not_block_later_ticks() {
    let (orch, _) = orchestrator().await;
    let template = finished_template(&orch).await;
    let automation = minutely(&orch, &template).await;

    // fired without being started, as when start_task fails
    let first_tick = automation.next_run_at.unwrap() + Duration::seconds(1);
    let stranded = fired_task(&orch.automations().tick(first_tick).await.unwrap());
    assert_eq!(
        orch.get_task(&stranded).await.unwrap().status,
        TaskStatus::Ready
    );

    let second_tick = first_tick + Duration::minutes(2);
    let run_id = fired_task(&orch.poll_automations(second_tick).await.unwrap());
    assert_ne!(run_id, stranded);

    let abandoned = orch.get_task(&stranded).await.unwrap();
    assert_eq!(abandoned.status, TaskStatus::Failed);
    assert!(abandoned.error.unwrap().contains("never started"));

    orch.drain_queue().await.unwrap();
    assert_eq!(
        orch.get_task(&run_id).await.unwrap().status,
        TaskStatus::Completed
    );
    assert!(!orch.automations().abandon_run(&run_id, "late").await.unwrap());
}
