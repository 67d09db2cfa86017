use pretty_assertions::assert_eq;
use provenant_core::prelude::*;
use provenant_core::ResumeReport;
use provenant_dag::DagStatus;
use provenant_recovery::{ClassifierConfig, RecoveryError};
use provenant_test_utils::{ScriptedRunner, TempState};
use provenant_types::{NodeStatus, StateMap, TracedReference, Value};
use std::sync::Arc;
use std::time::Duration;

fn ids(traced: &[TracedReference]) -> Vec<String> {
    let mut ids: Vec<_> = traced.iter().map(|t| t.reference.id.to_string()).collect();
    ids.sort();
    ids
}

fn fast_config() -> ProvenantConfig {
    ProvenantConfig::new().with_classifier(
        ClassifierConfig::default().with_retry_delays(Duration::ZERO, Duration::ZERO),
    )
}

fn ephemeral(runner: ScriptedRunner) -> (Orchestrator, Arc<ScriptedRunner>) {
    let runner = Arc::new(runner);
    let orchestrator =
        Orchestrator::ephemeral(fast_config(), Arc::clone(&runner) as Arc<dyn StepRunner>)
            .unwrap();
    (orchestrator, runner)
}

fn ingest(d1: &DataReference) -> AnalysisNode {
    AnalysisNode::new(AnalysisType::SourceIngestion, "loader")
        .with_inputs([d1.clone()])
        .with_outputs([d1.clone()])
}

fn extract(d1: &DataReference) -> AnalysisNode {
    AnalysisNode::new(AnalysisType::Extraction, "ner")
        .with_inputs([d1.clone()])
        .with_outputs([DataReference::entity("e1"), DataReference::entity("e2")])
}

fn aggregate() -> AnalysisNode {
    AnalysisNode::new(AnalysisType::Aggregation, "summarise")
        .with_inputs([DataReference::entity("e1"), DataReference::entity("e2")])
        .with_outputs([DataReference::summary("s1")])
}

#[tokio::test]
async fn test_checkpoint_kill_and_resume_without_rerunning() -> anyhow::Result<()> {
    let temp = TempState::new();
    let config = fast_config().with_storage(temp.config.clone());
    let runner = Arc::new(ScriptedRunner::succeeding());
    let d1 = DataReference::document("d1");

    let (dag_id, a, b, checkpoint) = {
        let orchestrator =
            Orchestrator::open(config.clone(), Arc::clone(&runner) as Arc<dyn StepRunner>)?;
        let ctx = orchestrator.start_analysis(vec![d1.clone()]).await?;
        let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await?;
        let b = orchestrator.record_step(&ctx, extract(&d1), &[a]).await?;
        orchestrator.put_state(&ctx, b, "entities", 2_i64)?;
        orchestrator.put_state(&ctx, b, "model", "ner-small")?;
        let checkpoint = orchestrator
            .checkpoint(&ctx, b, CheckpointLevel::DagNode)
            .await?;
        (ctx.dag_id(), a, b, checkpoint)
    };

    let orchestrator = Orchestrator::open(config, Arc::clone(&runner) as Arc<dyn StepRunner>)?;
    let ResumeReport {
        context,
        checkpoint: restored,
        completed,
        pending,
        interrupted,
        ..
    } = orchestrator.resume(dag_id).await?;

    assert_eq!(completed, vec![a, b]);
    assert!(pending.is_empty());
    assert!(interrupted.is_empty());
    let restored = restored.expect("checkpoint restored");
    assert_eq!(restored.checkpoint.id, checkpoint);
    let expected: StateMap = [
        ("entities".to_string(), Value::Int(2)),
        ("model".to_string(), Value::Text("ner-small".to_string())),
    ]
    .into_iter()
    .collect();
    assert_eq!(restored.state, expected);
    assert_eq!(orchestrator.staged_state(&context, b), expected);

    orchestrator.record_step(&context, aggregate(), &[b]).await?;
    let sources = orchestrator.trace(&context, &ElementId::from("s1"), TraceDirection::Backward)?;
    assert_eq!(ids(&sources), vec!["d1"]);
    assert_eq!(runner.call_count(), 0);

    let sealed = orchestrator
        .complete_analysis(context, vec![DataReference::summary("s1")])
        .await?;
    assert!(sealed.is_sealed());
    assert!(orchestrator.active_analyses().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_resume_fails_interrupted_steps() -> anyhow::Result<()> {
    let temp = TempState::new();
    let config = fast_config().with_storage(temp.config.clone());
    let runner: Arc<dyn StepRunner> = Arc::new(ScriptedRunner::succeeding());
    let d1 = DataReference::document("d1");

    let (dag_id, a, b) = {
        let orchestrator = Orchestrator::open(config.clone(), Arc::clone(&runner))?;
        let ctx = orchestrator.start_analysis(vec![d1.clone()]).await?;
        let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await?;
        let b = orchestrator.begin_step(&ctx, extract(&d1), &[a]).await?;
        (ctx.dag_id(), a, b)
    };

    let orchestrator = Orchestrator::open(config, runner)?;
    let report = orchestrator.resume(dag_id).await?;
    assert_eq!(report.completed, vec![a]);
    assert_eq!(report.pending, vec![b]);
    assert_eq!(report.interrupted, vec![b]);
    // only the commit of `a` was checkpointed
    let restored = report.checkpoint.as_ref().expect("commit checkpoint of a");
    assert_eq!(restored.checkpoint.node_id(), a);
    assert!(restored.state.is_empty());
    assert_eq!(
        orchestrator.provenance().get_node(dag_id, b)?.status,
        NodeStatus::Failed
    );

    // The interrupted step recovers through the usual path
    let result = orchestrator
        .on_failure(
            &report.context,
            b,
            StepFailure::network("process restarted"),
            SystemMetrics::default(),
        )
        .await?;
    assert!(result.is_recovered());
    Ok(())
}

#[tokio::test]
async fn test_kill_after_commit_resumes_from_commit_checkpoint() -> anyhow::Result<()> {
    let temp = TempState::new();
    let config = fast_config().with_storage(temp.config.clone());
    let runner = Arc::new(ScriptedRunner::succeeding());
    let d1 = DataReference::document("d1");

    // no explicit checkpoint call before the process goes away
    let (dag_id, a, b, c) = {
        let orchestrator =
            Orchestrator::open(config.clone(), Arc::clone(&runner) as Arc<dyn StepRunner>)?;
        let ctx = orchestrator.start_analysis(vec![d1.clone()]).await?;
        let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await?;
        let b = orchestrator.begin_step(&ctx, extract(&d1), &[a]).await?;
        orchestrator.put_state(&ctx, b, "cursor", 40_i64)?;
        orchestrator.put_partial_result(&ctx, b, "e1", "PERSON")?;
        orchestrator.complete_step(&ctx, b, None).await?;
        let c = orchestrator.begin_step(&ctx, aggregate(), &[b]).await?;
        (ctx.dag_id(), a, b, c)
    };

    let orchestrator = Orchestrator::open(config, Arc::clone(&runner) as Arc<dyn StepRunner>)?;
    let report = orchestrator.resume(dag_id).await?;
    assert_eq!(report.completed, vec![a, b]);
    assert_eq!(report.interrupted, vec![c]);

    let restored = report.checkpoint.as_ref().expect("commit checkpoint");
    assert_eq!(restored.checkpoint.node_id(), b);
    assert_eq!(restored.checkpoint.level(), CheckpointLevel::DagNode);
    let cursor: StateMap = [("cursor".to_string(), Value::Int(40))].into_iter().collect();
    let entities: StateMap = [("e1".to_string(), Value::Text("PERSON".to_string()))]
        .into_iter()
        .collect();
    assert_eq!(report.restored_state(), Some(&cursor));
    assert_eq!(report.restored_partial_results(), Some(&entities));
    assert_eq!(orchestrator.staged_state(&report.context, b), cursor);
    assert_eq!(orchestrator.staged_partial_results(&report.context, b), entities);
    assert_eq!(runner.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_commit_checkpoints_can_be_turned_off() {
    let config = fast_config()
        .with_checkpoint(CheckpointConfig::default().with_checkpoint_on_commit(None));
    let orchestrator =
        Orchestrator::ephemeral(config, Arc::new(ScriptedRunner::succeeding())).unwrap();
    let d1 = DataReference::document("d1");
    let ctx = orchestrator.start_analysis(vec![d1.clone()]).await.unwrap();
    let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await.unwrap();
    orchestrator.record_step(&ctx, extract(&d1), &[a]).await.unwrap();

    let listed = orchestrator
        .checkpoints()
        .list_checkpoints(ctx.dag_id())
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn test_two_phase_step_hides_outputs_until_complete() {
    let (orchestrator, _) = ephemeral(ScriptedRunner::succeeding());
    let d1 = DataReference::document("d1");
    let ctx = orchestrator.start_analysis(vec![d1.clone()]).await.unwrap();
    let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await.unwrap();
    let b = orchestrator.begin_step(&ctx, extract(&d1), &[a]).await.unwrap();

    let derived = orchestrator
        .trace(&ctx, &ElementId::from("d1"), TraceDirection::Forward)
        .unwrap();
    assert!(ids(&derived).is_empty());

    let node = orchestrator
        .complete_step(&ctx, b, Some(vec![DataReference::entity("e9")]))
        .await
        .unwrap();
    assert_eq!(node.status, NodeStatus::Committed);
    let derived = orchestrator
        .trace(&ctx, &ElementId::from("d1"), TraceDirection::Forward)
        .unwrap();
    assert_eq!(ids(&derived), vec!["e9"]);
}

#[tokio::test]
async fn test_put_state_requires_a_registered_step() {
    let (orchestrator, _) = ephemeral(ScriptedRunner::succeeding());
    let ctx = orchestrator
        .start_analysis(vec![DataReference::document("d1")])
        .await
        .unwrap();
    let err = orchestrator
        .put_state(&ctx, NodeId::new(), "k", 1_i64)
        .unwrap_err();
    assert!(matches!(err, CoreError::Provenance(_)));
}

#[tokio::test]
async fn test_failed_rollback_pauses_then_resumes_with_state() {
    let (orchestrator, runner) =
        ephemeral(ScriptedRunner::failing(StepFailure::network("reset"), 1));
    let d1 = DataReference::document("d1");
    let ctx = orchestrator.start_analysis(vec![d1.clone()]).await.unwrap();
    let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await.unwrap();
    orchestrator.put_state(&ctx, a, "rows", 10_i64).unwrap();
    let checkpoint = orchestrator
        .checkpoint(&ctx, a, CheckpointLevel::DagNode)
        .await
        .unwrap();
    let b = orchestrator.begin_step(&ctx, extract(&d1), &[a]).await.unwrap();

    // Rollback re-runs `b` from the checkpoint of `a`, fails, and falls back to manual
    let paused = orchestrator
        .on_failure(
            &ctx,
            b,
            StepFailure::new(provenant_types::FailureKind::OutOfMemory, "oom"),
            SystemMetrics::default(),
        )
        .await
        .unwrap();
    assert!(paused.is_paused());
    assert_eq!(paused.attempts.len(), 2);
    assert_eq!(runner.call_count(), 1);
    assert_eq!(ctx.failure_count(b), 1);
    assert_eq!(orchestrator.engine().awaiting_manual(ctx.dag_id()).len(), 1);

    let resumed = orchestrator.resume_manual(&ctx, checkpoint).await.unwrap();
    assert!(resumed.is_recovered());
    assert_eq!(
        orchestrator.staged_state(&ctx, b).get("rows"),
        Some(&Value::Int(10))
    );
}

#[tokio::test]
async fn test_exhausted_recovery_is_terminal() {
    let (orchestrator, _) = ephemeral(ScriptedRunner::failing(StepFailure::network("down"), 10));
    let d1 = DataReference::document("d1");
    let ctx = orchestrator.start_analysis(vec![d1.clone()]).await.unwrap();
    let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await.unwrap();
    let checkpoint = orchestrator
        .checkpoint(&ctx, a, CheckpointLevel::DagNode)
        .await
        .unwrap();
    let b = orchestrator.begin_step(&ctx, extract(&d1), &[a]).await.unwrap();

    let err = orchestrator
        .on_failure(&ctx, b, StepFailure::network("down"), SystemMetrics::default())
        .await
        .unwrap_err();

    let terminal = err.terminal_context().expect("terminal context");
    assert_eq!(terminal.dag_id, ctx.dag_id());
    assert_eq!(terminal.node_id, b);
    assert_eq!(terminal.category, provenant_types::FailureCategory::NetworkFailure);
    assert_eq!(terminal.checkpoint_id, Some(checkpoint));
    assert_eq!(err.attempts().len(), 1);
    assert_eq!(err.attempts()[0].invocations, 3);
    assert_eq!(
        orchestrator.provenance().snapshot(ctx.dag_id()).unwrap().status(),
        DagStatus::Failed
    );
}

#[tokio::test]
async fn test_manual_resume_through_facade() {
    let (orchestrator, runner) = ephemeral(ScriptedRunner::succeeding());
    let d1 = DataReference::document("d1");
    let ctx = orchestrator.start_analysis(vec![d1.clone()]).await.unwrap();
    let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await.unwrap();
    orchestrator.put_state(&ctx, a, "offset", 7_i64).unwrap();
    let checkpoint = orchestrator
        .checkpoint(&ctx, a, CheckpointLevel::DagNode)
        .await
        .unwrap();
    let b = orchestrator.begin_step(&ctx, extract(&d1), &[a]).await.unwrap();

    let paused = orchestrator
        .on_failure(
            &ctx,
            b,
            StepFailure::new(provenant_types::FailureKind::Validation, "bad schema"),
            SystemMetrics::default(),
        )
        .await
        .unwrap();
    assert!(paused.is_paused());
    assert_eq!(runner.call_count(), 0);

    let resumed = orchestrator.resume_manual(&ctx, checkpoint).await.unwrap();
    assert!(resumed.is_recovered());
    assert_eq!(
        orchestrator.staged_state(&ctx, b).get("offset"),
        Some(&Value::Int(7))
    );
}

#[tokio::test]
async fn test_cancel_recovery_restores_node() {
    let runner = Arc::new(ScriptedRunner::succeeding().with_delay(Duration::from_secs(30)));
    let orchestrator = Arc::new(
        Orchestrator::ephemeral(fast_config(), Arc::clone(&runner) as Arc<dyn StepRunner>)
            .unwrap(),
    );
    let d1 = DataReference::document("d1");
    let ctx = orchestrator.start_analysis(vec![d1.clone()]).await.unwrap();
    let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await.unwrap();
    let b = orchestrator.begin_step(&ctx, extract(&d1), &[a]).await.unwrap();

    let canceller = Arc::clone(&orchestrator);
    let remote = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel_recovery(&remote);
    });

    let err = orchestrator
        .on_failure(&ctx, b, StepFailure::network("reset"), SystemMetrics::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Recovery(RecoveryError::Cancelled { .. })));
    assert_eq!(
        orchestrator.provenance().get_node(ctx.dag_id(), b).unwrap().status,
        NodeStatus::Failed
    );
    assert_eq!(
        orchestrator.provenance().snapshot(ctx.dag_id()).unwrap().status(),
        DagStatus::Running
    );
}

#[tokio::test]
async fn test_completed_context_is_inactive() {
    let (orchestrator, _) = ephemeral(ScriptedRunner::succeeding());
    let d1 = DataReference::document("d1");
    let ctx = orchestrator.start_analysis(vec![d1.clone()]).await.unwrap();
    let stale = ctx.clone();
    orchestrator.record_step(&ctx, ingest(&d1), &[]).await.unwrap();
    orchestrator.complete_analysis(ctx, vec![d1.clone()]).await.unwrap();
    assert_eq!(orchestrator.checkpoints().cached_entries().await, (0, 0, 0));

    let err = orchestrator
        .record_step(&stale, extract(&d1), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InactiveAnalysis(id) if id == stale.dag_id()));
}

#[tokio::test]
async fn test_abandoned_analysis_releases_state_but_stays_resumable() {
    let (orchestrator, _) = ephemeral(ScriptedRunner::succeeding());
    let d1 = DataReference::document("d1");
    let ctx = orchestrator.start_analysis(vec![d1.clone()]).await.unwrap();
    let dag_id = ctx.dag_id();
    let a = orchestrator.record_step(&ctx, ingest(&d1), &[]).await.unwrap();
    orchestrator.put_state(&ctx, a, "rows", 3_i64).unwrap();
    let checkpoint = orchestrator
        .checkpoint(&ctx, a, CheckpointLevel::DagNode)
        .await
        .unwrap();
    let (catalogs, locks, _) = orchestrator.checkpoints().cached_entries().await;
    assert_eq!((catalogs, locks), (1, 1));

    let stale = ctx.clone();
    let dag = orchestrator.abandon_analysis(ctx).await.unwrap();
    assert_eq!(dag.status(), DagStatus::Failed);
    assert!(orchestrator.active_analyses().is_empty());
    assert!(orchestrator.staged_state(&stale, a).is_empty());
    assert_eq!(orchestrator.checkpoints().cached_entries().await, (0, 0, 0));

    let report = orchestrator.resume(dag_id).await.unwrap();
    assert_eq!(report.checkpoint.as_ref().map(|c| c.checkpoint.id), Some(checkpoint));
    assert_eq!(
        orchestrator.staged_state(&report.context, a).get("rows"),
        Some(&Value::Int(3))
    );
}

#[test]
fn test_invalid_rate_limit_pattern_is_rejected() {
    let config = ProvenantConfig::new()
        .with_classifier(ClassifierConfig::default().with_rate_limit_pattern("(oops"));
    let err = tokio_test::assert_err!(Orchestrator::ephemeral(
        config,
        Arc::new(ScriptedRunner::succeeding())
    ));
    assert!(matches!(err, CoreError::Recovery(RecoveryError::InvalidPattern(_))));
}
