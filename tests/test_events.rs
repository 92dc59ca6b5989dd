/*!
 * Tests for pod-event dispatch: namespace filtering, owner resolution,
 * soft-delete exclusion, and frontend transition events.
 */

use block_orchestrator::orchestrator::Pod;
use block_orchestrator::orchestrator::PodEvent;
use block_orchestrator::orchestrator::PodEventKind;
use block_orchestrator::orchestrator::PodPhase;
use block_orchestrator::reconciler::BlockEvent;
use block_orchestrator::reconciler::BlockOrchestratorTestInterfaces;
use block_orchestrator::sim::SimBackendTestInterfaces;

pub mod common;
use common::bring_up;
use common::provision;
use common::test_setup;

fn make_event(
    kind: PodEventKind,
    uid: &str,
    name: &str,
    namespace: &str,
    phase: PodPhase,
    terminating: bool,
) -> PodEvent {
    PodEvent {
        kind,
        pod: Pod {
            uid: uid.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            node_name: "host-1".to_string(),
            phase,
            pod_ip: None,
            terminating,
        },
    }
}

#[tokio::test]
async fn test_event_for_unknown_pod_is_ignored() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let before = ctx.core.block_lookup(&block.id).await.unwrap();

    let event = make_event(
        PodEventKind::Modified,
        "uid-nobody",
        "somebody-elses-pod",
        "storage",
        PodPhase::Running,
        false,
    );
    ctx.dispatcher.handle_event(&event).await.unwrap();

    let after = ctx.core.block_lookup(&block.id).await.unwrap();
    assert_eq!(before.time_modified, after.time_modified);
    assert!(!after.online);
}

#[tokio::test]
async fn test_event_in_other_namespace_is_ignored() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let controller_uid = block.controller.clone().unwrap();

    /*
     * Same pod handle, wrong namespace: the multiplexer must not even
     * resolve the owner.
     */
    let event = make_event(
        PodEventKind::Modified,
        &controller_uid,
        "v1",
        "elsewhere",
        PodPhase::Running,
        false,
    );
    ctx.dispatcher.handle_event(&event).await.unwrap();

    let after = ctx.core.block_lookup(&block.id).await.unwrap();
    assert!(!after.online);
}

#[tokio::test]
async fn test_soft_deleted_block_excluded_from_dispatch() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let controller_uid = block.controller.clone().unwrap();
    ctx.core.block_deprovision(&block.id).await.unwrap();

    /* a stale event for the deleted block's controller pod is a no-op */
    let event = make_event(
        PodEventKind::Modified,
        &controller_uid,
        "v1",
        "storage",
        PodPhase::Running,
        false,
    );
    ctx.dispatcher.handle_event(&event).await.unwrap();
    assert!(ctx.core.block_lookup(&block.id).await.is_err());
}

#[tokio::test]
async fn test_controller_termination_takes_block_offline() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;
    assert!(block.online && block.mounted);
    ctx.core.events_drain().await;

    let event = ctx.sim.pod_set_terminating("v1").await;
    ctx.dispatcher.handle_event(&event).await.unwrap();

    let block = ctx.core.block_lookup(&block.id).await.unwrap();
    assert!(!block.online);
    assert!(!block.mounted);
    assert!(!block.frontend_state);
    assert!(block.device.is_none());
    common::assert_state_invariant(&block);

    /*
     * The offline transition is entity-state only; no frontend event is
     * emitted without an engine-reported transition.
     */
    assert!(ctx.core.events_drain().await.is_empty());
}

#[tokio::test]
async fn test_frontend_transitions_emit_events_in_order() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;

    /* bring-up produced exactly one up transition */
    assert_eq!(
        ctx.core.events_drain().await,
        vec![BlockEvent::FrontendUp { block_id: block.id }]
    );

    /*
     * Shutting the frontend down emits the down transition and unmounts
     * in the same pass; a second refresh emits nothing new.
     */
    let block = ctx.core.frontend_shutdown(&block.id).await.unwrap();
    assert!(!block.frontend_state);
    assert!(!block.mounted);
    assert_eq!(
        ctx.core.events_drain().await,
        vec![BlockEvent::FrontendDown { block_id: block.id }]
    );

    let block = ctx.core.block_check_pods(&block.id).await.unwrap();
    assert!(!block.frontend_state);
    assert!(ctx.core.events_drain().await.is_empty());
}

#[tokio::test]
async fn test_replica_running_event_is_idempotent() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;
    ctx.sim.exec_log_drain().await;

    /*
     * A duplicate Running event for an already-healthy replica must not
     * re-attach it.
     */
    let replica = block.replicas[0].clone();
    let event = ctx
        .sim
        .pod_set_running(&replica.name, Some("10.0.0.11"))
        .await;
    ctx.dispatcher.handle_event(&event).await.unwrap();

    let exec_log = ctx.sim.exec_log_drain().await;
    assert!(!exec_log
        .iter()
        .any(|(_, argv)| argv.get(1).map(|s| s.as_str())
            == Some("add-replica")));
}
