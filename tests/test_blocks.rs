/*!
 * End-to-end tests for the block lifecycle, driven against the simulated
 * substrate: provision, pod bring-up, format/mount, replica loss and
 * rebalance, snapshots, and deprovisioning.
 */

use block_orchestrator::api_error::ApiError;
use block_orchestrator::api_model::BlockStatus;
use block_orchestrator::api_model::ControllerOptions;
use block_orchestrator::api_model::FormatOptions;
use block_orchestrator::api_model::Locality;
use block_orchestrator::api_model::ReplicaStatus;
use block_orchestrator::reconciler::BlockEvent;
use block_orchestrator::reconciler::BlockOrchestratorTestInterfaces;
use block_orchestrator::sim::SimBackendTestInterfaces;

pub mod common;
use common::assert_state_invariant;
use common::bring_up;
use common::provision;
use common::test_setup;

fn argv_of<'a>(
    log: &'a [(String, Vec<String>)],
    subcommand: &str,
) -> Vec<&'a Vec<String>> {
    log.iter()
        .filter(|(_, argv)| argv.get(1).map(|s| s.as_str()) == Some(subcommand))
        .map(|(_, argv)| argv)
        .collect()
}

#[tokio::test]
async fn test_provision_then_mount() {
    let ctx = test_setup(4);

    /*
     * Provision: the entity exists, the controller pod handle is recorded,
     * and three pending replicas were placed on distinct disks.
     */
    let block = provision(&ctx, "v1", 3).await;
    assert_eq!(block.name.as_str(), "v1");
    assert_eq!(block.size.to_gib(), 10);
    assert_eq!(block.replica_count, 3);
    assert!(block.controller.is_some());
    assert_eq!(block.replicas.len(), 3);
    for replica in &block.replicas {
        assert_eq!(replica.status, ReplicaStatus::Pending);
        assert!(!replica.healthy);
        assert!(!replica.attached);
        assert!(replica.endpoint.is_none());
        assert!(replica.name.starts_with("block-replica-v1-"));
    }
    assert!(!block.online);
    assert_eq!(block.status(), BlockStatus::Pending);
    assert_state_invariant(&block);

    /*
     * Replica pods come up first: each becomes healthy with its endpoint
     * derived from the pod ip, but cannot attach while the block is
     * offline.
     */
    let block = bring_up(&ctx, &block).await;

    assert!(block.online);
    assert!(block.frontend_state);
    assert!(block.formatted);
    assert!(block.mounted);
    assert!(block.healthy);
    assert_eq!(block.status(), BlockStatus::Healthy);
    assert_eq!(block.locality, Locality::Local);
    assert_eq!(block.device.as_deref(), Some("/dev/longhorn/v1"));
    assert_state_invariant(&block);
    for (i, replica) in block.replicas.iter().enumerate() {
        assert!(replica.healthy);
        assert!(replica.attached);
        assert_eq!(
            replica.endpoint.as_deref(),
            Some(format!("tcp://10.0.0.{}:10000", 11 + i).as_str())
        );
    }

    /*
     * The engine saw one add-replica per replica, with the full argv
     * shape.
     */
    let exec_log = ctx.sim.exec_log_drain().await;
    let adds = argv_of(&exec_log, "add-replica");
    assert_eq!(adds.len(), 3);
    assert_eq!(
        adds[0],
        &vec![
            "longhorn".to_string(),
            "add-replica".to_string(),
            "--replica-instance-name".to_string(),
            block.replicas[0].name.clone(),
            "--size".to_string(),
            "10gb".to_string(),
            "--current-size".to_string(),
            "10gb".to_string(),
            "tcp://10.0.0.11:10000".to_string(),
        ]
    );
    let endpoints: Vec<&str> =
        adds.iter().map(|argv| argv.last().unwrap().as_str()).collect();
    assert_eq!(
        endpoints,
        vec![
            "tcp://10.0.0.11:10000",
            "tcp://10.0.0.12:10000",
            "tcp://10.0.0.13:10000",
        ]
    );
    assert_eq!(
        ctx.sim.engine_replicas("v1").await,
        vec![
            "tcp://10.0.0.11:10000",
            "tcp://10.0.0.12:10000",
            "tcp://10.0.0.13:10000",
        ]
    );

    /*
     * The device was formatted and mounted on the preferred node, in that
     * order.
     */
    let terminal_log = ctx.sim.terminal_log_drain().await;
    let mount_path = block.mount_point.as_ref().unwrap().path.clone();
    let expected_mkfs: Vec<String> =
        ["mkfs", "-t", "ext4", "-m", "0", "-L", "v1", "/dev/longhorn/v1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
    let expected_mount: Vec<String> =
        vec!["mount".to_string(), "/dev/longhorn/v1".to_string(), mount_path];
    let mkfs_index = terminal_log
        .iter()
        .position(|(node, argv)| node == "n-1" && *argv == expected_mkfs)
        .expect("expected an mkfs invocation");
    let mount_index = terminal_log
        .iter()
        .position(|(node, argv)| node == "n-1" && *argv == expected_mount)
        .expect("expected a mount invocation");
    assert!(mkfs_index < mount_index);

    /*
     * Exactly one frontend-up transition was recorded, and it carries the
     * block id.
     */
    let events = ctx.core.events_drain().await;
    assert_eq!(events, vec![BlockEvent::FrontendUp { block_id: block.id }]);
}

#[tokio::test]
async fn test_replica_loss_and_rebalance() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;
    ctx.sim.exec_log_drain().await;

    /*
     * Kill replica 2's pod.  The dispatcher must detach it from the
     * frontend and clear its network state.
     */
    let lost = block
        .replicas
        .iter()
        .find(|r| r.ip.as_deref() == Some("10.0.0.12"))
        .cloned()
        .expect("expected a replica with ip 10.0.0.12");
    let event = ctx.sim.pod_set_terminating(&lost.name).await;
    ctx.dispatcher.handle_event(&event).await.unwrap();

    let block = ctx.core.block_lookup(&block.id).await.unwrap();
    let lost_now = block.replica(&lost.id).unwrap();
    assert!(!lost_now.healthy);
    assert_eq!(lost_now.status, ReplicaStatus::Unhealthy);
    assert!(!lost_now.attached);
    assert!(lost_now.ip.is_none());
    assert!(lost_now.endpoint.is_none());
    assert!(!block.healthy);
    assert_eq!(block.status(), BlockStatus::Unhealthy);
    assert_state_invariant(&block);

    let exec_log = ctx.sim.exec_log_drain().await;
    let removes = argv_of(&exec_log, "rm-replica");
    assert_eq!(removes.len(), 1);
    assert_eq!(removes[0].last().unwrap(), "tcp://10.0.0.12:10000");
    assert_eq!(ctx.sim.engine_replicas("v1").await.len(), 2);

    /*
     * Drop the dead replica from the block, then balance: a replacement
     * is created on an available disk.
     */
    let block =
        ctx.core.replica_remove(&block.id, &lost.id, false).await.unwrap();
    assert_eq!(block.replicas.len(), 2);

    let block = ctx.core.block_balance(&block.id).await.unwrap();
    assert_eq!(block.replicas.len(), 3);
    let new_replica = block
        .replicas
        .iter()
        .find(|r| !r.healthy)
        .cloned()
        .expect("expected the replacement replica to start pending");
    assert_eq!(new_replica.status, ReplicaStatus::Pending);

    /*
     * The replacement pod comes up, attaches, and the block is healthy
     * again with three attached replicas.
     */
    let event = ctx
        .sim
        .pod_set_running(&new_replica.name, Some("10.0.0.14"))
        .await;
    ctx.dispatcher.handle_event(&event).await.unwrap();

    let block = ctx.core.block_lookup(&block.id).await.unwrap();
    assert!(block.healthy);
    assert_eq!(block.status(), BlockStatus::Healthy);
    assert_eq!(block.replicas.iter().filter(|r| r.attached).count(), 3);
    assert_eq!(ctx.sim.engine_replicas("v1").await.len(), 3);
    assert_state_invariant(&block);
}

#[tokio::test]
async fn test_deprovision_while_mounted() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;
    assert!(block.mounted);

    /*
     * Deprovision must be refused while the block is mounted.
     */
    let error = ctx.core.block_deprovision(&block.id).await.unwrap_err();
    assert_eq!(error.kind(), "BlockMounted");
    assert!(matches!(error, ApiError::BlockMounted { .. }));

    /*
     * After an unmount the retry succeeds and soft-deletes the entity; no
     * pods carrying the block label remain, and every folder has been
     * reclaimed.
     */
    let block = ctx.core.block_unmount(&block.id, false).await.unwrap();
    assert!(!block.mounted);
    ctx.core.block_deprovision(&block.id).await.unwrap();

    assert!(ctx.core.block_lookup(&block.id).await.is_err());
    assert!(ctx.core.blocks_list().await.unwrap().is_empty());
    assert!(ctx
        .sim
        .pods_labelled(&block.id.to_string())
        .await
        .is_empty());
    assert_eq!(ctx.sim.folder_count().await, 0);
}

#[tokio::test]
async fn test_snapshot_lifecycle() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;

    let created = ctx.core.snapshot_create(&block.id).await.unwrap();
    assert!(!created.is_empty());

    let snapshots = ctx.core.snapshot_list(&block.id).await.unwrap();
    assert!(snapshots.contains(&created));

    ctx.core.snapshot_purge(&block.id, false).await.unwrap();
    let status =
        ctx.core.snapshot_purge_status(&block.id).await.unwrap();
    assert_eq!(status, serde_json::json!({}));

    /*
     * The snapshot also shows up in the chain reported by ls-replica.
     */
    let replicas = ctx.core.replica_list(&block.id).await.unwrap();
    assert_eq!(replicas.len(), 3);
    for row in &replicas {
        assert!(row.replica.is_some());
        assert!(row
            .chain
            .contains(&format!("volume-snap-{}.img", created)));
    }

    ctx.core.snapshot_remove(&block.id, &created).await.unwrap();
    let snapshots = ctx.core.snapshot_list(&block.id).await.unwrap();
    assert!(!snapshots.contains(&created));
}

#[tokio::test]
async fn test_duplicate_controller() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;

    let error = ctx
        .core
        .controller_create(&block.id, &ControllerOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "ControllerExists");
    assert_eq!(error.status_code(), http::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_snapshot_on_offline_block() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    assert!(!block.online);
    ctx.sim.exec_log_drain().await;

    let error = ctx.core.snapshot_create(&block.id).await.unwrap_err();
    assert_eq!(error.kind(), "BlockOffline");
    assert_eq!(error.status_code(), http::StatusCode::BAD_REQUEST);

    /* no engine command may have been issued */
    let exec_log = ctx.sim.exec_log_drain().await;
    assert!(argv_of(&exec_log, "snapshots").is_empty());
}

#[tokio::test]
async fn test_provision_with_insufficient_disks() {
    /*
     * Two disks, three replicas requested: provisioning completes with a
     * warning and a short replica list.
     */
    let ctx = test_setup(2);
    let block = provision(&ctx, "v1", 3).await;
    assert_eq!(block.replica_count, 3);
    assert_eq!(block.replicas.len(), 2);
}

#[tokio::test]
async fn test_provision_duplicate_name() {
    let ctx = test_setup(4);
    provision(&ctx, "v1", 3).await;
    let error = ctx
        .core
        .block_provision(
            common::name("v1"),
            "n-1",
            block_orchestrator::api_model::Gibibytes::new(10),
            3,
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "BlockExists");
}

#[tokio::test]
async fn test_format_idempotence_and_force() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;

    /* the bring-up already formatted and mounted the device */
    let error = ctx
        .core
        .block_format(&block.id, &FormatOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "BlockFormatted");

    /* even with force, a mounted block cannot be reformatted */
    let error = ctx
        .core
        .block_format(
            &block.id,
            &FormatOptions { force: true, ..FormatOptions::default() },
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "BlockMounted");

    /* unmounted, a forced reformat is accepted; an unforced one is not */
    let block = ctx.core.block_unmount(&block.id, false).await.unwrap();
    let error = ctx
        .core
        .block_format(&block.id, &FormatOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "BlockFormatted");
    let block = ctx
        .core
        .block_format(
            &block.id,
            &FormatOptions { force: true, ..FormatOptions::default() },
        )
        .await
        .unwrap();
    assert!(block.formatted);

    /* and repeated forced formats stay accepted */
    ctx.core
        .block_format(
            &block.id,
            &FormatOptions { force: true, ..FormatOptions::default() },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_mount_unmount_mount() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;
    assert!(block.mounted);

    let error =
        ctx.core.block_mount(&block.id, false).await.unwrap_err();
    assert_eq!(error.kind(), "BlockMounted");

    let block = ctx.core.block_unmount(&block.id, false).await.unwrap();
    assert!(!block.mounted);
    let error =
        ctx.core.block_unmount(&block.id, false).await.unwrap_err();
    assert_eq!(error.kind(), "BlockNotMounted");

    let block = ctx.core.block_mount(&block.id, false).await.unwrap();
    assert!(block.mounted);
    assert_state_invariant(&block);
}

#[tokio::test]
async fn test_remove_last_replica_requires_force() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 1).await;
    let block = bring_up(&ctx, &block).await;
    assert_eq!(block.replicas.len(), 1);
    let replica_id = block.replicas[0].id;

    let error = ctx
        .core
        .replica_remove(&block.id, &replica_id, false)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "LastReplica");
    assert_eq!(error.status_code(), http::StatusCode::BAD_REQUEST);

    let block = ctx
        .core
        .replica_remove(&block.id, &replica_id, true)
        .await
        .unwrap();
    assert!(block.replicas.is_empty());
}

#[tokio::test]
async fn test_usage_reports_filesystem_and_replicas() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;

    /*
     * The simulated df reports a 10 GiB filesystem with 1 GiB used; the
     * simulated du reports 0.5 GiB per replica folder.
     */
    let usage = ctx.core.block_usage(&block.id).await.unwrap();
    assert_eq!(usage.size, 10);
    assert_eq!(usage.used, 1.0);
    assert_eq!(usage.available, 9.0);
    assert_eq!(usage.used_percent, 10);
    assert_eq!(usage.replicas.len(), 3);
    for replica in &usage.replicas {
        assert_eq!(replica.used, 0.5);
    }

    /* the refreshed used value lands on the entity */
    let block = ctx.core.block_lookup(&block.id).await.unwrap();
    assert_eq!(block.used_gib, 1.0);

    /* an unhealthy replica reports -1 without a du invocation */
    let lost = block.replicas[1].clone();
    let event = ctx.sim.pod_set_terminating(&lost.name).await;
    ctx.dispatcher.handle_event(&event).await.unwrap();
    let usage = ctx.core.block_usage(&block.id).await.unwrap();
    let lost_usage =
        usage.replicas.iter().find(|r| r.id == lost.id).unwrap();
    assert_eq!(lost_usage.used, -1.0);
}

#[tokio::test]
async fn test_check_pods_recovers_state() {
    let ctx = test_setup(4);
    let block = provision(&ctx, "v1", 3).await;
    let block = bring_up(&ctx, &block).await;

    /*
     * Mark one replica unhealthy directly (as if an event were missed),
     * then let a reconciliation pass restore it from observed pod state.
     */
    let target = block.replicas[0].clone();
    let event = ctx.sim.pod_set_terminating(&target.name).await;
    ctx.dispatcher.handle_event(&event).await.unwrap();
    let block = ctx.core.block_lookup(&block.id).await.unwrap();
    assert!(!block.healthy);

    /* the pod reappears (restarted in place with the same name) */
    ctx.sim
        .pod_set_running(&target.name, Some("10.0.0.21"))
        .await;
    let block = ctx.core.block_check_pods(&block.id).await.unwrap();
    let restored = block.replica(&target.id).unwrap();
    assert!(restored.healthy);
    assert_eq!(restored.status, ReplicaStatus::Healthy);
    assert!(restored.attached);
    assert_eq!(restored.endpoint.as_deref(), Some("tcp://10.0.0.21:10000"));
    assert!(block.healthy);
    assert_state_invariant(&block);
}
