/*!
 * Replica driver
 *
 * Owns replica-pod creation and teardown and the controller-side
 * add/remove/update/verify-rebuild protocol.  As with the engine driver,
 * callers hold the blocks lock; the reconciler runs the frontend-state
 * refresh that follows attach/detach operations.
 */

use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::api_config::BlocksConfig;
use crate::api_error::ApiError;
use crate::api_model::AddReplicaOptions;
use crate::api_model::Block;
use crate::api_model::BLOCK_LABEL;
use crate::api_model::Disk;
use crate::api_model::EngineReplicaView;
use crate::api_model::Replica;
use crate::api_model::ReplicaMode;
use crate::api_model::ReplicaStatus;
use crate::api_model::REPLICA_PORT;
use crate::api_model::REPLICA_PORT_MAX;
use crate::api_model::UpdateResult;
use crate::datastore::BlockStore;
use crate::gateway::parse_replica_table;
use crate::gateway::CommandGateway;
use crate::moniker;
use crate::orchestrator::HostPathMount;
use crate::orchestrator::OrchestratorApi;
use crate::orchestrator::PodSpec;
use crate::orchestrator::RestartPolicy;
use crate::substrate::FolderService;
use crate::substrate::NodeService;

/** Folder prefix for replica data directories */
const REPLICA_FOLDER_PREFIX: &str = "block-replica";
/** Error substring reported by the engine when an add fails */
const ADD_REPLICA_ERROR: &str = "Error running add replica command";
/** Error substring reported by the engine when removing the last replica */
const LAST_REPLICA_ERROR: &str = "cannot remove last replica if volume is up";

pub struct ReplicaDriver {
    orchestrator: Arc<dyn OrchestratorApi>,
    nodes: Arc<dyn NodeService>,
    folders: Arc<dyn FolderService>,
    store: Arc<BlockStore>,
    gateway: Arc<CommandGateway>,
    config: BlocksConfig,
    log: Logger,
}

impl ReplicaDriver {
    pub fn new(
        orchestrator: Arc<dyn OrchestratorApi>,
        nodes: Arc<dyn NodeService>,
        folders: Arc<dyn FolderService>,
        store: Arc<BlockStore>,
        gateway: Arc<CommandGateway>,
        config: BlocksConfig,
        log: Logger,
    ) -> ReplicaDriver {
        ReplicaDriver {
            orchestrator,
            nodes,
            folders,
            store,
            gateway,
            config,
            log,
        }
    }

    /** Draws a replica name not already used within this block. */
    fn replica_name(&self, block: &Block) -> String {
        loop {
            let candidate = format!(
                "{}-{}-{}",
                REPLICA_FOLDER_PREFIX,
                block.name,
                moniker::moniker()
            );
            if !block.replicas.iter().any(|r| r.name == candidate) {
                return candidate;
            }
        }
    }

    fn replica_argv(&self, block: &Block, replica: &Replica) -> Vec<String> {
        vec![
            String::from("longhorn"),
            String::from("replica"),
            String::from("/mnt/"),
            String::from("--size"),
            block.size.engine_arg(),
            String::from("--replica-instance-name"),
            replica.name.clone(),
            String::from("--listen"),
            format!("0.0.0.0:{}", REPLICA_PORT),
            String::from("--data-server-protocol"),
            String::from("tcp"),
            String::from("--snapshot-max-count"),
            String::from("250"),
            String::from("--snapshot-max-size"),
            String::from("1gb"),
        ]
    }

    /**
     * Allocates a data folder on `disk`, submits a replica pod pinned to
     * the disk's node, and appends the new replica record to the block.
     * The replica starts pending, unhealthy, and detached; the pod-event
     * path marks it healthy and attaches it once the pod reports Running.
     *
     * If pod submission fails, the folder is deprovisioned again.
     */
    pub async fn create_replica(
        &self,
        block: &Block,
        disk: &Disk,
    ) -> UpdateResult<Block> {
        let folder = self
            .folders
            .provision(disk, REPLICA_FOLDER_PREFIX)
            .await?;
        let node = self.nodes.node_lookup(&disk.node).await?;

        let mut replica = Replica {
            id: Uuid::new_v4(),
            name: self.replica_name(block),
            pod: None,
            disk: disk.clone(),
            node: disk.node.clone(),
            folder: folder.clone(),
            status: ReplicaStatus::Pending,
            healthy: false,
            attached: false,
            ip: None,
            endpoint: None,
            mode: ReplicaMode::RW,
        };

        let spec = PodSpec {
            name: replica.name.clone(),
            namespace: block.namespace.clone(),
            node_name: node.hostname.clone(),
            image: self.config.engine_image.clone(),
            args: self.replica_argv(block, &replica),
            privileged: false,
            host_paths: vec![HostPathMount::new(&folder.path, "/mnt")],
            ports: (REPLICA_PORT..=REPLICA_PORT_MAX).collect(),
            restart_policy: RestartPolicy::Never,
            labels: BTreeMap::from([(
                BLOCK_LABEL.to_string(),
                block.id.to_string(),
            )]),
        };

        let pod = match self
            .orchestrator
            .pod_create(&block.cluster, spec)
            .await
        {
            Ok(pod) => pod,
            Err(e) => {
                if let Err(cleanup) =
                    self.folders.deprovision(&folder).await
                {
                    warn!(self.log, "failed to reclaim replica folder";
                        "folder" => %folder.id,
                        "error" => %cleanup);
                }
                return Err(ApiError::PodCreationError {
                    detail: e.to_string(),
                });
            }
        };

        info!(self.log, "created replica pod";
            "block" => block.name.as_str(),
            "replica" => %replica.name,
            "pod" => %pod.uid);
        replica.pod = Some(pod.uid);
        self.store
            .block_update(&block.id, move |b| b.replicas.push(replica))
            .await
    }

    /**
     * Asks the engine to add the replica to its set.  Skipped (with a log
     * entry) when the replica is not healthy or the block is not online;
     * the attach will be retried by the next Running pod event for this
     * replica.
     */
    pub async fn add_to_frontend(
        &self,
        block: &Block,
        replica: &Replica,
        options: &AddReplicaOptions,
    ) -> UpdateResult<Block> {
        if !replica.healthy || !block.online {
            info!(self.log, "skipping replica attach";
                "block" => block.name.as_str(),
                "replica" => %replica.name,
                "replica_healthy" => replica.healthy,
                "block_online" => block.online);
            return self.store.block_lookup(&block.id).await;
        }
        let endpoint = replica.endpoint.as_ref().ok_or_else(|| {
            ApiError::NoReplicaEndpoint { replica: replica.name.clone() }
        })?;

        let size = block.size.engine_arg();
        let mut argv = vec![
            String::from("longhorn"),
            String::from("add-replica"),
            String::from("--replica-instance-name"),
            replica.name.clone(),
            String::from("--size"),
            size.clone(),
            String::from("--current-size"),
            size,
        ];
        if options.restore {
            argv.push(String::from("--restore"));
        }
        if options.fast_sync {
            argv.push(String::from("--fast-sync"));
        }
        if let Some(timeout) = options.file_sync_http_client_timeout {
            argv.push(String::from("--file-sync-http-client-timeout"));
            argv.push(timeout.to_string());
        }
        argv.push(endpoint.clone());

        let output = self.gateway.exec(block, argv).await?;
        if output.stderr.contains(ADD_REPLICA_ERROR) {
            return Err(ApiError::AddReplicaError {
                detail: output.stderr,
            });
        }
        if !output.success() {
            return Err(ApiError::EngineCommandFailed {
                detail: output.stderr,
            });
        }

        let replica_id = replica.id;
        self.store
            .block_update(&block.id, move |b| {
                if let Some(r) = b.replica_mut(&replica_id) {
                    r.attached = true;
                }
            })
            .await
    }

    /**
     * Asks the engine to drop the replica from its set and records the
     * detachment.
     */
    pub async fn remove_from_frontend(
        &self,
        block: &Block,
        replica: &Replica,
    ) -> UpdateResult<Block> {
        let endpoint = replica.endpoint.as_ref().ok_or_else(|| {
            ApiError::NoReplicaEndpoint { replica: replica.name.clone() }
        })?;

        let argv = vec![
            String::from("longhorn"),
            String::from("rm-replica"),
            endpoint.clone(),
        ];
        let output = self.gateway.exec(block, argv).await?;
        if output.stderr.contains(LAST_REPLICA_ERROR) {
            return Err(ApiError::CannotRemoveLastReplica {
                detail: output.stderr,
            });
        }
        if !output.success() {
            return Err(ApiError::EngineCommandFailed {
                detail: output.stderr,
            });
        }

        let replica_id = replica.id;
        self.store
            .block_update(&block.id, move |b| {
                if let Some(r) = b.replica_mut(&replica_id) {
                    r.attached = false;
                }
            })
            .await
    }

    /**
     * Tears a replica down completely: detach from the frontend, delete
     * the pod, reclaim the folder, then drop the record from the block.
     * The first three steps are best-effort; each failure is logged and
     * the teardown continues.
     */
    pub async fn remove_from_block(
        &self,
        block: &Block,
        replica: &Replica,
    ) -> UpdateResult<Block> {
        if replica.attached {
            if let Err(e) = self.remove_from_frontend(block, replica).await {
                warn!(self.log, "failed to detach replica during removal";
                    "block" => block.name.as_str(),
                    "replica" => %replica.name,
                    "error" => %e);
            }
        }

        if replica.pod.is_some() {
            if let Err(e) = self
                .orchestrator
                .pod_delete(&block.cluster, &block.namespace, &replica.name)
                .await
            {
                warn!(self.log, "failed to delete replica pod";
                    "block" => block.name.as_str(),
                    "replica" => %replica.name,
                    "error" => %e);
            }
        }

        if let Err(e) = self.folders.deprovision(&replica.folder).await {
            warn!(self.log, "failed to reclaim replica folder";
                "block" => block.name.as_str(),
                "replica" => %replica.name,
                "error" => %e);
        }

        let replica_id = replica.id;
        info!(self.log, "removed replica";
            "block" => block.name.as_str(),
            "replica" => %replica.name);
        self.store
            .block_update(&block.id, move |b| {
                b.replicas.retain(|r| r.id != replica_id)
            })
            .await
    }

    /**
     * Lists the engine's replica set and joins each row with the stored
     * replica by full endpoint equality.  Rows the store cannot match are
     * returned with the parsed fields only.
     */
    pub async fn list_replicas(
        &self,
        block: &Block,
    ) -> Result<Vec<EngineReplicaView>, ApiError> {
        let output = self
            .gateway
            .exec_checked(
                block,
                vec![
                    String::from("longhorn"),
                    String::from("ls-replica"),
                ],
            )
            .await?;

        Ok(parse_replica_table(&output.stdout)
            .into_iter()
            .map(|row| {
                let replica = block
                    .replicas
                    .iter()
                    .find(|r| r.endpoint.as_deref() == Some(&row.endpoint))
                    .map(|r| r.to_view());
                EngineReplicaView {
                    endpoint: row.endpoint,
                    mode: row.mode,
                    chain: row.chain,
                    replica,
                }
            })
            .collect())
    }

    /** Sets the engine-side mode of a replica. */
    pub async fn update_mode(
        &self,
        block: &Block,
        replica: &Replica,
        mode: ReplicaMode,
    ) -> UpdateResult<Block> {
        let endpoint = replica.endpoint.as_ref().ok_or_else(|| {
            ApiError::NoReplicaEndpoint { replica: replica.name.clone() }
        })?;

        self.gateway
            .exec_checked(
                block,
                vec![
                    String::from("longhorn"),
                    String::from("update-replica"),
                    String::from("--mode"),
                    mode.to_string(),
                    endpoint.clone(),
                ],
            )
            .await?;

        let replica_id = replica.id;
        self.store
            .block_update(&block.id, move |b| {
                if let Some(r) = b.replica_mut(&replica_id) {
                    r.mode = mode;
                }
            })
            .await
    }

    /** Reads the engine's rebuild progress report for a replica. */
    pub async fn rebuild_status(
        &self,
        block: &Block,
        replica: &Replica,
    ) -> Result<String, ApiError> {
        let endpoint = replica.endpoint.as_ref().ok_or_else(|| {
            ApiError::NoReplicaEndpoint { replica: replica.name.clone() }
        })?;
        let output = self
            .gateway
            .exec_checked(
                block,
                vec![
                    String::from("longhorn"),
                    String::from("replica-rebuild-status"),
                    endpoint.clone(),
                ],
            )
            .await?;
        Ok(output.stdout)
    }

    /** Asks the engine to verify a completed rebuild. */
    pub async fn verify_rebuild(
        &self,
        block: &Block,
        replica: &Replica,
    ) -> Result<(), ApiError> {
        let endpoint = replica.endpoint.as_ref().ok_or_else(|| {
            ApiError::NoReplicaEndpoint { replica: replica.name.clone() }
        })?;
        self.gateway
            .exec_checked(
                block,
                vec![
                    String::from("longhorn"),
                    String::from("verify-rebuild-replica"),
                    String::from("--replica-instance-name"),
                    replica.id.to_string(),
                    endpoint.clone(),
                ],
            )
            .await?;
        Ok(())
    }
}
