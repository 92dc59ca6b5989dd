/*!
 * The heart of the block control plane
 *
 * [`BlockOrchestrator`] owns the entity store, the engine/replica/snapshot
 * drivers, and the process-wide blocks lock, and sequences every mutation
 * of a block.  Reconciliation is linearized: callers (the HTTP layer and
 * the pod-event multiplexer) acquire the blocks lock, reload the entity
 * from the store, and run one reconciliation to completion before the lock
 * is released.  Where the engine protocol calls for a frontend-state
 * refresh after a command, the refresh and its follow-ons (format, mount,
 * unmount) run inside the same critical section.
 */

use futures::lock::Mutex;
use futures::lock::MutexGuard;
use slog::Logger;
use std::sync::Arc;
use uuid::Uuid;

use async_trait::async_trait;
use chrono::Utc;

use crate::api_config::BlocksConfig;
use crate::api_error::ApiError;
use crate::api_model::AddReplicaOptions;
use crate::api_model::Block;
use crate::api_model::BlockUsage;
use crate::api_model::ControllerInfo;
use crate::api_model::ControllerOptions;
use crate::api_model::CreateResult;
use crate::api_model::DeleteResult;
use crate::api_model::EngineReplicaView;
use crate::api_model::FormatOptions;
use crate::api_model::Gibibytes;
use crate::api_model::ListResult;
use crate::api_model::Locality;
use crate::api_model::LookupResult;
use crate::api_model::Name;
use crate::api_model::Replica;
use crate::api_model::ReplicaMode;
use crate::api_model::ReplicaStatus;
use crate::api_model::ReplicaUsage;
use crate::api_model::SnapshotCloneParams;
use crate::api_model::UpdateResult;
use crate::datastore::BlockStore;
use crate::engine::EngineDriver;
use crate::gateway::parse_df;
use crate::gateway::parse_du;
use crate::gateway::CommandGateway;
use crate::orchestrator::ExecOutput;
use crate::orchestrator::NodeTerminal;
use crate::orchestrator::OrchestratorApi;
use crate::replica::ReplicaDriver;
use crate::snapshot::SnapshotOperator;
use crate::substrate::DiskService;
use crate::substrate::FolderService;
use crate::substrate::NodeService;

/** Folder prefix for block mount points */
const BLOCK_FOLDER_PREFIX: &str = "block";

/**
 * A domain event recording a frontend state transition.  Events are
 * appended to the in-memory event log only after the corresponding entity
 * update has been persisted.
 */
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockEvent {
    FrontendUp { block_id: Uuid },
    FrontendDown { block_id: Uuid },
}

/**
 * Represents the state of the block volumes that we're managing.
 */
pub struct BlockOrchestrator {
    /** general server log */
    log: Logger,
    /** block subsystem configuration */
    config: BlocksConfig,
    /** persistent storage for block entities */
    pub(crate) store: Arc<BlockStore>,
    orchestrator: Arc<dyn OrchestratorApi>,
    terminal: Arc<dyn NodeTerminal>,
    nodes: Arc<dyn NodeService>,
    disks: Arc<dyn DiskService>,
    folders: Arc<dyn FolderService>,
    pub(crate) engine: EngineDriver,
    pub(crate) replicas: ReplicaDriver,
    snapshots: SnapshotOperator,
    /**
     * The process-wide blocks lock.  All mutating operations and all
     * pod-event handlers serialize on it; waiters acquire in arrival
     * order.
     */
    blocks_lock: Mutex<()>,
    /** domain event log, drained by the test interfaces */
    events: Mutex<Vec<BlockEvent>>,
}

impl BlockOrchestrator {
    pub fn new(
        config: BlocksConfig,
        orchestrator: Arc<dyn OrchestratorApi>,
        terminal: Arc<dyn NodeTerminal>,
        nodes: Arc<dyn NodeService>,
        disks: Arc<dyn DiskService>,
        folders: Arc<dyn FolderService>,
        log: Logger,
    ) -> BlockOrchestrator {
        let store = Arc::new(BlockStore::new());
        let gateway = Arc::new(CommandGateway::new(
            Arc::clone(&orchestrator),
            log.new(o!("component" => "gateway")),
        ));
        let engine = EngineDriver::new(
            Arc::clone(&orchestrator),
            Arc::clone(&nodes),
            Arc::clone(&store),
            Arc::clone(&gateway),
            config.clone(),
            log.new(o!("component" => "engine")),
        );
        let replicas = ReplicaDriver::new(
            Arc::clone(&orchestrator),
            Arc::clone(&nodes),
            Arc::clone(&folders),
            Arc::clone(&store),
            Arc::clone(&gateway),
            config.clone(),
            log.new(o!("component" => "replica")),
        );
        let snapshots = SnapshotOperator::new(
            Arc::clone(&gateway),
            log.new(o!("component" => "snapshot")),
        );

        BlockOrchestrator {
            log,
            config,
            store,
            orchestrator,
            terminal,
            nodes,
            disks,
            folders,
            engine,
            replicas,
            snapshots,
            blocks_lock: Mutex::new(()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BlocksConfig {
        &self.config
    }

    /** Acquires the blocks lock.  Waiters are served in arrival order. */
    pub(crate) async fn lock_blocks(&self) -> MutexGuard<'_, ()> {
        self.blocks_lock.lock().await
    }

    async fn emit(&self, event: BlockEvent) {
        info!(self.log, "domain event"; "event" => ?event);
        self.events.lock().await.push(event);
    }

    /** Runs a node-terminal command, failing on a non-zero exit. */
    async fn terminal_checked(
        &self,
        node: &str,
        argv: Vec<String>,
    ) -> Result<ExecOutput, ApiError> {
        debug!(self.log, "terminal"; "node" => node,
            "argv" => argv.join(" "));
        let output = self.terminal.run(node, &argv).await?;
        if !output.success() {
            return Err(ApiError::EngineCommandFailed {
                detail: output.stderr,
            });
        }
        Ok(output)
    }

    fn replica_or_error(
        block: &Block,
        replica_id: &Uuid,
    ) -> Result<Replica, ApiError> {
        block.replica(replica_id).cloned().ok_or_else(|| {
            ApiError::ReplicaNotFound {
                block: block.name.as_str().to_string(),
                replica: replica_id.to_string(),
            }
        })
    }

    /*
     * Reads
     */

    pub async fn block_lookup(&self, id: &Uuid) -> LookupResult<Block> {
        self.store.block_lookup(id).await
    }

    pub async fn blocks_list(&self) -> ListResult<Block> {
        self.store.blocks_list().await
    }

    /*
     * Provision / deprovision
     */

    /**
     * Provisions a new block: a mount-point folder on the preferred node,
     * the entity, the controller pod, and up to `replica_count` replica
     * pods on disks chosen by the disk service.  If fewer disks than
     * requested are available the block is still returned, with a warning
     * logged; replica creation failures, by contrast, roll the whole
     * provision back.
     */
    pub async fn block_provision(
        &self,
        name: Name,
        node_name: &str,
        size: Gibibytes,
        replica_count: u32,
    ) -> CreateResult<Block> {
        if self.store.block_lookup_by_name(&name).await.is_ok() {
            return Err(ApiError::BlockExists {
                name: name.as_str().to_string(),
            });
        }
        let node = self.nodes.node_lookup(node_name).await?;

        let node_disks = self.disks.node_disks(&node.name).await?;
        if node_disks.is_empty() {
            return Err(ApiError::NodeStorageNotFound { node: node.name });
        }

        let mount_point = self
            .folders
            .provision(&node_disks[0], BLOCK_FOLDER_PREFIX)
            .await?;

        let now = Utc::now();
        let block = Block {
            id: Uuid::new_v4(),
            name: name.clone(),
            cluster: self.config.cluster.clone(),
            namespace: self.config.namespace.clone(),
            node: node.name.clone(),
            size,
            used_gib: 0.0,
            replica_count,
            controller: None,
            device: None,
            mount_point: Some(mount_point.clone()),
            formatted: false,
            mounted: false,
            online: false,
            frontend_state: false,
            locality: Locality::Unknown,
            healthy: false,
            replicas: Vec::new(),
            time_created: now,
            time_modified: now,
            time_deleted: None,
        };
        let block = match self.store.block_create(block).await {
            Ok(block) => block,
            Err(e) => {
                if let Err(cleanup) =
                    self.folders.deprovision(&mount_point).await
                {
                    warn!(self.log, "failed to reclaim mount-point folder";
                        "folder" => %mount_point.id,
                        "error" => %cleanup);
                }
                return Err(e);
            }
        };

        let _guard = self.blocks_lock.lock().await;

        /*
         * The controller starts with no replicas; each replica is added to
         * the frontend later, when its pod reports Running.
         */
        let block = match self
            .engine
            .create_controller(&block, &ControllerOptions::default())
            .await
        {
            Ok(block) => block,
            Err(e) => {
                self.provision_rollback(&block).await;
                return Err(e);
            }
        };

        let available = match self
            .disks
            .available_disks(
                &self.config.cluster,
                size.to_mebibytes(),
                &[],
                None,
                replica_count as usize,
            )
            .await
        {
            Ok(disks) => disks,
            Err(e) => {
                self.provision_rollback(&block).await;
                return Err(e);
            }
        };

        let mut current = block;
        for disk in &available {
            match self.replicas.create_replica(&current, disk).await {
                Ok(block) => current = block,
                Err(e) => {
                    self.provision_rollback(&current).await;
                    return Err(e);
                }
            }
        }

        if current.replicas.len() < replica_count as usize {
            warn!(self.log, "provisioned with fewer replicas than requested";
                "block" => name.as_str(),
                "requested" => replica_count,
                "provisioned" => current.replicas.len());
        }

        Ok(current)
    }

    async fn provision_rollback(&self, block: &Arc<Block>) {
        if let Err(e) = self.deprovision_locked(block).await {
            warn!(self.log, "provision rollback incomplete";
                "block" => block.name.as_str(),
                "error" => %e);
        }
    }

    /**
     * Deprovisions a block: controller pod, replicas, mount-point folder,
     * then soft-deletes the entity.  All substrate teardown is best-effort;
     * only entity-store failures abort the pass.  Fails up front if the
     * block is mounted.
     */
    pub async fn block_deprovision(&self, id: &Uuid) -> DeleteResult {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        if block.mounted {
            return Err(ApiError::BlockMounted {
                block: block.name.as_str().to_string(),
            });
        }
        self.deprovision_locked(&block).await
    }

    async fn deprovision_locked(&self, block: &Arc<Block>) -> DeleteResult {
        let current = self.store.block_lookup(&block.id).await?;

        if current.controller.is_some() {
            if let Err(e) = self.engine.delete_controller(&current).await {
                warn!(self.log, "failed to delete controller";
                    "block" => current.name.as_str(),
                    "error" => %e);
            }
        }

        let current = self.store.block_lookup(&block.id).await?;
        for replica in current.replicas.clone() {
            if let Err(e) =
                self.replicas.remove_from_block(&current, &replica).await
            {
                warn!(self.log, "failed to remove replica";
                    "block" => current.name.as_str(),
                    "replica" => %replica.name,
                    "error" => %e);
            }
        }

        if let Some(mount_point) = &current.mount_point {
            if let Err(e) = self.folders.deprovision(mount_point).await {
                warn!(self.log, "failed to reclaim mount-point folder";
                    "block" => current.name.as_str(),
                    "error" => %e);
            }
        }

        info!(self.log, "deprovisioned block";
            "block" => current.name.as_str());
        self.store.block_soft_remove(&block.id).await
    }

    /*
     * Device operations (format / mount / unmount / usage / trim)
     */

    pub async fn block_format(
        &self,
        id: &Uuid,
        options: &FormatOptions,
    ) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.format_locked(&block, options).await
    }

    async fn format_locked(
        &self,
        block: &Arc<Block>,
        options: &FormatOptions,
    ) -> UpdateResult<Block> {
        if block.formatted && !options.force {
            return Err(ApiError::BlockFormatted {
                block: block.name.as_str().to_string(),
            });
        }
        if block.mounted {
            return Err(ApiError::BlockMounted {
                block: block.name.as_str().to_string(),
            });
        }
        let device = block.device.as_ref().ok_or_else(|| {
            ApiError::BlockOffline {
                block: block.name.as_str().to_string(),
            }
        })?;

        self.terminal_checked(
            &block.node,
            vec![
                String::from("mkfs"),
                String::from("-t"),
                options.fs_type.clone(),
                String::from("-m"),
                options.reserve.to_string(),
                String::from("-L"),
                block.name.as_str().to_string(),
                device.clone(),
            ],
        )
        .await?;

        info!(self.log, "formatted block";
            "block" => block.name.as_str(),
            "fs_type" => %options.fs_type);
        self.store.block_update(&block.id, |b| b.formatted = true).await
    }

    pub async fn block_mount(
        &self,
        id: &Uuid,
        force: bool,
    ) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.mount_locked(&block, force).await
    }

    async fn mount_locked(
        &self,
        block: &Arc<Block>,
        force: bool,
    ) -> UpdateResult<Block> {
        if block.mounted && !force {
            return Err(ApiError::BlockMounted {
                block: block.name.as_str().to_string(),
            });
        }
        if !block.formatted {
            return Err(ApiError::BlockNotFormatted {
                block: block.name.as_str().to_string(),
            });
        }
        let device = block.device.as_ref().ok_or_else(|| {
            ApiError::BlockOffline {
                block: block.name.as_str().to_string(),
            }
        })?;
        let mount_point = block.mount_point.as_ref().ok_or_else(|| {
            ApiError::internal_error("block has no mount point folder")
        })?;

        self.terminal_checked(
            &block.node,
            vec![
                String::from("mount"),
                device.clone(),
                mount_point.path.clone(),
            ],
        )
        .await?;

        info!(self.log, "mounted block"; "block" => block.name.as_str());
        self.store.block_update(&block.id, |b| b.mounted = true).await
    }

    pub async fn block_unmount(
        &self,
        id: &Uuid,
        force: bool,
    ) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.unmount_locked(&block, force).await
    }

    async fn unmount_locked(
        &self,
        block: &Arc<Block>,
        force: bool,
    ) -> UpdateResult<Block> {
        if !block.mounted && !force {
            return Err(ApiError::BlockNotMounted {
                block: block.name.as_str().to_string(),
            });
        }
        let mount_point = block.mount_point.as_ref().ok_or_else(|| {
            ApiError::internal_error("block has no mount point folder")
        })?;

        self.terminal_checked(
            &block.node,
            vec![String::from("umount"), mount_point.path.clone()],
        )
        .await?;

        info!(self.log, "unmounted block"; "block" => block.name.as_str());
        self.store.block_update(&block.id, |b| b.mounted = false).await
    }

    /**
     * Reports filesystem usage for the block and the on-disk footprint of
     * each replica folder.  The refreshed `used` value is persisted on the
     * entity; unhealthy replicas report -1.
     */
    pub async fn block_usage(
        &self,
        id: &Uuid,
    ) -> Result<BlockUsage, ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        let mount_point = block.mount_point.as_ref().ok_or_else(|| {
            ApiError::internal_error("block has no mount point folder")
        })?;

        let output = self
            .terminal_checked(
                &block.node,
                vec![String::from("df"), mount_point.path.clone()],
            )
            .await?;
        let df = parse_df(&output.stdout)?;

        let block = self
            .store
            .block_update(id, |b| b.used_gib = df.used_gib)
            .await?;

        let mut replica_usage = Vec::new();
        for replica in &block.replicas {
            let used = if replica.healthy {
                let result = self
                    .terminal_checked(
                        &replica.node,
                        vec![
                            String::from("du"),
                            String::from("-s"),
                            replica.folder.path.clone(),
                        ],
                    )
                    .await
                    .and_then(|output| parse_du(&output.stdout));
                match result {
                    Ok(used) => used,
                    Err(e) => {
                        warn!(self.log, "failed to size replica folder";
                            "replica" => %replica.name,
                            "error" => %e);
                        -1.0
                    }
                }
            } else {
                -1.0
            };
            replica_usage.push(ReplicaUsage {
                id: replica.id,
                name: replica.name.clone(),
                used,
            });
        }

        Ok(BlockUsage {
            size: block.size.to_gib(),
            used: df.used_gib,
            available: df.available_gib,
            used_percent: df.used_percent,
            replicas: replica_usage,
        })
    }

    /** Discards unused filesystem blocks on the mounted volume. */
    pub async fn block_trim(&self, id: &Uuid) -> Result<(), ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        let mount_point = block.mount_point.as_ref().ok_or_else(|| {
            ApiError::internal_error("block has no mount point folder")
        })?;
        self.terminal_checked(
            &block.node,
            vec![String::from("fstrim"), mount_point.path.clone()],
        )
        .await?;
        Ok(())
    }

    /*
     * Frontend state
     */

    /**
     * Reads the engine's view of the frontend and merges it into the
     * entity: frontend state, device path, locality, and aggregate health.
     * If the engine is unreachable the block is left unchanged.  A state
     * transition emits a domain event (after persistence), and the
     * follow-on device operations run in the same critical section: a
     * frontend that came up is formatted (once) and mounted; a frontend
     * that went down is unmounted.  Follow-on failures are logged, not
     * propagated.
     */
    pub(crate) async fn update_frontend_state_locked(
        &self,
        block: &Arc<Block>,
    ) -> UpdateResult<Block> {
        let info = match self.engine.controller_info(block).await {
            Ok(info) => info,
            Err(e) => {
                warn!(self.log, "frontend state unavailable";
                    "block" => block.name.as_str(),
                    "error" => %e);
                return self.store.block_lookup(&block.id).await;
            }
        };

        let up = info.is_up();
        let device = info.device();
        let was_up = block.frontend_state;

        let updated = self
            .store
            .block_update(&block.id, |b| {
                b.frontend_state = up;
                b.device = device.clone();
                b.locality = if b.has_local_replica() {
                    Locality::Local
                } else {
                    Locality::Remote
                };
                b.healthy = b.replicas.iter().all(|r| r.healthy);
            })
            .await?;

        if up != was_up {
            self.emit(if up {
                BlockEvent::FrontendUp { block_id: block.id }
            } else {
                BlockEvent::FrontendDown { block_id: block.id }
            })
            .await;
        }

        if up && !updated.mounted {
            let current = if !updated.formatted {
                match self
                    .format_locked(&updated, &FormatOptions::default())
                    .await
                {
                    Ok(block) => block,
                    Err(e) => {
                        warn!(self.log, "deferred format failed";
                            "block" => updated.name.as_str(),
                            "error" => %e);
                        return Ok(updated);
                    }
                }
            } else {
                updated
            };
            match self.mount_locked(&current, false).await {
                Ok(block) => Ok(block),
                Err(e) => {
                    warn!(self.log, "deferred mount failed";
                        "block" => current.name.as_str(),
                        "error" => %e);
                    Ok(current)
                }
            }
        } else if !up && updated.mounted {
            match self.unmount_locked(&updated, false).await {
                Ok(block) => Ok(block),
                Err(e) => {
                    warn!(self.log, "deferred unmount failed";
                        "block" => updated.name.as_str(),
                        "error" => %e);
                    Ok(updated)
                }
            }
        } else {
            Ok(updated)
        }
    }

    /*
     * Pod reconciliation
     */

    /**
     * One reconciliation pass against observed pod state: the controller
     * pod first (a missing controller pod is fatal), then each replica
     * pod, then a frontend-state refresh.
     */
    pub async fn block_check_pods(&self, id: &Uuid) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.check_pods_locked(&block).await
    }

    async fn check_pods_locked(
        &self,
        block: &Arc<Block>,
    ) -> UpdateResult<Block> {
        let pod = self
            .orchestrator
            .pod_read(&block.cluster, &block.namespace, block.name.as_str())
            .await?
            .ok_or_else(|| ApiError::ControllerNotFound {
                block: block.name.as_str().to_string(),
            })?;

        let mut current = Arc::clone(block);
        if !pod.is_running() && current.online {
            warn!(self.log, "controller pod no longer running";
                "block" => current.name.as_str());
            current = self
                .store
                .block_update(&block.id, |b| {
                    b.online = false;
                    b.mounted = false;
                    b.frontend_state = false;
                    b.device = None;
                })
                .await?;
        } else if pod.is_running() && !current.online {
            info!(self.log, "controller pod running again";
                "block" => current.name.as_str());
            current = self
                .store
                .block_update(&block.id, |b| b.online = true)
                .await?;
        }

        for replica in current.replicas.clone() {
            let pod = self
                .orchestrator
                .pod_read(&current.cluster, &current.namespace,
                    &replica.name)
                .await?;
            current = match pod {
                None => self.check_replica_missing(&current, &replica).await?,
                Some(pod) if !pod.is_running() => {
                    self.check_replica_stopped(&current, &replica).await?
                }
                Some(pod) => {
                    if !replica.healthy {
                        self.check_replica_recovered(
                            &current,
                            &replica,
                            pod.pod_ip.as_deref(),
                        )
                        .await?
                    } else {
                        current
                    }
                }
            };
        }

        self.update_frontend_state_locked(&current).await
    }

    /** A replica whose pod has vanished is detached and marked unhealthy. */
    async fn check_replica_missing(
        &self,
        block: &Arc<Block>,
        replica: &Replica,
    ) -> UpdateResult<Block> {
        warn!(self.log, "replica pod missing";
            "block" => block.name.as_str(),
            "replica" => %replica.name);
        if replica.attached {
            if let Err(e) =
                self.replicas.remove_from_frontend(block, replica).await
            {
                warn!(self.log, "failed to detach missing replica";
                    "replica" => %replica.name,
                    "error" => %e);
            }
        }
        let replica_id = replica.id;
        self.store
            .block_update(&block.id, move |b| {
                if let Some(r) = b.replica_mut(&replica_id) {
                    r.healthy = false;
                    r.status = ReplicaStatus::Unhealthy;
                    r.attached = false;
                    r.clear_network();
                }
            })
            .await
    }

    /**
     * A replica whose pod stopped running is detached; the attach attempt
     * that follows is skipped by the driver until the replica is healthy
     * again, which the next Running pod event will establish.
     */
    async fn check_replica_stopped(
        &self,
        block: &Arc<Block>,
        replica: &Replica,
    ) -> UpdateResult<Block> {
        if replica.attached {
            if let Err(e) =
                self.replicas.remove_from_frontend(block, replica).await
            {
                warn!(self.log, "failed to detach stopped replica";
                    "replica" => %replica.name,
                    "error" => %e);
            }
        }
        let replica_id = replica.id;
        let current = self
            .store
            .block_update(&block.id, move |b| {
                if let Some(r) = b.replica_mut(&replica_id) {
                    r.healthy = false;
                    r.status = ReplicaStatus::Unhealthy;
                    r.attached = false;
                }
            })
            .await?;
        if let Some(replica) = current.replica(&replica.id).cloned() {
            if let Err(e) = self
                .replicas
                .add_to_frontend(
                    &current,
                    &replica,
                    &AddReplicaOptions::default(),
                )
                .await
            {
                warn!(self.log, "replica reattach attempt failed";
                    "replica" => %replica.name,
                    "error" => %e);
            }
        }
        self.store.block_lookup(&block.id).await
    }

    /** A running pod for an unhealthy replica: restore network state and
     * re-attach. */
    async fn check_replica_recovered(
        &self,
        block: &Arc<Block>,
        replica: &Replica,
        pod_ip: Option<&str>,
    ) -> UpdateResult<Block> {
        let replica_id = replica.id;
        let ip = pod_ip.map(|s| s.to_string());
        let current = self
            .store
            .block_update(&block.id, move |b| {
                if let Some(r) = b.replica_mut(&replica_id) {
                    if let Some(ip) = &ip {
                        r.set_ip(ip);
                    }
                    r.healthy = true;
                    r.status = ReplicaStatus::Healthy;
                }
            })
            .await?;
        let replica = BlockOrchestrator::replica_or_error(
            &current,
            &replica_id,
        )?;
        match self
            .replicas
            .add_to_frontend(&current, &replica, &AddReplicaOptions::default())
            .await
        {
            Ok(block) => Ok(block),
            Err(e) => {
                warn!(self.log, "failed to reattach recovered replica";
                    "replica" => %replica.name,
                    "error" => %e);
                self.store.block_lookup(&block.id).await
            }
        }
    }

    /*
     * Balancing
     */

    /**
     * Reconciles the replica list toward `replica_count`.  Under target,
     * new replicas are created one at a time on disks not already hosting
     * one; over target, replicas are removed from the tail inward, sparing
     * any on the preferred node; at target with remote locality, one
     * best-effort local replica is attempted (a removal elsewhere is left
     * to a later pass).
     */
    pub async fn block_balance(&self, id: &Uuid) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.balance_locked(&block).await
    }

    async fn balance_locked(
        &self,
        block: &Arc<Block>,
    ) -> UpdateResult<Block> {
        let mut current = Arc::clone(block);
        let want = current.replica_count as usize;
        let budget_mib = current.size.to_mebibytes();

        if current.replicas.len() < want {
            while current.replicas.len() < want {
                let exclude: Vec<String> = current
                    .replicas
                    .iter()
                    .map(|r| r.disk.id.clone())
                    .collect();
                let found = self
                    .disks
                    .available_disks(
                        &current.cluster,
                        budget_mib,
                        &exclude,
                        None,
                        1,
                    )
                    .await?;
                let Some(disk) = found.first() else {
                    warn!(self.log, "no disk available for new replica";
                        "block" => current.name.as_str(),
                        "have" => current.replicas.len(),
                        "want" => want);
                    break;
                };
                current =
                    self.replicas.create_replica(&current, disk).await?;
            }
        } else if current.replicas.len() > want {
            let victims: Vec<Replica> = current
                .replicas
                .iter()
                .rev()
                .filter(|r| r.node != current.node)
                .take(current.replicas.len() - want)
                .cloned()
                .collect();
            for replica in victims {
                current = self
                    .replicas
                    .remove_from_block(&current, &replica)
                    .await?;
            }
        } else if current.locality == Locality::Remote {
            let exclude: Vec<String> = current
                .replicas
                .iter()
                .map(|r| r.disk.id.clone())
                .collect();
            let node = current.node.clone();
            match self
                .disks
                .available_disks(
                    &current.cluster,
                    budget_mib,
                    &exclude,
                    Some(&node),
                    1,
                )
                .await
            {
                Ok(found) => {
                    if let Some(disk) = found.first() {
                        match self
                            .replicas
                            .create_replica(&current, disk)
                            .await
                        {
                            Ok(block) => {
                                info!(self.log,
                                    "created local replica for locality; \
                                     a later balance pass removes one \
                                     elsewhere";
                                    "block" => current.name.as_str());
                                current = block;
                            }
                            Err(e) => {
                                warn!(self.log,
                                    "local replica attempt failed";
                                    "block" => current.name.as_str(),
                                    "error" => %e);
                            }
                        }
                    } else {
                        info!(self.log, "no local disk available";
                            "block" => current.name.as_str());
                    }
                }
                Err(e) => {
                    warn!(self.log, "local disk query failed";
                        "block" => current.name.as_str(),
                        "error" => %e);
                }
            }
        }

        self.update_frontend_state_locked(&current).await
    }

    /*
     * Controller operations
     */

    pub async fn controller_create(
        &self,
        id: &Uuid,
        options: &ControllerOptions,
    ) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.engine.create_controller(&block, options).await
    }

    pub async fn controller_delete(&self, id: &Uuid) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.engine.delete_controller(&block).await
    }

    pub async fn frontend_start(&self, id: &Uuid) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.engine.frontend_start(&block).await?;
        self.update_frontend_state_locked(&block).await
    }

    pub async fn frontend_shutdown(&self, id: &Uuid) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.engine.frontend_shutdown(&block).await?;
        self.update_frontend_state_locked(&block).await
    }

    pub async fn controller_expand(&self, id: &Uuid) -> Result<(), ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.engine.expand(&block).await
    }

    pub async fn controller_info(
        &self,
        id: &Uuid,
    ) -> Result<ControllerInfo, ApiError> {
        let block = self.store.block_lookup(id).await?;
        self.engine.controller_info(&block).await
    }

    /*
     * Replica operations
     */

    pub async fn replica_list(
        &self,
        id: &Uuid,
    ) -> Result<Vec<EngineReplicaView>, ApiError> {
        let block = self.store.block_lookup(id).await?;
        self.replicas.list_replicas(&block).await
    }

    /**
     * Removes one replica from the block.  Removing the last replica
     * requires `force`.
     */
    pub async fn replica_remove(
        &self,
        id: &Uuid,
        replica_id: &Uuid,
        force: bool,
    ) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        let replica =
            BlockOrchestrator::replica_or_error(&block, replica_id)?;
        if block.replicas.len() <= 1 && !force {
            return Err(ApiError::LastReplica {
                block: block.name.as_str().to_string(),
            });
        }
        let current =
            self.replicas.remove_from_block(&block, &replica).await?;
        self.update_frontend_state_locked(&current).await
    }

    pub async fn replica_update_mode(
        &self,
        id: &Uuid,
        replica_id: &Uuid,
        mode: ReplicaMode,
    ) -> UpdateResult<Block> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        let replica =
            BlockOrchestrator::replica_or_error(&block, replica_id)?;
        self.replicas.update_mode(&block, &replica, mode).await
    }

    pub async fn replica_rebuild_status(
        &self,
        id: &Uuid,
        replica_id: &Uuid,
    ) -> Result<String, ApiError> {
        let block = self.store.block_lookup(id).await?;
        let replica =
            BlockOrchestrator::replica_or_error(&block, replica_id)?;
        self.replicas.rebuild_status(&block, &replica).await
    }

    pub async fn replica_verify_rebuild(
        &self,
        id: &Uuid,
        replica_id: &Uuid,
    ) -> Result<(), ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        let replica =
            BlockOrchestrator::replica_or_error(&block, replica_id)?;
        self.replicas.verify_rebuild(&block, &replica).await
    }

    /*
     * Snapshot operations
     */

    pub async fn snapshot_create(
        &self,
        id: &Uuid,
    ) -> Result<String, ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.snapshots.create(&block).await
    }

    pub async fn snapshot_revert(
        &self,
        id: &Uuid,
        name: &str,
    ) -> Result<(), ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.snapshots.revert(&block, name).await
    }

    pub async fn snapshot_list(
        &self,
        id: &Uuid,
    ) -> Result<Vec<String>, ApiError> {
        let block = self.store.block_lookup(id).await?;
        self.snapshots.list(&block).await
    }

    pub async fn snapshot_remove(
        &self,
        id: &Uuid,
        name: &str,
    ) -> Result<(), ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.snapshots.remove(&block, name).await
    }

    pub async fn snapshot_purge(
        &self,
        id: &Uuid,
        skip_if_in_progress: bool,
    ) -> Result<(), ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.snapshots.purge(&block, skip_if_in_progress).await
    }

    pub async fn snapshot_purge_status(
        &self,
        id: &Uuid,
    ) -> Result<serde_json::Value, ApiError> {
        let block = self.store.block_lookup(id).await?;
        self.snapshots.purge_status(&block).await
    }

    pub async fn snapshot_info(
        &self,
        id: &Uuid,
    ) -> Result<serde_json::Value, ApiError> {
        let block = self.store.block_lookup(id).await?;
        self.snapshots.info(&block).await
    }

    pub async fn snapshot_clone(
        &self,
        id: &Uuid,
        params: &SnapshotCloneParams,
    ) -> Result<(), ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.snapshots.clone(&block, params).await
    }

    pub async fn snapshot_clone_status(
        &self,
        id: &Uuid,
        name: &str,
    ) -> Result<String, ApiError> {
        let block = self.store.block_lookup(id).await?;
        self.snapshots.clone_status(&block, name).await
    }

    pub async fn snapshot_hash(
        &self,
        id: &Uuid,
        name: &str,
    ) -> Result<(), ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.snapshots.hash(&block, name).await
    }

    pub async fn snapshot_hash_cancel(
        &self,
        id: &Uuid,
        name: &str,
    ) -> Result<(), ApiError> {
        let _guard = self.blocks_lock.lock().await;
        let block = self.store.block_lookup(id).await?;
        self.snapshots.hash_cancel(&block, name).await
    }

    pub async fn snapshot_hash_status(
        &self,
        id: &Uuid,
        name: &str,
    ) -> Result<serde_json::Value, ApiError> {
        let block = self.store.block_lookup(id).await?;
        self.snapshots.hash_status(&block, name).await
    }
}

/**
 * Trait used to expose interfaces for use only by the test suite.
 */
#[async_trait]
pub trait BlockOrchestratorTestInterfaces {
    /** Drains and returns the accumulated domain events. */
    async fn events_drain(&self) -> Vec<BlockEvent>;
}

#[async_trait]
impl BlockOrchestratorTestInterfaces for BlockOrchestrator {
    async fn events_drain(&self) -> Vec<BlockEvent> {
        std::mem::take(&mut *self.events.lock().await)
    }
}
