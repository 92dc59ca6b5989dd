/*!
 * Engine controller driver
 *
 * Owns controller-pod creation and teardown plus the frontend protocol
 * (start/shutdown/expand/info).  Operations here assume the caller holds
 * the blocks lock; the reconciler sequences the follow-on state refresh
 * that several of these commands require.
 */

use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api_config::BlocksConfig;
use crate::api_error::ApiError;
use crate::api_model::Block;
use crate::api_model::BLOCK_LABEL;
use crate::api_model::CONTROLLER_PORT;
use crate::api_model::ControllerInfo;
use crate::api_model::ControllerOptions;
use crate::api_model::UpdateResult;
use crate::datastore::BlockStore;
use crate::gateway::parse_controller_info;
use crate::gateway::CommandGateway;
use crate::orchestrator::HostPathMount;
use crate::orchestrator::OrchestratorApi;
use crate::orchestrator::PodSpec;
use crate::orchestrator::RestartPolicy;
use crate::substrate::NodeService;

pub struct EngineDriver {
    orchestrator: Arc<dyn OrchestratorApi>,
    nodes: Arc<dyn NodeService>,
    store: Arc<BlockStore>,
    gateway: Arc<CommandGateway>,
    config: BlocksConfig,
    log: Logger,
}

impl EngineDriver {
    pub fn new(
        orchestrator: Arc<dyn OrchestratorApi>,
        nodes: Arc<dyn NodeService>,
        store: Arc<BlockStore>,
        gateway: Arc<CommandGateway>,
        config: BlocksConfig,
        log: Logger,
    ) -> EngineDriver {
        EngineDriver { orchestrator, nodes, store, gateway, config, log }
    }

    /**
     * Builds the controller argv.  The conditional flags appear at most
     * once each, in a fixed order, so that argv comparisons (and the engine
     * itself) see a stable command line.
     */
    fn controller_argv(
        &self,
        block: &Block,
        options: &ControllerOptions,
    ) -> Vec<String> {
        let size = block.size.engine_arg();
        let mut argv = vec![
            String::from("longhorn"),
            String::from("controller"),
            String::from("--listen"),
            format!("0.0.0.0:{}", CONTROLLER_PORT),
            String::from("--size"),
            size.clone(),
            String::from("--current-size"),
            size,
            String::from("--frontend"),
            self.config.frontend.clone(),
        ];

        for replica in &block.replicas {
            if let Some(endpoint) = &replica.endpoint {
                argv.push(String::from("--replica"));
                argv.push(endpoint.clone());
            }
        }

        if options.upgrade {
            argv.push(String::from("--upgrade"));
        }
        if options.disable_rev_counter {
            argv.push(String::from("--disableRevCounter"));
        }
        if options.salvage_requested {
            argv.push(String::from("--salvageRequested"));
        }
        if options.unmap_mark_snap_chain_removed {
            argv.push(String::from("--unmap-mark-snap-chain-removed"));
        }
        if let Some(count) = options.snapshot_max_count {
            argv.push(String::from("--snapshot-max-count"));
            argv.push(count.to_string());
        }
        if let Some(size) = &options.snapshot_max_size {
            argv.push(String::from("--snapshot-max-size"));
            argv.push(size.clone());
        }
        if let Some(timeout) = options.engine_replica_timeout {
            argv.push(String::from("--engine-replica-timeout"));
            argv.push(timeout.to_string());
        }
        if let Some(protocol) = &options.data_server_protocol {
            argv.push(String::from("--data-server-protocol"));
            argv.push(protocol.clone());
        }
        if let Some(timeout) = options.file_sync_http_client_timeout {
            argv.push(String::from("--file-sync-http-client-timeout"));
            argv.push(timeout.to_string());
        }

        argv.push(block.name.as_str().to_string());
        argv
    }

    /**
     * Creates the controller pod for `block` and persists the pod handle.
     * Fails if the block already has a controller.  The argv carries every
     * currently-known replica endpoint; replicas without endpoints will be
     * attached later as their pods come up.
     */
    pub async fn create_controller(
        &self,
        block: &Block,
        options: &ControllerOptions,
    ) -> UpdateResult<Block> {
        if block.controller.is_some() {
            return Err(ApiError::ControllerExists {
                block: block.name.as_str().to_string(),
            });
        }

        let node = self.nodes.node_lookup(&block.node).await?;
        let spec = PodSpec {
            name: block.name.as_str().to_string(),
            namespace: block.namespace.clone(),
            node_name: node.hostname.clone(),
            image: self.config.engine_image.clone(),
            args: self.controller_argv(block, options),
            privileged: true,
            host_paths: vec![
                HostPathMount::new("/mnt", "/mnt"),
                HostPathMount::new("/dev", "/host/dev"),
                HostPathMount::new("/proc", "/host/proc"),
            ],
            ports: vec![CONTROLLER_PORT],
            restart_policy: RestartPolicy::Always,
            labels: BTreeMap::from([(
                BLOCK_LABEL.to_string(),
                block.id.to_string(),
            )]),
        };

        let pod = self
            .orchestrator
            .pod_create(&block.cluster, spec)
            .await
            .map_err(|e| ApiError::PodCreationError {
                detail: e.to_string(),
            })?;
        info!(self.log, "created controller pod";
            "block" => block.name.as_str(),
            "pod" => %pod.uid);

        self.store
            .block_update(&block.id, |b| b.controller = Some(pod.uid.clone()))
            .await
    }

    pub async fn frontend_start(&self, block: &Block) -> Result<(), ApiError> {
        self.gateway
            .exec_checked(
                block,
                vec![
                    String::from("longhorn"),
                    String::from("frontend"),
                    String::from("start"),
                    self.config.frontend.clone(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn frontend_shutdown(
        &self,
        block: &Block,
    ) -> Result<(), ApiError> {
        self.gateway
            .exec_checked(
                block,
                vec![
                    String::from("longhorn"),
                    String::from("frontend"),
                    String::from("shutdown"),
                ],
            )
            .await?;
        Ok(())
    }

    /** Reads the engine's view of frontend state and device endpoint. */
    pub async fn controller_info(
        &self,
        block: &Block,
    ) -> Result<ControllerInfo, ApiError> {
        let output = self
            .gateway
            .exec_checked(
                block,
                vec![String::from("longhorn"), String::from("info")],
            )
            .await?;
        parse_controller_info(&output.stdout)
    }

    pub async fn expand(&self, block: &Block) -> Result<(), ApiError> {
        self.gateway
            .exec_checked(
                block,
                vec![
                    String::from("longhorn"),
                    String::from("expand"),
                    String::from("--size"),
                    block.size.engine_arg(),
                ],
            )
            .await?;
        Ok(())
    }

    /**
     * Deletes the controller pod (whose name is the block name) and clears
     * the controller handle and online flag.  Fails if the block is
     * mounted.
     */
    pub async fn delete_controller(
        &self,
        block: &Block,
    ) -> UpdateResult<Block> {
        if block.mounted {
            return Err(ApiError::ControllerMounted {
                block: block.name.as_str().to_string(),
            });
        }

        self.orchestrator
            .pod_delete(&block.cluster, &block.namespace,
                block.name.as_str())
            .await?;
        info!(self.log, "deleted controller pod";
            "block" => block.name.as_str());

        self.store
            .block_update(&block.id, |b| {
                b.controller = None;
                b.online = false;
            })
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api_model::Disk;
    use crate::api_model::Folder;
    use crate::api_model::Gibibytes;
    use crate::api_model::Locality;
    use crate::api_model::Name;
    use crate::api_model::Replica;
    use crate::api_model::ReplicaMode;
    use crate::api_model::ReplicaStatus;
    use crate::sim::SimBackend;
    use chrono::Utc;
    use std::convert::TryFrom;
    use uuid::Uuid;

    fn test_config() -> BlocksConfig {
        BlocksConfig {
            replica_count: 3,
            stale_replica_timeout: 28800,
            replica_soft_anti_affinity: true,
            engine_image: String::from("engine:test"),
            frontend: String::from("tgt-blockdev"),
            namespace: String::from("storage"),
            default_size: 10,
            cluster: String::from("default"),
        }
    }

    fn test_block(replica_endpoints: &[&str]) -> Block {
        let now = Utc::now();
        let replicas = replica_endpoints
            .iter()
            .enumerate()
            .map(|(i, endpoint)| Replica {
                id: Uuid::new_v4(),
                name: format!("block-replica-v1-{}", i),
                pod: None,
                disk: Disk {
                    id: format!("disk-{}", i),
                    node: "n-1".to_string(),
                    path: "/var/lib/storage".to_string(),
                    available_mib: 1 << 20,
                },
                node: "n-1".to_string(),
                folder: Folder {
                    id: format!("folder-{}", i),
                    path: format!("/var/lib/storage/r{}", i),
                    disk: format!("disk-{}", i),
                    node: "n-1".to_string(),
                },
                status: ReplicaStatus::Healthy,
                healthy: true,
                attached: false,
                ip: None,
                endpoint: Some(endpoint.to_string()),
                mode: ReplicaMode::RW,
            })
            .collect();
        Block {
            id: Uuid::new_v4(),
            name: Name::try_from("v1").unwrap(),
            cluster: "default".to_string(),
            namespace: "storage".to_string(),
            node: "n-1".to_string(),
            size: Gibibytes::new(10),
            used_gib: 0.0,
            replica_count: 3,
            controller: None,
            device: None,
            mount_point: None,
            formatted: false,
            mounted: false,
            online: false,
            frontend_state: false,
            locality: Locality::Unknown,
            healthy: false,
            replicas,
            time_created: now,
            time_modified: now,
            time_deleted: None,
        }
    }

    fn test_driver() -> EngineDriver {
        let log = slog::Logger::root(slog::Discard, o!());
        let sim = Arc::new(SimBackend::new(log.clone()));
        let store = Arc::new(BlockStore::new());
        let gateway =
            Arc::new(CommandGateway::new(sim.clone(), log.clone()));
        EngineDriver::new(sim.clone(), sim, store, gateway, test_config(), log)
    }

    #[test]
    fn test_controller_argv_basic() {
        let driver = test_driver();
        let block = test_block(&[]);
        let argv =
            driver.controller_argv(&block, &ControllerOptions::default());
        assert_eq!(
            argv,
            vec![
                "longhorn",
                "controller",
                "--listen",
                "0.0.0.0:9501",
                "--size",
                "10gb",
                "--current-size",
                "10gb",
                "--frontend",
                "tgt-blockdev",
                "v1",
            ]
        );
    }

    #[test]
    fn test_controller_argv_replicas_and_flags() {
        let driver = test_driver();
        let block = test_block(&[
            "tcp://10.0.0.11:10000",
            "tcp://10.0.0.12:10000",
        ]);
        let options = ControllerOptions {
            upgrade: true,
            disable_rev_counter: true,
            salvage_requested: false,
            unmap_mark_snap_chain_removed: true,
            snapshot_max_count: Some(100),
            snapshot_max_size: Some("2gb".to_string()),
            engine_replica_timeout: Some(8),
            data_server_protocol: Some("tcp".to_string()),
            file_sync_http_client_timeout: Some(30),
        };
        let argv = driver.controller_argv(&block, &options);
        assert_eq!(
            argv,
            vec![
                "longhorn",
                "controller",
                "--listen",
                "0.0.0.0:9501",
                "--size",
                "10gb",
                "--current-size",
                "10gb",
                "--frontend",
                "tgt-blockdev",
                "--replica",
                "tcp://10.0.0.11:10000",
                "--replica",
                "tcp://10.0.0.12:10000",
                "--upgrade",
                "--disableRevCounter",
                "--unmap-mark-snap-chain-removed",
                "--snapshot-max-count",
                "100",
                "--snapshot-max-size",
                "2gb",
                "--engine-replica-timeout",
                "8",
                "--data-server-protocol",
                "tcp",
                "--file-sync-http-client-timeout",
                "30",
                "v1",
            ]
        );
    }
}
