/*!
 * Snapshot operator
 *
 * Drives the engine's snapshot CLI family.  Every operation requires the
 * block to be online, since the commands run inside the controller
 * container.
 *
 * Purge (and likewise hash and clone) is asynchronous on the engine side:
 * the command returns once the work is scheduled and callers poll the
 * corresponding status operation.  The engine prunes a purged snapshot
 * against the volume head and serializes pruning after sibling coalescing;
 * this operator reports whatever the engine returns and enforces none of
 * that itself.
 */

use slog::Logger;
use std::sync::Arc;

use crate::api_error::ApiError;
use crate::api_model::Block;
use crate::api_model::SnapshotCloneParams;
use crate::gateway::parse_json_document;
use crate::gateway::parse_snapshot_list;
use crate::gateway::CommandGateway;

pub struct SnapshotOperator {
    gateway: Arc<CommandGateway>,
    log: Logger,
}

impl SnapshotOperator {
    pub fn new(gateway: Arc<CommandGateway>, log: Logger) -> SnapshotOperator {
        SnapshotOperator { gateway, log }
    }

    fn ensure_online(block: &Block) -> Result<(), ApiError> {
        if !block.online {
            return Err(ApiError::BlockOffline {
                block: block.name.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn argv(tail: &[&str]) -> Vec<String> {
        let mut argv =
            vec![String::from("longhorn"), String::from("snapshots")];
        argv.extend(tail.iter().map(|s| s.to_string()));
        argv
    }

    /** Creates a snapshot and returns its engine-assigned name. */
    pub async fn create(&self, block: &Block) -> Result<String, ApiError> {
        SnapshotOperator::ensure_online(block)?;
        let output = self
            .gateway
            .exec_checked(block, SnapshotOperator::argv(&["create"]))
            .await?;
        let name = output.stdout.trim().to_string();
        info!(self.log, "created snapshot";
            "block" => block.name.as_str(),
            "snapshot" => %name);
        Ok(name)
    }

    pub async fn revert(
        &self,
        block: &Block,
        name: &str,
    ) -> Result<(), ApiError> {
        SnapshotOperator::ensure_online(block)?;
        self.gateway
            .exec_checked(block, SnapshotOperator::argv(&["revert", name]))
            .await?;
        Ok(())
    }

    pub async fn list(&self, block: &Block) -> Result<Vec<String>, ApiError> {
        SnapshotOperator::ensure_online(block)?;
        let output = self
            .gateway
            .exec_checked(block, SnapshotOperator::argv(&["ls"]))
            .await?;
        Ok(parse_snapshot_list(&output.stdout))
    }

    pub async fn remove(
        &self,
        block: &Block,
        name: &str,
    ) -> Result<(), ApiError> {
        SnapshotOperator::ensure_online(block)?;
        self.gateway
            .exec_checked(block, SnapshotOperator::argv(&["rm", name]))
            .await?;
        Ok(())
    }

    /**
     * Schedules a purge of removed snapshots.  Asynchronous: poll
     * [`SnapshotOperator::purge_status`] for completion.
     */
    pub async fn purge(
        &self,
        block: &Block,
        skip_if_in_progress: bool,
    ) -> Result<(), ApiError> {
        SnapshotOperator::ensure_online(block)?;
        let tail: &[&str] = if skip_if_in_progress {
            &["purge", "--skip-if-in-progress"]
        } else {
            &["purge"]
        };
        self.gateway
            .exec_checked(block, SnapshotOperator::argv(tail))
            .await?;
        Ok(())
    }

    pub async fn purge_status(
        &self,
        block: &Block,
    ) -> Result<serde_json::Value, ApiError> {
        SnapshotOperator::ensure_online(block)?;
        let output = self
            .gateway
            .exec_checked(block, SnapshotOperator::argv(&["purge-status"]))
            .await?;
        parse_json_document(&output.stdout)
    }

    pub async fn info(
        &self,
        block: &Block,
    ) -> Result<serde_json::Value, ApiError> {
        SnapshotOperator::ensure_online(block)?;
        let output = self
            .gateway
            .exec_checked(block, SnapshotOperator::argv(&["info"]))
            .await?;
        parse_json_document(&output.stdout)
    }

    /**
     * Clones a snapshot from another volume's controller.  Asynchronous:
     * poll [`SnapshotOperator::clone_status`] for completion.
     */
    pub async fn clone(
        &self,
        block: &Block,
        params: &SnapshotCloneParams,
    ) -> Result<(), ApiError> {
        SnapshotOperator::ensure_online(block)?;
        self.gateway
            .exec_checked(
                block,
                SnapshotOperator::argv(&[
                    "clone",
                    "--snapshot-name",
                    &params.snapshot_name,
                    "--from-controller-address",
                    &params.from_controller_address,
                    "--from-volume-name",
                    &params.from_volume_name,
                    "--from-controller-instance-name",
                    &params.from_controller_instance_name,
                ]),
            )
            .await?;
        Ok(())
    }

    pub async fn clone_status(
        &self,
        block: &Block,
        name: &str,
    ) -> Result<String, ApiError> {
        SnapshotOperator::ensure_online(block)?;
        let output = self
            .gateway
            .exec_checked(
                block,
                SnapshotOperator::argv(&["clone-status", name]),
            )
            .await?;
        Ok(output.stdout)
    }

    /**
     * Schedules a content hash of a snapshot.  Asynchronous: poll
     * [`SnapshotOperator::hash_status`] for the digest.
     */
    pub async fn hash(
        &self,
        block: &Block,
        name: &str,
    ) -> Result<(), ApiError> {
        SnapshotOperator::ensure_online(block)?;
        self.gateway
            .exec_checked(block, SnapshotOperator::argv(&["hash", name]))
            .await?;
        Ok(())
    }

    pub async fn hash_cancel(
        &self,
        block: &Block,
        name: &str,
    ) -> Result<(), ApiError> {
        SnapshotOperator::ensure_online(block)?;
        self.gateway
            .exec_checked(
                block,
                SnapshotOperator::argv(&["hash-cancel", name]),
            )
            .await?;
        Ok(())
    }

    pub async fn hash_status(
        &self,
        block: &Block,
        name: &str,
    ) -> Result<serde_json::Value, ApiError> {
        SnapshotOperator::ensure_online(block)?;
        let output = self
            .gateway
            .exec_checked(
                block,
                SnapshotOperator::argv(&["hash-status", name]),
            )
            .await?;
        parse_json_document(&output.stdout)
    }
}
