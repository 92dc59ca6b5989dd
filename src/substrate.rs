/*!
 * Interfaces to the physical-substrate services
 *
 * Nodes, disks, and folders are owned elsewhere; the control plane consumes
 * them through these narrow traits.  The simulator in `sim.rs` implements
 * all of them in-process.
 */

use async_trait::async_trait;

use crate::api_error::ApiError;
use crate::api_model::Disk;
use crate::api_model::Folder;
use crate::api_model::Node;

/**
 * Resolves worker nodes by name.
 */
#[async_trait]
pub trait NodeService: Send + Sync {
    async fn node_lookup(&self, name: &str) -> Result<Node, ApiError>;
}

/**
 * Reports disks and answers placement queries.
 */
#[async_trait]
pub trait DiskService: Send + Sync {
    /** Lists the disks attached to one node. */
    async fn node_disks(&self, node: &str) -> Result<Vec<Disk>, ApiError>;

    /**
     * Returns up to `limit` disks in `cluster` with at least `budget_mib`
     * of free capacity, excluding the given disk ids, optionally restricted
     * to one node.
     */
    async fn available_disks(
        &self,
        cluster: &str,
        budget_mib: u64,
        exclude: &[String],
        node: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Disk>, ApiError>;
}

/**
 * Provisions and reclaims folders on disks.  Folders back pod hostPath
 * mounts for both replicas and block mount points.
 */
#[async_trait]
pub trait FolderService: Send + Sync {
    async fn provision(
        &self,
        disk: &Disk,
        prefix: &str,
    ) -> Result<Folder, ApiError>;

    async fn deprovision(&self, folder: &Folder) -> Result<(), ApiError>;
}
