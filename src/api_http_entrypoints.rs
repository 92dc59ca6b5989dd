/*!
 * Handler functions (entrypoints) for HTTP APIs
 */

use dropshot::endpoint;
use dropshot::ApiDescription;
use dropshot::HttpError;
use dropshot::HttpResponseCreated;
use dropshot::HttpResponseDeleted;
use dropshot::HttpResponseOk;
use dropshot::HttpResponseUpdatedNoContent;
use dropshot::Path;
use dropshot::Query;
use dropshot::RequestContext;
use dropshot::TypedBody;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::api_model::validate_replica_count;
use crate::api_model::validate_size;
use crate::api_model::BlockProvisionParams;
use crate::api_model::BlockUsage;
use crate::api_model::BlockView;
use crate::api_model::ControllerInfo;
use crate::api_model::ControllerOptions;
use crate::api_model::EngineReplicaView;
use crate::api_model::FormatOptions;
use crate::api_model::ReplicaMode;
use crate::api_model::SnapshotCloneParams;
use crate::server::ApiContext;

pub fn api_register_entrypoints(
    api: &mut ApiDescription<ApiContext>,
) -> Result<(), String> {
    api.register(api_blocks_get).map_err(|e| e.to_string())?;
    api.register(api_blocks_post).map_err(|e| e.to_string())?;
    api.register(api_blocks_get_block).map_err(|e| e.to_string())?;
    api.register(api_blocks_deprovision_block).map_err(|e| e.to_string())?;
    api.register(api_blocks_format_block).map_err(|e| e.to_string())?;
    api.register(api_blocks_mount_block).map_err(|e| e.to_string())?;
    api.register(api_blocks_unmount_block).map_err(|e| e.to_string())?;
    api.register(api_blocks_get_usage).map_err(|e| e.to_string())?;
    api.register(api_blocks_trim_block).map_err(|e| e.to_string())?;
    api.register(api_blocks_check_pods).map_err(|e| e.to_string())?;
    api.register(api_blocks_balance_block).map_err(|e| e.to_string())?;
    api.register(api_block_replicas_get).map_err(|e| e.to_string())?;
    api.register(api_block_replicas_delete_replica)
        .map_err(|e| e.to_string())?;
    api.register(api_block_replicas_put_mode).map_err(|e| e.to_string())?;
    api.register(api_block_replicas_get_rebuild_status)
        .map_err(|e| e.to_string())?;
    api.register(api_block_replicas_verify_rebuild)
        .map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_create).map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_get).map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_revert).map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_remove).map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_purge).map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_get_purge_status)
        .map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_get_info).map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_clone).map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_get_clone_status)
        .map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_hash).map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_hash_cancel)
        .map_err(|e| e.to_string())?;
    api.register(api_block_snapshots_get_hash_status)
        .map_err(|e| e.to_string())?;
    api.register(api_block_controller_post).map_err(|e| e.to_string())?;
    api.register(api_block_controller_delete).map_err(|e| e.to_string())?;
    api.register(api_block_controller_get_info)
        .map_err(|e| e.to_string())?;
    api.register(api_block_controller_expand).map_err(|e| e.to_string())?;
    api.register(api_block_controller_frontend_start)
        .map_err(|e| e.to_string())?;
    api.register(api_block_controller_frontend_shutdown)
        .map_err(|e| e.to_string())?;

    Ok(())
}

#[derive(Deserialize, JsonSchema)]
struct BlockPathParam {
    /** The block's unique ID. */
    block_id: Uuid,
}

#[derive(Deserialize, JsonSchema)]
struct ReplicaPathParam {
    block_id: Uuid,
    replica_id: Uuid,
}

#[derive(Deserialize, JsonSchema)]
struct ForceParam {
    force: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct SnapshotSelector {
    name: String,
}

#[derive(Deserialize, JsonSchema)]
struct SnapshotNameParams {
    name: String,
}

#[derive(Deserialize, JsonSchema)]
struct SnapshotPurgeParams {
    #[serde(rename = "skipIfInProgress")]
    skip_if_in_progress: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct ReplicaModeParams {
    mode: ReplicaMode,
}

#[derive(Serialize, JsonSchema)]
struct SnapshotNameView {
    name: String,
}

#[derive(Serialize, JsonSchema)]
struct SnapshotListView {
    snapshots: Vec<String>,
}

#[derive(Serialize, JsonSchema)]
struct CommandOutputView {
    output: String,
}

/*
 * Blocks
 */

/**
 * List all blocks.  Soft-deleted blocks are not included.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks",
}]
async fn api_blocks_get(
    rqctx: RequestContext<ApiContext>,
) -> Result<HttpResponseOk<Vec<BlockView>>, HttpError> {
    let apictx = rqctx.context();
    let blocks = apictx.orchestrator.blocks_list().await?;
    Ok(HttpResponseOk(blocks.iter().map(|b| b.to_view()).collect()))
}

/**
 * Provision a new block: entity, controller pod, and replica pods.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks",
}]
async fn api_blocks_post(
    rqctx: RequestContext<ApiContext>,
    new_block: TypedBody<BlockProvisionParams>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let params = new_block.into_inner();
    let config = apictx.orchestrator.config();
    let size =
        validate_size(params.size.unwrap_or(config.default_size))?;
    let replicas = validate_replica_count(
        params.replicas.unwrap_or(config.replica_count),
    )?;
    if params.node.is_empty() {
        return Err(HttpError::for_bad_request(
            Some(String::from("InvalidValue")),
            String::from("node must not be empty"),
        ));
    }
    let block = apictx
        .orchestrator
        .block_provision(params.name, &params.node, size, replicas)
        .await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Fetch a specific block.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}",
}]
async fn api_blocks_get_block(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let block =
        apictx.orchestrator.block_lookup(&path.block_id).await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Deprovision a block.  Fails with 409 while the block is mounted.
 */
#[endpoint {
    method = DELETE,
    path = "/v1/storage/blocks/{block_id}/deprovision",
}]
async fn api_blocks_deprovision_block(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseDeleted, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    apictx.orchestrator.block_deprovision(&path.block_id).await?;
    Ok(HttpResponseDeleted())
}

/**
 * Format the block device.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/format",
}]
async fn api_blocks_format_block(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    query_params: Query<ForceParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let query = query_params.into_inner();
    let options = FormatOptions {
        force: query.force.unwrap_or(false),
        ..FormatOptions::default()
    };
    let block = apictx
        .orchestrator
        .block_format(&path.block_id, &options)
        .await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Mount the block device at its mount-point folder.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/mount",
}]
async fn api_blocks_mount_block(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    query_params: Query<ForceParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let query = query_params.into_inner();
    let block = apictx
        .orchestrator
        .block_mount(&path.block_id, query.force.unwrap_or(false))
        .await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Unmount the block device.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/unmount",
}]
async fn api_blocks_unmount_block(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    query_params: Query<ForceParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let query = query_params.into_inner();
    let block = apictx
        .orchestrator
        .block_unmount(&path.block_id, query.force.unwrap_or(false))
        .await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Report filesystem usage for the block and its replica folders.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/usage",
}]
async fn api_blocks_get_usage(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<BlockUsage>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let usage = apictx.orchestrator.block_usage(&path.block_id).await?;
    Ok(HttpResponseOk(usage))
}

/**
 * Discard unused filesystem blocks on the mounted volume.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/trim",
}]
async fn api_blocks_trim_block(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    apictx.orchestrator.block_trim(&path.block_id).await?;
    Ok(HttpResponseUpdatedNoContent())
}

/**
 * Run one reconciliation pass against observed pod state.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/check-pods",
}]
async fn api_blocks_check_pods(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let block =
        apictx.orchestrator.block_check_pods(&path.block_id).await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Reconcile the replica list toward the configured replica count.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/balance",
}]
async fn api_blocks_balance_block(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let block =
        apictx.orchestrator.block_balance(&path.block_id).await?;
    Ok(HttpResponseOk(block.to_view()))
}

/*
 * Replicas
 */

/**
 * List the engine's replica set, joined with stored replicas.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/replicas",
}]
async fn api_block_replicas_get(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<Vec<EngineReplicaView>>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let replicas =
        apictx.orchestrator.replica_list(&path.block_id).await?;
    Ok(HttpResponseOk(replicas))
}

/**
 * Remove a replica from the block.  Removing the last replica requires
 * `force=true`.
 */
#[endpoint {
    method = DELETE,
    path = "/v1/storage/blocks/{block_id}/replicas/{replica_id}",
}]
async fn api_block_replicas_delete_replica(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<ReplicaPathParam>,
    query_params: Query<ForceParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let query = query_params.into_inner();
    let block = apictx
        .orchestrator
        .replica_remove(
            &path.block_id,
            &path.replica_id,
            query.force.unwrap_or(false),
        )
        .await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Set the engine-side mode of a replica.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/replicas/{replica_id}/mode",
}]
async fn api_block_replicas_put_mode(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<ReplicaPathParam>,
    body: TypedBody<ReplicaModeParams>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let params = body.into_inner();
    let block = apictx
        .orchestrator
        .replica_update_mode(&path.block_id, &path.replica_id, params.mode)
        .await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Read the engine's rebuild progress report for a replica.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/replicas/{replica_id}/rebuild-status",
}]
async fn api_block_replicas_get_rebuild_status(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<ReplicaPathParam>,
) -> Result<HttpResponseOk<CommandOutputView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let output = apictx
        .orchestrator
        .replica_rebuild_status(&path.block_id, &path.replica_id)
        .await?;
    Ok(HttpResponseOk(CommandOutputView { output }))
}

/**
 * Ask the engine to verify a completed rebuild.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/replicas/{replica_id}/verify-rebuild",
}]
async fn api_block_replicas_verify_rebuild(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<ReplicaPathParam>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    apictx
        .orchestrator
        .replica_verify_rebuild(&path.block_id, &path.replica_id)
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

/*
 * Snapshots
 *
 * Snapshot names are passed in request bodies and query strings rather
 * than path segments.
 */

/**
 * Create a snapshot; returns the engine-assigned name.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/snapshots/create",
}]
async fn api_block_snapshots_create(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<SnapshotNameView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let name =
        apictx.orchestrator.snapshot_create(&path.block_id).await?;
    Ok(HttpResponseOk(SnapshotNameView { name }))
}

/**
 * List snapshot names.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/snapshots/list",
}]
async fn api_block_snapshots_get(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<SnapshotListView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let snapshots =
        apictx.orchestrator.snapshot_list(&path.block_id).await?;
    Ok(HttpResponseOk(SnapshotListView { snapshots }))
}

/**
 * Revert the volume to a snapshot.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/snapshots/revert",
}]
async fn api_block_snapshots_revert(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    body: TypedBody<SnapshotNameParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let params = body.into_inner();
    apictx
        .orchestrator
        .snapshot_revert(&path.block_id, &params.name)
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

/**
 * Remove a snapshot by name.
 */
#[endpoint {
    method = DELETE,
    path = "/v1/storage/blocks/{block_id}/snapshots/remove",
}]
async fn api_block_snapshots_remove(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    query_params: Query<SnapshotSelector>,
) -> Result<HttpResponseDeleted, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let query = query_params.into_inner();
    apictx
        .orchestrator
        .snapshot_remove(&path.block_id, &query.name)
        .await?;
    Ok(HttpResponseDeleted())
}

/**
 * Schedule a purge of removed snapshots.  Poll purge-status for
 * completion.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/snapshots/purge",
}]
async fn api_block_snapshots_purge(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    query_params: Query<SnapshotPurgeParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let query = query_params.into_inner();
    apictx
        .orchestrator
        .snapshot_purge(
            &path.block_id,
            query.skip_if_in_progress.unwrap_or(false),
        )
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

/**
 * Report per-replica purge progress.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/snapshots/purge-status",
}]
async fn api_block_snapshots_get_purge_status(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<serde_json::Value>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let status = apictx
        .orchestrator
        .snapshot_purge_status(&path.block_id)
        .await?;
    Ok(HttpResponseOk(status))
}

/**
 * Report the snapshot chain as the engine sees it.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/snapshots/info",
}]
async fn api_block_snapshots_get_info(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<serde_json::Value>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let info =
        apictx.orchestrator.snapshot_info(&path.block_id).await?;
    Ok(HttpResponseOk(info))
}

/**
 * Clone a snapshot from another volume's controller.  Poll clone-status
 * for completion.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/snapshots/clone",
}]
async fn api_block_snapshots_clone(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    body: TypedBody<SnapshotCloneParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let params = body.into_inner();
    apictx
        .orchestrator
        .snapshot_clone(&path.block_id, &params)
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

/**
 * Report clone progress for a snapshot.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/snapshots/clone-status",
}]
async fn api_block_snapshots_get_clone_status(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    query_params: Query<SnapshotSelector>,
) -> Result<HttpResponseOk<CommandOutputView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let query = query_params.into_inner();
    let output = apictx
        .orchestrator
        .snapshot_clone_status(&path.block_id, &query.name)
        .await?;
    Ok(HttpResponseOk(CommandOutputView { output }))
}

/**
 * Schedule a content hash of a snapshot.  Poll hash-status for the
 * digest.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/snapshots/hash",
}]
async fn api_block_snapshots_hash(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    body: TypedBody<SnapshotNameParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let params = body.into_inner();
    apictx
        .orchestrator
        .snapshot_hash(&path.block_id, &params.name)
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

/**
 * Cancel an in-progress snapshot hash.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/snapshots/hash-cancel",
}]
async fn api_block_snapshots_hash_cancel(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    body: TypedBody<SnapshotNameParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let params = body.into_inner();
    apictx
        .orchestrator
        .snapshot_hash_cancel(&path.block_id, &params.name)
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

/**
 * Report hash progress and digest for a snapshot.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/snapshots/hash-status",
}]
async fn api_block_snapshots_get_hash_status(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    query_params: Query<SnapshotSelector>,
) -> Result<HttpResponseOk<serde_json::Value>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let query = query_params.into_inner();
    let status = apictx
        .orchestrator
        .snapshot_hash_status(&path.block_id, &query.name)
        .await?;
    Ok(HttpResponseOk(status))
}

/*
 * Controller
 */

/**
 * Create the engine controller pod for a block.  Fails with 409 if the
 * block already has one.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/controller",
}]
async fn api_block_controller_post(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
    body: TypedBody<ControllerOptions>,
) -> Result<HttpResponseCreated<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let options = body.into_inner();
    let block = apictx
        .orchestrator
        .controller_create(&path.block_id, &options)
        .await?;
    Ok(HttpResponseCreated(block.to_view()))
}

/**
 * Delete the engine controller pod.  Fails while the block is mounted.
 */
#[endpoint {
    method = DELETE,
    path = "/v1/storage/blocks/{block_id}/controller",
}]
async fn api_block_controller_delete(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let block =
        apictx.orchestrator.controller_delete(&path.block_id).await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Read the engine's view of frontend state and device endpoint.
 */
#[endpoint {
    method = GET,
    path = "/v1/storage/blocks/{block_id}/controller/info",
}]
async fn api_block_controller_get_info(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<ControllerInfo>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let info =
        apictx.orchestrator.controller_info(&path.block_id).await?;
    Ok(HttpResponseOk(info))
}

/**
 * Expand the volume to its configured size.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/controller/expand",
}]
async fn api_block_controller_expand(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    apictx.orchestrator.controller_expand(&path.block_id).await?;
    Ok(HttpResponseUpdatedNoContent())
}

/**
 * Start the frontend, then refresh frontend state.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/controller/frontend/start",
}]
async fn api_block_controller_frontend_start(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let block =
        apictx.orchestrator.frontend_start(&path.block_id).await?;
    Ok(HttpResponseOk(block.to_view()))
}

/**
 * Shut the frontend down, then refresh frontend state.
 */
#[endpoint {
    method = POST,
    path = "/v1/storage/blocks/{block_id}/controller/frontend/shutdown",
}]
async fn api_block_controller_frontend_shutdown(
    rqctx: RequestContext<ApiContext>,
    path_params: Path<BlockPathParam>,
) -> Result<HttpResponseOk<BlockView>, HttpError> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let block =
        apictx.orchestrator.frontend_shutdown(&path.block_id).await?;
    Ok(HttpResponseOk(block.to_view()))
}
