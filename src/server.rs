/*!
 * Server-wide state and assembly
 */

use slog::Logger;
use std::sync::Arc;

use crate::api_config::ApiServerConfig;
use crate::api_http_entrypoints::api_register_entrypoints;
use crate::events::EventDispatcher;
use crate::orchestrator::OrchestratorApi;
use crate::reconciler::BlockOrchestrator;
use crate::sim::SimBackend;

/**
 * Shared state available to all API request handlers
 */
#[derive(Clone)]
pub struct ApiContext {
    /** the block orchestrator servicing requests */
    pub orchestrator: Arc<BlockOrchestrator>,
}

/**
 * Builds the orchestrator core on top of the simulated substrate and wires
 * the pod-event pump to it.  A client for a real cluster would be swapped
 * in here; see `orchestrator.rs`.
 */
async fn assemble(
    config: &ApiServerConfig,
    log: &Logger,
) -> Arc<BlockOrchestrator> {
    let backend =
        Arc::new(SimBackend::new_seeded(log.new(o!("component" => "sim"))));
    let orchestrator_clone = Arc::clone(&backend);
    let orchestrator_backend: Arc<dyn OrchestratorApi> = orchestrator_clone;
    let terminal_clone = Arc::clone(&backend);
    let terminal_backend: Arc<dyn crate::orchestrator::NodeTerminal> = terminal_clone;
    let nodes_clone = Arc::clone(&backend);
    let nodes_backend: Arc<dyn crate::substrate::NodeService> = nodes_clone;
    let disks_clone = Arc::clone(&backend);
    let disks_backend: Arc<dyn crate::substrate::DiskService> = disks_clone;
    let folders_clone = Arc::clone(&backend);
    let folders_backend: Arc<dyn crate::substrate::FolderService> = folders_clone;
    let core = Arc::new(BlockOrchestrator::new(
        config.storage.blocks.clone(),
        orchestrator_backend,
        terminal_backend,
        nodes_backend,
        disks_backend,
        folders_backend,
        log.new(o!("component" => "orchestrator")),
    ));

    let events = backend.pod_events().await;
    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::clone(&core),
        log.new(o!("component" => "events")),
    ));
    tokio::spawn(dispatcher.run(events));

    core
}

/**
 * Runs the API server until it fails or is shut down.
 */
pub async fn run_server(config: &ApiServerConfig) -> Result<(), String> {
    let log = config
        .log
        .to_logger("block-orchestrator")
        .map_err(|error| format!("initializing logger: {}", error))?;
    info!(log, "starting server");

    let orchestrator = assemble(config, &log).await;

    let mut api = dropshot::ApiDescription::new();
    api_register_entrypoints(&mut api)?;

    let server = dropshot::HttpServerStarter::new(
        &config.dropshot,
        api,
        ApiContext { orchestrator },
        &log,
    )
    .map_err(|error| format!("initializing server: {}", error))?
    .start();

    server.await
}

/**
 * Prints the OpenAPI description of the external API and exits.
 */
pub fn run_openapi() -> Result<(), String> {
    let mut api = dropshot::ApiDescription::new();
    api_register_entrypoints(&mut api)?;
    api.openapi("Block Storage API", "0.1.0")
        .write(&mut std::io::stdout())
        .map_err(|error| format!("writing OpenAPI description: {}", error))
}
