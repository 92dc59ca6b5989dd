/*!
 * Shared setup for the integration tests: an orchestrator core wired to a
 * simulated substrate, plus helpers for walking a block through its
 * lifecycle.
 */

use slog::o;
use slog::Discard;
use slog::Logger;
use std::convert::TryFrom;
use std::sync::Arc;

use block_orchestrator::api_config::BlocksConfig;
use block_orchestrator::api_model::Block;
use block_orchestrator::api_model::Gibibytes;
use block_orchestrator::api_model::Name;
use block_orchestrator::events::EventDispatcher;
use block_orchestrator::orchestrator::NodeTerminal;
use block_orchestrator::orchestrator::OrchestratorApi;
use block_orchestrator::reconciler::BlockOrchestrator;
use block_orchestrator::sim::SimBackend;
use block_orchestrator::sim::SimBackendBuilder;
use block_orchestrator::sim::SimBackendTestInterfaces;
use block_orchestrator::substrate::DiskService;
use block_orchestrator::substrate::FolderService;
use block_orchestrator::substrate::NodeService;

pub struct TestContext {
    pub sim: Arc<SimBackend>,
    pub core: Arc<BlockOrchestrator>,
    pub dispatcher: EventDispatcher,
}

pub fn test_config() -> BlocksConfig {
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

/**
 * Builds a test context over a simulated cluster with `ndisks` nodes, one
 * 64 GiB disk each.
 */
pub fn test_setup(ndisks: usize) -> TestContext {
    let log = Logger::root(Discard, o!());
    let mut builder = SimBackendBuilder::new(log.clone());
    for i in 1..=ndisks {
        let node = format!("n-{}", i);
        builder = builder
            .node(&node, &format!("host-{}", i))
            .disk(&format!("disk-{}", i), &node, 64 * 1024);
    }
    let sim = Arc::new(builder.build());
    let orchestrator_clone = Arc::clone(&sim);
    let orchestrator_backend: Arc<dyn OrchestratorApi> = orchestrator_clone;
    let terminal_clone = Arc::clone(&sim);
    let terminal_backend: Arc<dyn NodeTerminal> = terminal_clone;
    let nodes_clone = Arc::clone(&sim);
    let nodes_backend: Arc<dyn NodeService> = nodes_clone;
    let disks_clone = Arc::clone(&sim);
    let disks_backend: Arc<dyn DiskService> = disks_clone;
    let folders_clone = Arc::clone(&sim);
    let folders_backend: Arc<dyn FolderService> = folders_clone;
    let core = Arc::new(BlockOrchestrator::new(
        test_config(),
        orchestrator_backend,
        terminal_backend,
        nodes_backend,
        disks_backend,
        folders_backend,
        log.clone(),
    ));
    let dispatcher = EventDispatcher::new(Arc::clone(&core), log);
    TestContext { sim, core, dispatcher }
}

pub fn name(value: &str) -> Name {
    Name::try_from(value).unwrap()
}

/**
 * Provisions a block and returns it: controller and replica pods exist but
 * are still Pending.
 */
pub async fn provision(
    ctx: &TestContext,
    block_name: &str,
    replicas: u32,
) -> Arc<Block> {
    ctx.core
        .block_provision(name(block_name), "n-1", Gibibytes::new(10), replicas)
        .await
        .expect("expected provision to succeed")
}

/**
 * Walks every pod of a freshly-provisioned block to Running (replicas
 * first, then the controller, as the pods would typically come up) and
 * dispatches the corresponding events.  Replica ips are assigned
 * `10.0.0.11`, `10.0.0.12`, ...
 */
pub async fn bring_up(ctx: &TestContext, block: &Block) -> Arc<Block> {
    for (i, replica) in block.replicas.iter().enumerate() {
        let ip = format!("10.0.0.{}", 11 + i);
        let event =
            ctx.sim.pod_set_running(&replica.name, Some(&ip)).await;
        ctx.dispatcher
            .handle_event(&event)
            .await
            .expect("expected replica event dispatch to succeed");
    }
    let event = ctx
        .sim
        .pod_set_running(block.name.as_str(), None)
        .await;
    ctx.dispatcher
        .handle_event(&event)
        .await
        .expect("expected controller event dispatch to succeed");
    ctx.core
        .block_lookup(&block.id)
        .await
        .expect("expected block to exist after bring-up")
}

/**
 * Asserts the state-machine ordering invariants: a mounted block is
 * formatted with its frontend up and online, a live frontend implies an
 * online controller, and a block without a controller is neither online
 * nor mounted.
 */
pub fn assert_state_invariant(block: &Block) {
    if block.mounted {
        assert!(block.formatted, "mounted block must be formatted");
        assert!(block.frontend_state, "mounted block needs frontend up");
        assert!(block.online, "mounted block must be online");
    }
    if block.frontend_state {
        assert!(block.online, "frontend cannot be up while offline");
    }
    if block.controller.is_none() {
        assert!(!block.online && !block.mounted);
    }

    /* no two replicas share a name or an endpoint */
    for (i, a) in block.replicas.iter().enumerate() {
        for b in block.replicas.iter().skip(i + 1) {
            assert_ne!(a.name, b.name);
            if a.endpoint.is_some() {
                assert_ne!(a.endpoint, b.endpoint);
            }
        }
        /* endpoint and ip are derived together */
        assert_eq!(a.ip.is_none(), a.endpoint.is_none());
    }
}
