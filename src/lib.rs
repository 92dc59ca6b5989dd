/*!
 * # Block Orchestrator
 *
 * A control plane that provisions and operates replicated block-storage
 * volumes on a container-orchestration cluster.  Each logical volume (a
 * "block") is backed by one user-space engine controller process and N
 * replica processes, each in its own pod; the control plane drives their
 * lifecycle by issuing commands through the orchestrator's in-container
 * exec facility and by reacting to pod lifecycle events.
 *
 * The major components:
 *
 * * [`reconciler`] is the heart of the control plane.  It owns the entity
 *   store and the per-concern drivers and linearizes every mutation of a
 *   block behind the process-wide blocks lock.
 *   * [`reconciler::BlockOrchestrator`] is the assembled core.
 * * [`gateway`] issues engine CLI commands inside the controller container
 *   and parses their stringy output.
 * * [`engine`], [`replica`], and [`snapshot`] drive the controller pod,
 *   the replica pods, and the snapshot command family respectively.
 * * [`events`] maps orchestrator pod events onto affected blocks and runs
 *   the corresponding reconciliation.
 * * [`sim`] simulates every external collaborator (orchestrator, engine
 *   CLI, node terminal, substrate services) for tests and prototyping.
 * * [`server`] assembles all of the above behind the HTTP API defined in
 *   [`api_http_entrypoints`].
 */

pub mod api_config;
pub mod api_error;
pub mod api_http_entrypoints;
pub mod api_model;
pub mod datastore;
pub mod engine;
pub mod events;
pub mod gateway;
mod moniker;
pub mod orchestrator;
pub mod reconciler;
pub mod replica;
pub mod server;
pub mod sim;
pub mod snapshot;
pub mod substrate;

#[macro_use]
extern crate slog;
