/*!
 * Pod-event multiplexing
 *
 * Maps orchestrator pod events onto the blocks they affect and runs the
 * corresponding reconciliation under the blocks lock.  Events for the same
 * block are processed in arrival order; an event for a pod no live block
 * owns is dropped after the owner lookup.
 *
 * Error policy: substrate and engine failures during dispatch are logged
 * and the handler continues; entity-store failures abort the handler (the
 * lock is released on every exit path by guard drop).
 */

use futures::channel::mpsc::UnboundedReceiver;
use futures::stream::StreamExt;
use slog::Logger;
use std::sync::Arc;

use crate::api_error::ApiError;
use crate::api_model::AddReplicaOptions;
use crate::api_model::Block;
use crate::api_model::Replica;
use crate::api_model::ReplicaStatus;
use crate::orchestrator::PodEvent;
use crate::reconciler::BlockOrchestrator;

pub struct EventDispatcher {
    core: Arc<BlockOrchestrator>,
    namespace: String,
    log: Logger,
}

impl EventDispatcher {
    pub fn new(core: Arc<BlockOrchestrator>, log: Logger) -> EventDispatcher {
        let namespace = core.config().namespace.clone();
        EventDispatcher { core, namespace, log }
    }

    /**
     * Drains the orchestrator's event stream until it closes.  Intended to
     * be spawned as a background task by the server.
     */
    pub async fn run(self: Arc<Self>, mut rx: UnboundedReceiver<PodEvent>) {
        while let Some(event) = rx.next().await {
            if let Err(e) = self.handle_event(&event).await {
                error!(self.log, "pod event handler failed";
                    "pod" => %event.pod.name,
                    "error" => %e);
            }
        }
        info!(self.log, "pod event stream closed");
    }

    /**
     * Processes one pod event to completion: filter by namespace, resolve
     * the owning block, dispatch under the blocks lock.
     */
    pub async fn handle_event(
        &self,
        event: &PodEvent,
    ) -> Result<(), ApiError> {
        if event.pod.namespace != self.namespace {
            return Ok(());
        }

        let _guard = self.core.lock_blocks().await;

        let Some(block) =
            self.core.store.block_find_by_pod(&event.pod.uid).await
        else {
            return Ok(());
        };

        if block.controller.as_deref() == Some(event.pod.uid.as_str()) {
            self.dispatch_controller(&block, event).await
        } else {
            let Some(replica) = block
                .replicas
                .iter()
                .find(|r| r.pod.as_deref() == Some(event.pod.uid.as_str()))
                .cloned()
            else {
                return Ok(());
            };
            self.dispatch_replica(&block, &replica, event).await
        }
    }

    async fn dispatch_controller(
        &self,
        block: &Arc<Block>,
        event: &PodEvent,
    ) -> Result<(), ApiError> {
        if event.pod.is_running() && !block.online {
            info!(self.log, "controller pod running";
                "block" => block.name.as_str());
            let mut current = self
                .core
                .store
                .block_update(&block.id, |b| b.online = true)
                .await?;

            for replica in current.replicas.clone() {
                match self
                    .core
                    .replicas
                    .add_to_frontend(
                        &current,
                        &replica,
                        &AddReplicaOptions::default(),
                    )
                    .await
                {
                    Ok(block) => current = block,
                    Err(e) => {
                        warn!(self.log, "failed to attach replica";
                            "block" => current.name.as_str(),
                            "replica" => %replica.name,
                            "error" => %e);
                    }
                }
            }

            if let Err(e) =
                self.core.update_frontend_state_locked(&current).await
            {
                warn!(self.log, "frontend state refresh failed";
                    "block" => current.name.as_str(),
                    "error" => %e);
            }
        } else if event.is_terminating() && block.online {
            info!(self.log, "controller pod terminating";
                "block" => block.name.as_str());
            self.core
                .store
                .block_update(&block.id, |b| {
                    b.online = false;
                    b.mounted = false;
                    b.frontend_state = false;
                    b.device = None;
                })
                .await?;
        }
        Ok(())
    }

    async fn dispatch_replica(
        &self,
        block: &Arc<Block>,
        replica: &Replica,
        event: &PodEvent,
    ) -> Result<(), ApiError> {
        if event.pod.is_running() && !replica.healthy {
            info!(self.log, "replica pod running";
                "block" => block.name.as_str(),
                "replica" => %replica.name);
            let replica_id = replica.id;
            let ip = event.pod.pod_ip.clone();
            let current = self
                .core
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

            let current = match current.replica(&replica.id).cloned() {
                Some(replica) => {
                    match self
                        .core
                        .replicas
                        .add_to_frontend(
                            &current,
                            &replica,
                            &AddReplicaOptions::default(),
                        )
                        .await
                    {
                        Ok(block) => block,
                        Err(e) => {
                            warn!(self.log, "failed to attach replica";
                                "replica" => %replica.name,
                                "error" => %e);
                            current
                        }
                    }
                }
                None => current,
            };

            if let Err(e) =
                self.core.update_frontend_state_locked(&current).await
            {
                warn!(self.log, "frontend state refresh failed";
                    "block" => current.name.as_str(),
                    "error" => %e);
            }
        } else if event.is_terminating() && replica.healthy {
            info!(self.log, "replica pod terminating";
                "block" => block.name.as_str(),
                "replica" => %replica.name);
            /*
             * Always attempt the detach, even for a replica that never
             * made it into the engine's set (healthy but not attached);
             * the failure is logged like any other dispatch step.
             */
            if let Err(e) = self
                .core
                .replicas
                .remove_from_frontend(block, replica)
                .await
            {
                warn!(self.log, "failed to detach replica";
                    "replica" => %replica.name,
                    "error" => %e);
            }

            let replica_id = replica.id;
            let current = self
                .core
                .store
                .block_update(&block.id, move |b| {
                    if let Some(r) = b.replica_mut(&replica_id) {
                        r.clear_network();
                        r.healthy = false;
                        r.attached = false;
                        r.status = ReplicaStatus::Unhealthy;
                    }
                })
                .await?;

            if let Err(e) =
                self.core.update_frontend_state_locked(&current).await
            {
                warn!(self.log, "frontend state refresh failed";
                    "block" => current.name.as_str(),
                    "error" => %e);
            }
        }
        Ok(())
    }
}
