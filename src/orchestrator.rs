/*!
 * Interfaces to the container orchestrator and the node terminal
 *
 * The control plane drives pods through this boundary: pod CRUD, the
 * in-container exec facility, and the pod lifecycle event stream.
 *
 * **It's important to be careful about the interface exposed here.**  The
 * intent is for it to be implemented using requests to a remote cluster
 * API; the implementation in this repo is the simulator in `sim.rs`.  The
 * tighter the coupling that exists now, the harder a real client will be to
 * drop in later.
 */

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedReceiver;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::api_error::ApiError;

/**
 * Lifecycle phase of a pod, as reported by the orchestrator.
 */
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/**
 * A pod as seen through the orchestrator API.  `uid` is the opaque handle
 * persisted on block entities; `terminating` reflects the presence of a
 * deletion timestamp.
 */
#[derive(Clone, Debug)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    pub phase: PodPhase,
    pub pod_ip: Option<String>,
    pub terminating: bool,
}

impl Pod {
    /** True if the pod is in Running phase and not being torn down. */
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running && !self.terminating
    }
}

/** A hostPath volume mount in a pod spec. */
#[derive(Clone, Debug)]
pub struct HostPathMount {
    pub host_path: String,
    pub container_path: String,
}

impl HostPathMount {
    pub fn new(host_path: &str, container_path: &str) -> HostPathMount {
        HostPathMount {
            host_path: host_path.to_string(),
            container_path: container_path.to_string(),
        }
    }
}

/** Restart policy for a pod's containers. */
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartPolicy {
    Always,
    Never,
}

/**
 * The subset of a pod spec the control plane submits: a single container
 * with an argv, hostPath mounts, TCP container ports, and node pinning.
 */
#[derive(Clone, Debug)]
pub struct PodSpec {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    pub image: String,
    pub args: Vec<String>,
    pub privileged: bool,
    pub host_paths: Vec<HostPathMount>,
    pub ports: Vec<u16>,
    pub restart_policy: RestartPolicy,
    pub labels: BTreeMap<String, String>,
}

/** The kind of a pod lifecycle event. */
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

/** A pod lifecycle event delivered by the orchestrator's watch stream. */
#[derive(Clone, Debug)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub pod: Pod,
}

impl PodEvent {
    /** True if this event reports the pod entering teardown. */
    pub fn is_terminating(&self) -> bool {
        self.pod.terminating || self.kind == PodEventKind::Deleted
    }
}

/**
 * Captured output of an exec'd command.
 */
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/**
 * Client interface to the container orchestrator.
 */
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /** Reads a pod, returning `None` if no such pod exists. */
    async fn pod_read(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Pod>, ApiError>;

    /** Submits a pod for scheduling. */
    async fn pod_create(
        &self,
        cluster: &str,
        spec: PodSpec,
    ) -> Result<Pod, ApiError>;

    /** Deletes a pod by name. */
    async fn pod_delete(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ApiError>;

    /**
     * Runs `argv` inside the single container of the named pod, streaming
     * until the command exits.  This can take many seconds.
     */
    async fn exec(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
        argv: &[String],
    ) -> Result<ExecOutput, ApiError>;

    /**
     * Subscribes to the pod lifecycle event stream.  Events arrive for all
     * namespaces; filtering happens in the event multiplexer.
     */
    async fn pod_events(&self) -> UnboundedReceiver<PodEvent>;
}

/**
 * Shell access on a bare worker node, used for device formatting, mounting,
 * and filesystem accounting.
 */
#[async_trait]
pub trait NodeTerminal: Send + Sync {
    async fn run(
        &self,
        node: &str,
        argv: &[String],
    ) -> Result<ExecOutput, ApiError>;
}
