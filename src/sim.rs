/*!
 * Simulation of the block control plane's substrate, used for testing and
 * prototyping.
 *
 * One [`SimBackend`] stands in for every external collaborator: the
 * container orchestrator (pods with lifecycle phases, exec, events), the
 * engine CLI running inside controller containers (a stateful `longhorn`
 * argv dispatcher producing the same stdout formats the parsers consume),
 * the node terminal (mkfs/mount/df and friends), and the node/disk/folder
 * services.
 *
 * Pods are created in Pending phase with no ip; the test interfaces move
 * them to Running or Terminating and return the pod event a real watch
 * stream would deliver, so tests can drive the event dispatcher
 * deterministically.  Subscribed event channels receive the same events.
 */

use async_trait::async_trait;
use futures::channel::mpsc::unbounded;
use futures::channel::mpsc::UnboundedReceiver;
use futures::channel::mpsc::UnboundedSender;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::api_error::ApiError;
use crate::api_model::Disk;
use crate::api_model::Folder;
use crate::api_model::Node;
use crate::api_model::ReplicaMode;
use crate::orchestrator::ExecOutput;
use crate::orchestrator::NodeTerminal;
use crate::orchestrator::OrchestratorApi;
use crate::orchestrator::Pod;
use crate::orchestrator::PodEvent;
use crate::orchestrator::PodEventKind;
use crate::orchestrator::PodPhase;
use crate::orchestrator::PodSpec;
use crate::substrate::DiskService;
use crate::substrate::FolderService;
use crate::substrate::NodeService;

struct SimPod {
    pod: Pod,
    spec: PodSpec,
}

/**
 * Simulated engine state for one controller container, keyed by the
 * controller pod name (which is the block name).
 */
struct SimEngine {
    frontend: String,
    frontend_up: bool,
    /** attached replica endpoints and their modes */
    replicas: BTreeMap<String, ReplicaMode>,
    snapshots: Vec<String>,
    snapshot_seq: u64,
}

impl SimEngine {
    fn device_for(name: &str) -> String {
        format!("/dev/longhorn/{}", name)
    }
}

struct SimData {
    nodes: BTreeMap<String, Node>,
    disks: BTreeMap<String, Disk>,
    folders: BTreeMap<String, Folder>,
    pods: BTreeMap<String, SimPod>,
    engines: BTreeMap<String, SimEngine>,
    exec_log: Vec<(String, Vec<String>)>,
    terminal_log: Vec<(String, Vec<String>)>,
    /** block names whose next add-replica reports an engine error */
    fail_add_replica: BTreeSet<String>,
    next_uid: u64,
    next_folder: u64,
}

/**
 * SimBackendBuilder is used to initialize and populate a SimBackend
 * synchronously, before the guts are wrapped in the lock.
 */
pub struct SimBackendBuilder {
    log: Logger,
    nodes: BTreeMap<String, Node>,
    disks: BTreeMap<String, Disk>,
}

impl SimBackendBuilder {
    pub fn new(log: Logger) -> SimBackendBuilder {
        SimBackendBuilder {
            log,
            nodes: BTreeMap::new(),
            disks: BTreeMap::new(),
        }
    }

    pub fn node(mut self, name: &str, hostname: &str) -> SimBackendBuilder {
        self.nodes.insert(
            name.to_string(),
            Node { name: name.to_string(), hostname: hostname.to_string() },
        );
        self
    }

    pub fn disk(
        mut self,
        id: &str,
        node: &str,
        available_mib: u64,
    ) -> SimBackendBuilder {
        self.disks.insert(
            id.to_string(),
            Disk {
                id: id.to_string(),
                node: node.to_string(),
                path: format!("/var/lib/storage/{}", id),
                available_mib,
            },
        );
        self
    }

    pub fn build(self) -> SimBackend {
        SimBackend {
            log: self.log,
            data: Mutex::new(SimData {
                nodes: self.nodes,
                disks: self.disks,
                folders: BTreeMap::new(),
                pods: BTreeMap::new(),
                engines: BTreeMap::new(),
                exec_log: Vec::new(),
                terminal_log: Vec::new(),
                fail_add_replica: BTreeSet::new(),
                next_uid: 1,
                next_folder: 1,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

/**
 * Maintains simulated state of the substrate.  The current implementation
 * is in-memory only.
 */
pub struct SimBackend {
    log: Logger,
    data: Mutex<SimData>,
    subscribers: Mutex<Vec<UnboundedSender<PodEvent>>>,
}

impl SimBackend {
    /** Returns an empty backend with no nodes or disks. */
    pub fn new(log: Logger) -> SimBackend {
        SimBackendBuilder::new(log).build()
    }

    /**
     * Returns a backend with a conventional small-cluster seed: three
     * nodes with one 64 GiB disk each.
     */
    pub fn new_seeded(log: Logger) -> SimBackend {
        let mut builder = SimBackendBuilder::new(log);
        for i in 1..=3 {
            let node = format!("n-{}", i);
            let disk = format!("disk-{}-a", node);
            builder = builder
                .node(&node, &format!("host-{}", i))
                .disk(&disk, &node, 64 * 1024);
        }
        builder.build()
    }

    fn publish(&self, event: PodEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    fn output(stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    fn failure(stderr: &str, exit_code: i32) -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }

    /** Dispatches one `longhorn` invocation against the engine state. */
    fn engine_exec(
        data: &mut SimData,
        name: &str,
        argv: &[String],
    ) -> ExecOutput {
        let fail_add = argv.get(1).map(|s| s.as_str()) == Some("add-replica")
            && data.fail_add_replica.remove(name);
        let engine = match data.engines.get_mut(name) {
            Some(engine) => engine,
            None => {
                return SimBackend::failure("no engine for pod", 1);
            }
        };
        if argv.len() < 2 || argv[0] != "longhorn" {
            return SimBackend::failure("unknown executable", 127);
        }

        match argv[1].as_str() {
            "add-replica" => {
                if fail_add {
                    return SimBackend::failure(
                        "Error running add replica command",
                        1,
                    );
                }
                let endpoint = argv.last().unwrap().clone();
                engine.replicas.insert(endpoint, ReplicaMode::RW);
                engine.frontend_up = true;
                SimBackend::output("")
            }
            "rm-replica" => {
                let endpoint = argv.last().unwrap();
                if engine.frontend_up
                    && engine.replicas.len() <= 1
                    && engine.replicas.contains_key(endpoint)
                {
                    return SimBackend::failure(
                        "cannot remove last replica if volume is up",
                        1,
                    );
                }
                engine.replicas.remove(endpoint);
                if engine.replicas.is_empty() {
                    engine.frontend_up = false;
                }
                SimBackend::output("")
            }
            "ls-replica" => {
                let mut stdout = String::from("ADDRESS MODE CHAIN\n");
                for (endpoint, mode) in &engine.replicas {
                    let mut chain = vec![String::from("volume-head-000.img")];
                    chain.extend(
                        engine
                            .snapshots
                            .iter()
                            .map(|s| format!("volume-snap-{}.img", s)),
                    );
                    stdout.push_str(&format!(
                        "{} {} [{}]\n",
                        endpoint,
                        mode,
                        chain.join(" ")
                    ));
                }
                SimBackend::output(&stdout)
            }
            "update-replica" => {
                /* longhorn update-replica --mode <m> <endpoint> */
                if argv.len() < 5 {
                    return SimBackend::failure("usage: update-replica", 1);
                }
                let mode = match argv[3].parse::<ReplicaMode>() {
                    Ok(mode) => mode,
                    Err(e) => return SimBackend::failure(&e, 1),
                };
                match engine.replicas.get_mut(&argv[4]) {
                    Some(slot) => {
                        *slot = mode;
                        SimBackend::output("")
                    }
                    None => SimBackend::failure("no such replica", 1),
                }
            }
            "replica-rebuild-status" => {
                SimBackend::output("{\"isRebuilding\": false}")
            }
            "verify-rebuild-replica" => SimBackend::output(""),
            "frontend" => match argv.get(2).map(|s| s.as_str()) {
                Some("start") => {
                    engine.frontend_up = true;
                    SimBackend::output("")
                }
                Some("shutdown") => {
                    engine.frontend_up = false;
                    SimBackend::output("")
                }
                _ => SimBackend::failure("usage: frontend", 1),
            },
            "info" => {
                let endpoint = if engine.frontend_up {
                    SimEngine::device_for(name)
                } else {
                    String::new()
                };
                let info = serde_json::json!({
                    "frontendState":
                        if engine.frontend_up { "up" } else { "down" },
                    "endpoint": endpoint,
                    "frontend": engine.frontend,
                });
                SimBackend::output(&info.to_string())
            }
            "expand" => SimBackend::output(""),
            "snapshots" => SimBackend::snapshot_exec(engine, argv),
            _ => SimBackend::failure("unknown command", 127),
        }
    }

    fn snapshot_exec(engine: &mut SimEngine, argv: &[String]) -> ExecOutput {
        match argv.get(2).map(|s| s.as_str()) {
            Some("create") => {
                engine.snapshot_seq += 1;
                let name = format!("snapshot-{}", engine.snapshot_seq);
                engine.snapshots.push(name.clone());
                SimBackend::output(&format!("{}\n", name))
            }
            Some("ls") => {
                let mut stdout = String::from("ID\n");
                for name in &engine.snapshots {
                    stdout.push_str(name);
                    stdout.push('\n');
                }
                SimBackend::output(&stdout)
            }
            Some("rm") => match argv.get(3) {
                Some(name) if engine.snapshots.contains(name) => {
                    engine.snapshots.retain(|s| s != name);
                    SimBackend::output("")
                }
                _ => SimBackend::failure("snapshot not found", 1),
            },
            Some("revert") => match argv.get(3) {
                Some(name) if engine.snapshots.contains(name) => {
                    SimBackend::output("")
                }
                _ => SimBackend::failure("snapshot not found", 1),
            },
            Some("purge") => SimBackend::output(""),
            Some("purge-status") => SimBackend::output("{}"),
            Some("info") => {
                let mut info = serde_json::Map::new();
                for name in &engine.snapshots {
                    info.insert(
                        name.clone(),
                        serde_json::json!({
                            "name": name,
                            "removed": false,
                        }),
                    );
                }
                SimBackend::output(
                    &serde_json::Value::Object(info).to_string(),
                )
            }
            Some("clone") => SimBackend::output(""),
            Some("clone-status") => SimBackend::output("complete\n"),
            Some("hash") | Some("hash-cancel") => SimBackend::output(""),
            Some("hash-status") => SimBackend::output(
                "{\"state\": \"complete\", \"hashValue\": \"sim\"}",
            ),
            _ => SimBackend::failure("usage: snapshots", 1),
        }
    }
}

#[async_trait]
impl OrchestratorApi for SimBackend {
    async fn pod_read(
        &self,
        _cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Pod>, ApiError> {
        let data = self.data.lock().unwrap();
        Ok(data
            .pods
            .get(name)
            .filter(|p| p.pod.namespace == namespace)
            .map(|p| p.pod.clone()))
    }

    async fn pod_create(
        &self,
        _cluster: &str,
        spec: PodSpec,
    ) -> Result<Pod, ApiError> {
        let event = {
            let mut data = self.data.lock().unwrap();
            if data.pods.contains_key(&spec.name) {
                return Err(ApiError::PodCreationError {
                    detail: format!("pod \"{}\" already exists", spec.name),
                });
            }

            let uid = format!("uid-{}", data.next_uid);
            data.next_uid += 1;
            let pod = Pod {
                uid,
                name: spec.name.clone(),
                namespace: spec.namespace.clone(),
                node_name: spec.node_name.clone(),
                phase: PodPhase::Pending,
                pod_ip: None,
                terminating: false,
            };

            /*
             * A controller pod brings an engine with it; the initial
             * replica set comes from the `--replica` argv flags.
             */
            if spec.args.get(1).map(|s| s.as_str()) == Some("controller") {
                let frontend = spec
                    .args
                    .iter()
                    .position(|a| a == "--frontend")
                    .and_then(|i| spec.args.get(i + 1))
                    .cloned()
                    .unwrap_or_default();
                let mut replicas = BTreeMap::new();
                for (i, arg) in spec.args.iter().enumerate() {
                    if arg == "--replica" {
                        if let Some(endpoint) = spec.args.get(i + 1) {
                            replicas
                                .insert(endpoint.clone(), ReplicaMode::RW);
                        }
                    }
                }
                data.engines.insert(
                    spec.name.clone(),
                    SimEngine {
                        frontend,
                        frontend_up: false,
                        replicas,
                        snapshots: Vec::new(),
                        snapshot_seq: 0,
                    },
                );
            }

            debug!(self.log, "created pod"; "pod" => %pod.name);
            let rv = pod.clone();
            data.pods
                .insert(spec.name.clone(), SimPod { pod, spec });
            PodEvent { kind: PodEventKind::Added, pod: rv }
        };
        let pod = event.pod.clone();
        self.publish(event);
        Ok(pod)
    }

    async fn pod_delete(
        &self,
        _cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        let event = {
            let mut data = self.data.lock().unwrap();
            let sim_pod = match data.pods.remove(name) {
                Some(p) if p.pod.namespace == namespace => p,
                _ => {
                    return Err(ApiError::PodNotFound {
                        pod: name.to_string(),
                    })
                }
            };
            data.engines.remove(name);
            debug!(self.log, "deleted pod"; "pod" => name);
            let mut pod = sim_pod.pod;
            pod.terminating = true;
            PodEvent { kind: PodEventKind::Deleted, pod }
        };
        self.publish(event);
        Ok(())
    }

    async fn exec(
        &self,
        _cluster: &str,
        namespace: &str,
        name: &str,
        argv: &[String],
    ) -> Result<ExecOutput, ApiError> {
        let mut data = self.data.lock().unwrap();
        let pod = match data.pods.get(name) {
            Some(p) if p.pod.namespace == namespace => &p.pod,
            _ => {
                return Err(ApiError::PodNotFound { pod: name.to_string() })
            }
        };
        if pod.phase != PodPhase::Running {
            return Err(ApiError::PodNotRunning { pod: name.to_string() });
        }

        data.exec_log.push((name.to_string(), argv.to_vec()));
        Ok(SimBackend::engine_exec(&mut data, name, argv))
    }

    async fn pod_events(&self) -> UnboundedReceiver<PodEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

#[async_trait]
impl NodeTerminal for SimBackend {
    async fn run(
        &self,
        node: &str,
        argv: &[String],
    ) -> Result<ExecOutput, ApiError> {
        let mut data = self.data.lock().unwrap();
        if !data.nodes.contains_key(node) {
            return Err(ApiError::NodeNotFound { node: node.to_string() });
        }
        data.terminal_log.push((node.to_string(), argv.to_vec()));

        let output = match argv.first().map(|s| s.as_str()) {
            Some("mkfs") | Some("mount") | Some("umount")
            | Some("fstrim") => SimBackend::output(""),
            Some("df") => SimBackend::output(
                "Filesystem     1K-blocks    Used Available Use% \
                 Mounted on\n\
                 /dev/longhorn/sim 10485760 1048576   9437184  10% /mnt\n",
            ),
            Some("du") => SimBackend::output("524288\t/mnt\n"),
            _ => SimBackend::failure("command not found", 127),
        };
        Ok(output)
    }
}

#[async_trait]
impl NodeService for SimBackend {
    async fn node_lookup(&self, name: &str) -> Result<Node, ApiError> {
        let data = self.data.lock().unwrap();
        data.nodes.get(name).cloned().ok_or_else(|| {
            ApiError::NodeNotFound { node: name.to_string() }
        })
    }
}

#[async_trait]
impl DiskService for SimBackend {
    async fn node_disks(&self, node: &str) -> Result<Vec<Disk>, ApiError> {
        let data = self.data.lock().unwrap();
        Ok(data
            .disks
            .values()
            .filter(|d| d.node == node)
            .cloned()
            .collect())
    }

    async fn available_disks(
        &self,
        _cluster: &str,
        budget_mib: u64,
        exclude: &[String],
        node: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Disk>, ApiError> {
        let data = self.data.lock().unwrap();
        Ok(data
            .disks
            .values()
            .filter(|d| d.available_mib >= budget_mib)
            .filter(|d| !exclude.contains(&d.id))
            .filter(|d| node.map_or(true, |n| d.node == n))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FolderService for SimBackend {
    async fn provision(
        &self,
        disk: &Disk,
        prefix: &str,
    ) -> Result<Folder, ApiError> {
        let mut data = self.data.lock().unwrap();
        if !data.disks.contains_key(&disk.id) {
            return Err(ApiError::DiskNotFound {
                detail: disk.id.clone(),
            });
        }
        let seq = data.next_folder;
        data.next_folder += 1;
        let folder = Folder {
            id: format!("folder-{}", seq),
            path: format!("{}/{}-{}", disk.path, prefix, seq),
            disk: disk.id.clone(),
            node: disk.node.clone(),
        };
        data.folders.insert(folder.id.clone(), folder.clone());
        Ok(folder)
    }

    async fn deprovision(&self, folder: &Folder) -> Result<(), ApiError> {
        let mut data = self.data.lock().unwrap();
        match data.folders.remove(&folder.id) {
            Some(_) => Ok(()),
            None => Err(ApiError::DiskNotFound {
                detail: format!("folder {}", folder.id),
            }),
        }
    }
}

/**
 * Trait used to expose interfaces for use only by the test suite.
 */
#[async_trait]
pub trait SimBackendTestInterfaces {
    /**
     * Moves a pod to Running phase with the given ip and returns the pod
     * event a watch stream would deliver for the transition.
     */
    async fn pod_set_running(&self, name: &str, ip: Option<&str>)
        -> PodEvent;

    /** Marks a pod terminating and returns the corresponding event. */
    async fn pod_set_terminating(&self, name: &str) -> PodEvent;

    async fn pod_uid(&self, name: &str) -> Option<String>;
    async fn pod_spec(&self, name: &str) -> Option<PodSpec>;

    /** Drains the record of exec'd engine commands. */
    async fn exec_log_drain(&self) -> Vec<(String, Vec<String>)>;
    /** Drains the record of node-terminal commands. */
    async fn terminal_log_drain(&self) -> Vec<(String, Vec<String>)>;

    /** Makes the next add-replica for the named block fail. */
    async fn fail_next_add_replica(&self, block: &str);

    /** Returns the endpoints in the engine's replica set. */
    async fn engine_replicas(&self, block: &str) -> Vec<String>;
    async fn engine_frontend_up(&self, block: &str) -> bool;

    /** Number of live folders (provisioned minus deprovisioned). */
    async fn folder_count(&self) -> usize;
    /** Names of pods carrying the given block label value. */
    async fn pods_labelled(&self, block_id: &str) -> Vec<String>;
}

#[async_trait]
impl SimBackendTestInterfaces for SimBackend {
    async fn pod_set_running(
        &self,
        name: &str,
        ip: Option<&str>,
    ) -> PodEvent {
        let event = {
            let mut data = self.data.lock().unwrap();
            let sim_pod = data
                .pods
                .get_mut(name)
                .expect("no such pod in simulation");
            sim_pod.pod.phase = PodPhase::Running;
            sim_pod.pod.pod_ip = ip.map(|s| s.to_string());
            sim_pod.pod.terminating = false;
            PodEvent {
                kind: PodEventKind::Modified,
                pod: sim_pod.pod.clone(),
            }
        };
        self.publish(event.clone());
        event
    }

    async fn pod_set_terminating(&self, name: &str) -> PodEvent {
        let event = {
            let mut data = self.data.lock().unwrap();
            let sim_pod = data
                .pods
                .get_mut(name)
                .expect("no such pod in simulation");
            sim_pod.pod.terminating = true;
            PodEvent {
                kind: PodEventKind::Modified,
                pod: sim_pod.pod.clone(),
            }
        };
        self.publish(event.clone());
        event
    }

    async fn pod_uid(&self, name: &str) -> Option<String> {
        let data = self.data.lock().unwrap();
        data.pods.get(name).map(|p| p.pod.uid.clone())
    }

    async fn pod_spec(&self, name: &str) -> Option<PodSpec> {
        let data = self.data.lock().unwrap();
        data.pods.get(name).map(|p| p.spec.clone())
    }

    async fn exec_log_drain(&self) -> Vec<(String, Vec<String>)> {
        std::mem::take(&mut self.data.lock().unwrap().exec_log)
    }

    async fn terminal_log_drain(&self) -> Vec<(String, Vec<String>)> {
        std::mem::take(&mut self.data.lock().unwrap().terminal_log)
    }

    async fn fail_next_add_replica(&self, block: &str) {
        self.data
            .lock()
            .unwrap()
            .fail_add_replica
            .insert(block.to_string());
    }

    async fn engine_replicas(&self, block: &str) -> Vec<String> {
        let data = self.data.lock().unwrap();
        data.engines
            .get(block)
            .map(|e| e.replicas.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn engine_frontend_up(&self, block: &str) -> bool {
        let data = self.data.lock().unwrap();
        data.engines.get(block).map(|e| e.frontend_up).unwrap_or(false)
    }

    async fn folder_count(&self) -> usize {
        self.data.lock().unwrap().folders.len()
    }

    async fn pods_labelled(&self, block_id: &str) -> Vec<String> {
        let data = self.data.lock().unwrap();
        data.pods
            .values()
            .filter(|p| {
                p.spec.labels.get(crate::api_model::BLOCK_LABEL)
                    == Some(&block_id.to_string())
            })
            .map(|p| p.pod.name.clone())
            .collect()
    }
}
