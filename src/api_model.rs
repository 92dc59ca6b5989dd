/*!
 * Facilities for working with objects in the block storage API (agnostic to
 * both the HTTP transport through which consumers interact with them and the
 * backend implementation (simulator or a real cluster)).
 *
 * The root aggregate here is the [`Block`]: a logical replicated block
 * device backed by one engine controller pod and N replica pods.  A `Block`
 * is only ever mutated through the reconciler while the process-wide blocks
 * lock is held; the HTTP layer sees [`BlockView`]s produced by `to_view()`.
 */

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::convert::TryFrom;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::api_error::ApiError;

/** TCP port on which every replica process listens for data connections */
pub const REPLICA_PORT: u16 = 10000;
/** Highest container port exposed by a replica pod */
pub const REPLICA_PORT_MAX: u16 = 10014;
/** TCP port on which the engine controller listens */
pub const CONTROLLER_PORT: u16 = 9501;
/** Pod label carrying the owning block id */
pub const BLOCK_LABEL: &str = "block";

/*
 * These type aliases exist primarily to make it easier to be consistent
 * about return values from the data store and the reconciler.
 */

/** Result of a create operation for the specified type. */
pub type CreateResult<T> = Result<Arc<T>, ApiError>;
/** Result of a delete operation for the specified type. */
pub type DeleteResult = Result<(), ApiError>;
/** Result of a list operation for the specified type. */
pub type ListResult<T> = Result<Vec<Arc<T>>, ApiError>;
/** Result of a lookup operation for the specified type. */
pub type LookupResult<T> = Result<Arc<T>, ApiError>;
/** Result of an update operation for the specified type. */
pub type UpdateResult<T> = Result<Arc<T>, ApiError>;

/**
 * A `Name` is a block name: unique, 3-128 characters, stored lowercased and
 * trimmed.  A `Name` can only be constructed with a valid name string, and
 * construction normalizes the input (trims surrounding whitespace, lowers
 * the case) before validating it.  Block names double as controller pod
 * names, so the character set is restricted accordingly.
 */
#[derive(
    Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(try_from = "String")]
pub struct Name(String);

impl TryFrom<String> for Name {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_lowercase();

        if value.len() < 3 {
            return Err(format!("name requires at least 3 characters"));
        }
        if value.len() > 128 {
            return Err(format!("name may contain at most 128 characters"));
        }

        let mut iter = value.chars();
        let first = iter.next().unwrap();
        if !first.is_ascii_lowercase() {
            return Err(format!(
                "name must begin with an ASCII lowercase character"
            ));
        }

        let mut last = first;
        for c in iter {
            last = c;
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
                return Err(format!(
                    "name contains invalid character: \"{}\" (allowed \
                     characters are lowercase ASCII, digits, and \"-\")",
                    c
                ));
            }
        }

        if last == '-' {
            return Err(format!("name cannot end with \"-\""));
        }

        Ok(Name(value))
    }
}

impl TryFrom<&str> for Name {
    type Error = String;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Name::try_from(String::from(value))
    }
}

impl From<Name> for String {
    fn from(value: Name) -> String {
        value.0
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /**
     * Parse a `Name`, marshalling any error into an appropriate `ApiError`.
     */
    pub fn from_param(value: String, label: &str) -> Result<Name, ApiError> {
        Name::try_from(value).map_err(|e| ApiError::InvalidValue {
            label: String::from(label),
            message: e,
        })
    }
}

impl JsonSchema for Name {
    fn schema_name() -> String {
        String::from("Name")
    }
    fn json_schema(
        gen: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/**
 * Represents a count of gibibytes, the unit in which all volume sizes are
 * expressed.  Valid block sizes are 1-1024 GiB; see [`validate_size`].
 */
#[derive(
    Copy,
    Clone,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Gibibytes(u64);

impl Gibibytes {
    pub fn new(gib: u64) -> Gibibytes {
        Gibibytes(gib)
    }
    pub fn to_gib(&self) -> u64 {
        self.0
    }
    pub fn to_mebibytes(&self) -> u64 {
        self.0 * 1024
    }
    /** Formats the size the way the engine CLI expects it (`10gb`). */
    pub fn engine_arg(&self) -> String {
        format!("{}gb", self.0)
    }
}

impl Display for Gibibytes {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} GiB", self.0)
    }
}

/** Validates a requested volume size. */
pub fn validate_size(size: u64) -> Result<Gibibytes, ApiError> {
    if !(1..=1024).contains(&size) {
        return Err(ApiError::invalid_value(
            "size",
            "size must be between 1 and 1024 GiB",
        ));
    }
    Ok(Gibibytes(size))
}

/** Validates a requested replica count. */
pub fn validate_replica_count(count: u32) -> Result<u32, ApiError> {
    if !(1..=7).contains(&count) {
        return Err(ApiError::invalid_value(
            "replicas",
            "replica count must be between 1 and 7",
        ));
    }
    Ok(count)
}

/** Derives the canonical `tcp://<ip>:10000` endpoint for a replica ip. */
pub fn replica_endpoint(ip: &str) -> String {
    format!("tcp://{}:{}", ip, REPLICA_PORT)
}

/*
 * SUBSTRATE HANDLES
 *
 * Nodes, disks, and folders are owned by external services; the control
 * plane only carries opaque-ish handles to them.  See `substrate.rs` for
 * the service interfaces.
 */

/** A worker node capable of hosting controller and replica pods. */
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Node {
    pub name: String,
    pub hostname: String,
}

/** A disk on a worker node, as reported by the disk service. */
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct Disk {
    pub id: String,
    pub node: String,
    pub path: String,
    /** free capacity in MiB, used when budgeting replica placement */
    pub available_mib: u64,
}

/** A folder provisioned on a disk, used as a pod hostPath mount. */
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct Folder {
    pub id: String,
    pub path: String,
    pub disk: String,
    pub node: String,
}

/*
 * BLOCKS
 */

/**
 * Runtime status of a block, derived from controller and replica state.
 */
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Healthy,
    Unhealthy,
    Repairing,
}

/** Whether a healthy replica shares the block's preferred node. */
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    Local,
    Remote,
    Unknown,
}

/** Lifecycle status of a replica. */
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Pending,
    Healthy,
    Unhealthy,
    Repairing,
    Offline,
}

/** Replica mode as reported by (or requested of) the engine. */
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ReplicaMode {
    RW,
    RO,
    ERR,
}

impl Display for ReplicaMode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ReplicaMode::RW => "RW",
                ReplicaMode::RO => "RO",
                ReplicaMode::ERR => "ERR",
            }
        )
    }
}

impl FromStr for ReplicaMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RW" => Ok(ReplicaMode::RW),
            "RO" => Ok(ReplicaMode::RO),
            "ERR" => Ok(ReplicaMode::ERR),
            other => Err(format!("unknown replica mode \"{}\"", other)),
        }
    }
}

/**
 * One copy of a block's data, embedded in the owning [`Block`].
 *
 * Replicas are never resurrected: once removed, a replacement gets a fresh
 * id and a fresh name.  `attached` tracks membership in the engine's
 * replica set; a replica must be healthy at the moment of attach, and an
 * unhealthy replica must be detached before the next attach attempt.
 */
#[derive(Clone, Debug)]
pub struct Replica {
    pub id: Uuid,
    /** globally unique human-readable name, used as the pod name */
    pub name: String,
    /** orchestrator pod handle, if a pod has been submitted */
    pub pod: Option<String>,
    pub disk: Disk,
    pub node: String,
    pub folder: Folder,
    pub status: ReplicaStatus,
    pub healthy: bool,
    pub attached: bool,
    pub ip: Option<String>,
    /** derived from `ip`; both are null together */
    pub endpoint: Option<String>,
    pub mode: ReplicaMode,
}

impl Replica {
    /** Records the pod ip and derives the data endpoint from it. */
    pub fn set_ip(&mut self, ip: &str) {
        self.ip = Some(ip.to_string());
        self.endpoint = Some(replica_endpoint(ip));
    }

    /** Clears the pod handle and all derived network state. */
    pub fn clear_network(&mut self) {
        self.pod = None;
        self.ip = None;
        self.endpoint = None;
    }

    pub fn to_view(&self) -> ReplicaView {
        ReplicaView {
            id: self.id,
            name: self.name.clone(),
            pod: self.pod.clone(),
            disk: self.disk.id.clone(),
            node: self.node.clone(),
            folder: self.folder.path.clone(),
            status: self.status,
            healthy: self.healthy,
            attached: self.attached,
            ip: self.ip.clone(),
            endpoint: self.endpoint.clone(),
            mode: self.mode,
        }
    }
}

/**
 * Represents a block (a logical replicated volume) in the control plane.
 *
 * Invariants maintained by the reconciler:
 *
 * * `controller` is non-null iff a controller pod with that handle is
 *   believed to exist.
 * * `mounted` implies `formatted` implies `frontend_state` implies `online`.
 * * `locality` is `Local` iff some healthy replica's node equals `node`.
 * * a soft-deleted block (`time_deleted` set) is excluded from all default
 *   reads and from pod-event dispatch.
 */
#[derive(Clone, Debug)]
pub struct Block {
    pub id: Uuid,
    pub name: Name,
    pub cluster: String,
    pub namespace: String,
    /** preferred locality node */
    pub node: String,
    pub size: Gibibytes,
    /** filesystem usage in GiB, refreshed by the usage operation */
    pub used_gib: f64,
    pub replica_count: u32,
    /** controller pod handle */
    pub controller: Option<String>,
    /** host device path once the frontend is up */
    pub device: Option<String>,
    pub mount_point: Option<Folder>,
    pub formatted: bool,
    pub mounted: bool,
    pub online: bool,
    pub frontend_state: bool,
    pub locality: Locality,
    pub healthy: bool,
    pub replicas: Vec<Replica>,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
    pub time_deleted: Option<DateTime<Utc>>,
}

impl Block {
    /** Derived status, computed from controller and replica state. */
    pub fn status(&self) -> BlockStatus {
        if self.replicas.is_empty() || !self.online {
            BlockStatus::Pending
        } else if self
            .replicas
            .iter()
            .any(|r| r.status == ReplicaStatus::Repairing)
        {
            BlockStatus::Repairing
        } else if self.replicas.iter().all(|r| r.healthy) {
            BlockStatus::Healthy
        } else {
            BlockStatus::Unhealthy
        }
    }

    /** Looks up an embedded replica by id. */
    pub fn replica(&self, id: &Uuid) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.id == *id)
    }

    /** Looks up an embedded replica by id, for mutation. */
    pub fn replica_mut(&mut self, id: &Uuid) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.id == *id)
    }

    /** Returns true if some healthy replica lives on the preferred node. */
    pub fn has_local_replica(&self) -> bool {
        self.replicas.iter().any(|r| r.healthy && r.node == self.node)
    }

    pub fn to_view(&self) -> BlockView {
        BlockView {
            id: self.id,
            name: self.name.clone(),
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            node: self.node.clone(),
            size: self.size.to_gib(),
            used: self.used_gib,
            replica_count: self.replica_count,
            controller: self.controller.clone(),
            device: self.device.clone(),
            mount_point: self.mount_point.as_ref().map(|f| f.path.clone()),
            formatted: self.formatted,
            mounted: self.mounted,
            online: self.online,
            frontend_state: self.frontend_state,
            locality: self.locality,
            healthy: self.healthy,
            status: self.status(),
            replicas: self.replicas.iter().map(|r| r.to_view()).collect(),
            time_created: self.time_created,
            time_modified: self.time_modified,
        }
    }
}

/**
 * Represents the properties of a `Block` that can be seen by end users.
 */
#[derive(Debug, Deserialize, JsonSchema, Serialize)]
pub struct BlockView {
    pub id: Uuid,
    pub name: Name,
    pub cluster: String,
    pub namespace: String,
    pub node: String,
    pub size: u64,
    pub used: f64,
    #[serde(rename = "replicaCount")]
    pub replica_count: u32,
    pub controller: Option<String>,
    pub device: Option<String>,
    #[serde(rename = "mountPoint")]
    pub mount_point: Option<String>,
    pub formatted: bool,
    pub mounted: bool,
    pub online: bool,
    #[serde(rename = "frontendState")]
    pub frontend_state: bool,
    pub locality: Locality,
    pub healthy: bool,
    pub status: BlockStatus,
    pub replicas: Vec<ReplicaView>,
    #[serde(rename = "createdAt")]
    pub time_created: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub time_modified: DateTime<Utc>,
}

/**
 * Represents the properties of a `Replica` that can be seen by end users.
 */
#[derive(Debug, Deserialize, JsonSchema, Serialize)]
pub struct ReplicaView {
    pub id: Uuid,
    pub name: String,
    pub pod: Option<String>,
    pub disk: String,
    pub node: String,
    pub folder: String,
    pub status: ReplicaStatus,
    pub healthy: bool,
    pub attached: bool,
    pub ip: Option<String>,
    pub endpoint: Option<String>,
    pub mode: ReplicaMode,
}

/**
 * Represents the create-time parameters for a `Block`.  `size` and
 * `replicas` fall back to configured defaults when omitted.
 */
#[derive(Debug, Deserialize, JsonSchema, Serialize)]
pub struct BlockProvisionParams {
    pub name: Name,
    pub size: Option<u64>,
    pub node: String,
    pub replicas: Option<u32>,
}

/**
 * One row of the engine's replica listing, joined against the stored
 * replica (by full endpoint equality) where a match exists.
 */
#[derive(Debug, Deserialize, JsonSchema, Serialize)]
pub struct EngineReplicaView {
    pub endpoint: String,
    pub mode: ReplicaMode,
    /** snapshot chain as reported by the engine */
    pub chain: Vec<String>,
    pub replica: Option<ReplicaView>,
}

/**
 * Filesystem usage report for a mounted block.
 */
#[derive(Debug, Deserialize, JsonSchema, Serialize)]
pub struct BlockUsage {
    pub size: u64,
    pub used: f64,
    pub available: f64,
    #[serde(rename = "usedPercent")]
    pub used_percent: u32,
    pub replicas: Vec<ReplicaUsage>,
}

/**
 * On-disk footprint of one replica's folder.  Unhealthy replicas report -1.
 */
#[derive(Debug, Deserialize, JsonSchema, Serialize)]
pub struct ReplicaUsage {
    pub id: Uuid,
    pub name: String,
    pub used: f64,
}

/**
 * Optional flags applied when creating an engine controller.  Boolean flags
 * are omitted from the controller argv when false; valued flags are omitted
 * when unset.
 */
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct ControllerOptions {
    #[serde(default)]
    pub upgrade: bool,
    #[serde(default, rename = "disableRevCounter")]
    pub disable_rev_counter: bool,
    #[serde(default, rename = "salvageRequested")]
    pub salvage_requested: bool,
    #[serde(default, rename = "unmapMarkSnapChainRemoved")]
    pub unmap_mark_snap_chain_removed: bool,
    #[serde(default, rename = "snapshotMaxCount")]
    pub snapshot_max_count: Option<u32>,
    #[serde(default, rename = "snapshotMaxSize")]
    pub snapshot_max_size: Option<String>,
    #[serde(default, rename = "engineReplicaTimeout")]
    pub engine_replica_timeout: Option<u64>,
    #[serde(default, rename = "dataServerProtocol")]
    pub data_server_protocol: Option<String>,
    #[serde(default, rename = "fileSyncHttpClientTimeout")]
    pub file_sync_http_client_timeout: Option<u64>,
}

/**
 * Optional flags applied when attaching a replica to the frontend.
 */
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct AddReplicaOptions {
    #[serde(default)]
    pub restore: bool,
    #[serde(default, rename = "fastSync")]
    pub fast_sync: bool,
    #[serde(default, rename = "fileSyncHttpClientTimeout")]
    pub file_sync_http_client_timeout: Option<u64>,
}

/**
 * Parameters for formatting a block device.
 */
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct FormatOptions {
    #[serde(default)]
    pub force: bool,
    #[serde(default = "FormatOptions::default_fs_type", rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub reserve: u32,
}

impl FormatOptions {
    fn default_fs_type() -> String {
        String::from("ext4")
    }
}

impl Default for FormatOptions {
    fn default() -> FormatOptions {
        FormatOptions {
            force: false,
            fs_type: FormatOptions::default_fs_type(),
            reserve: 0,
        }
    }
}

/**
 * Parameters for cloning a snapshot from another volume's controller.
 */
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct SnapshotCloneParams {
    #[serde(rename = "snapshotName")]
    pub snapshot_name: String,
    #[serde(rename = "fromControllerAddress")]
    pub from_controller_address: String,
    #[serde(rename = "fromVolumeName")]
    pub from_volume_name: String,
    #[serde(rename = "fromControllerInstanceName")]
    pub from_controller_instance_name: String,
}

/**
 * Controller state as reported by `longhorn info`.
 */
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct ControllerInfo {
    #[serde(rename = "frontendState")]
    pub frontend_state: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ControllerInfo {
    pub fn is_up(&self) -> bool {
        self.frontend_state == "up"
    }

    /** The device path, treating an absent or empty endpoint as none. */
    pub fn device(&self) -> Option<String> {
        match &self.endpoint {
            Some(e) if !e.is_empty() => Some(e.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::Name;
    use super::ReplicaMode;
    use super::replica_endpoint;
    use super::validate_replica_count;
    use super::validate_size;
    use std::convert::TryFrom;

    #[test]
    fn test_name_parse() {
        /*
         * Error cases
         */
        let long_name = "a".repeat(129);
        let error_cases: Vec<(&str, &str)> = vec![
            ("", "name requires at least 3 characters"),
            ("ab", "name requires at least 3 characters"),
            (&long_name, "name may contain at most 128 characters"),
            ("123", "name must begin with an ASCII lowercase character"),
            ("-abc", "name must begin with an ASCII lowercase character"),
            ("abc-", "name cannot end with \"-\""),
            (
                "a_cd",
                "name contains invalid character: \"_\" (allowed characters \
                 are lowercase ASCII, digits, and \"-\")",
            ),
        ];

        for (input, expected_message) in error_cases {
            eprintln!("check name \"{}\" (expecting error)", input);
            assert_eq!(Name::try_from(input).unwrap_err(), expected_message);
        }

        /*
         * Success cases, including normalization
         */
        assert_eq!(Name::try_from("abc").unwrap().as_str(), "abc");
        assert_eq!(Name::try_from("  abc  ").unwrap().as_str(), "abc");
        assert_eq!(Name::try_from("ABC-123").unwrap().as_str(), "abc-123");
        let max_name = "a".repeat(128);
        assert_eq!(Name::try_from(max_name.as_str()).unwrap().as_str(),
            max_name);
    }

    #[test]
    fn test_size_bounds() {
        assert!(validate_size(0).is_err());
        assert!(validate_size(1025).is_err());
        assert_eq!(validate_size(1).unwrap().to_gib(), 1);
        assert_eq!(validate_size(1024).unwrap().to_gib(), 1024);
        assert_eq!(validate_size(10).unwrap().to_mebibytes(), 10240);
        assert_eq!(validate_size(10).unwrap().engine_arg(), "10gb");
    }

    #[test]
    fn test_replica_count_bounds() {
        assert!(validate_replica_count(0).is_err());
        assert!(validate_replica_count(8).is_err());
        assert_eq!(validate_replica_count(1).unwrap(), 1);
        assert_eq!(validate_replica_count(7).unwrap(), 7);
    }

    #[test]
    fn test_replica_endpoint() {
        assert_eq!(replica_endpoint("10.0.0.11"), "tcp://10.0.0.11:10000");
    }

    #[test]
    fn test_replica_mode_parse() {
        assert_eq!("RW".parse::<ReplicaMode>().unwrap(), ReplicaMode::RW);
        assert_eq!("RO".parse::<ReplicaMode>().unwrap(), ReplicaMode::RO);
        assert_eq!("ERR".parse::<ReplicaMode>().unwrap(), ReplicaMode::ERR);
        assert!("rw".parse::<ReplicaMode>().is_err());
    }
}
