/*!
 * Interfaces for parsing configuration files and working with API server
 * configuration.
 */

use dropshot::ConfigDropshot;
use dropshot::ConfigLogging;
use serde::Deserialize;
use std::path::Path;

/**
 * Represents configuration for the whole API server.
 */
#[derive(Debug, Deserialize)]
pub struct ApiServerConfig {
    /** Dropshot configuration */
    pub dropshot: ConfigDropshot,
    /** Server-wide logging configuration. */
    pub log: ConfigLogging,
    /** Block storage configuration. */
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    pub blocks: BlocksConfig,
}

/**
 * Recognized options for the block subsystem (the `[storage.blocks]` table).
 */
#[derive(Clone, Debug, Deserialize)]
pub struct BlocksConfig {
    /** default replica count for new blocks (1-7) */
    #[serde(default = "default_replica_count", rename = "replicaCount")]
    pub replica_count: u32,
    /** seconds before a stale replica is eligible for cleanup (60-86400) */
    #[serde(
        default = "default_stale_replica_timeout",
        rename = "staleReplicaTimeout"
    )]
    pub stale_replica_timeout: u64,
    /** allow replicas to share nodes when placement is tight */
    #[serde(
        default = "default_soft_anti_affinity",
        rename = "replicaSoftAntiAffinity"
    )]
    pub replica_soft_anti_affinity: bool,
    /** container image used for controller and replica pods */
    #[serde(rename = "engineImage")]
    pub engine_image: String,
    /** frontend presented by the engine (e.g. `tgt-blockdev`) */
    #[serde(default = "default_frontend")]
    pub frontend: String,
    /** namespace in which all block pods live */
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /** default volume size in GiB */
    #[serde(default = "default_size", rename = "defaultSize")]
    pub default_size: u64,
    /** orchestrator cluster handle used for all pod operations */
    #[serde(default = "default_cluster")]
    pub cluster: String,
}

fn default_replica_count() -> u32 {
    3
}
fn default_stale_replica_timeout() -> u64 {
    28800
}
fn default_soft_anti_affinity() -> bool {
    true
}
fn default_frontend() -> String {
    String::from("tgt-blockdev")
}
fn default_namespace() -> String {
    String::from("storage")
}
fn default_size() -> u64 {
    10
}
fn default_cluster() -> String {
    String::from("default")
}

impl BlocksConfig {
    /**
     * Validates option bounds.  Returns a human-readable description of the
     * first violation found.
     */
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=7).contains(&self.replica_count) {
            return Err(String::from(
                "replicaCount must be between 1 and 7",
            ));
        }
        if !(60..=86400).contains(&self.stale_replica_timeout) {
            return Err(String::from(
                "staleReplicaTimeout must be between 60 and 86400 seconds",
            ));
        }
        if !(1..=1024).contains(&self.default_size) {
            return Err(String::from(
                "defaultSize must be between 1 and 1024 GiB",
            ));
        }
        if self.engine_image.is_empty() {
            return Err(String::from("engineImage must not be empty"));
        }
        Ok(())
    }
}

impl ApiServerConfig {
    /**
     * Load an `ApiServerConfig` from the given TOML file.  This config
     * object can then be used to create a new server.
     */
    pub fn from_file(path: &Path) -> Result<ApiServerConfig, String> {
        let file_read = std::fs::read_to_string(path);
        let file_contents = file_read.map_err(|error| {
            format!("read \"{}\": {}", path.display(), error)
        })?;
        let config_parsed: ApiServerConfig = toml::from_str(&file_contents)
            .map_err(|error| {
                format!("parse \"{}\": {}", path.display(), error)
            })?;
        config_parsed.storage.blocks.validate().map_err(|error| {
            format!("validate \"{}\": {}", path.display(), error)
        })?;
        Ok(config_parsed)
    }
}
