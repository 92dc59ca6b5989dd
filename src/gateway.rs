/*!
 * Command issuance into the engine controller container
 *
 * Every engine CLI invocation funnels through [`CommandGateway::exec`],
 * which checks that the block has a controller pod in Running phase before
 * delegating to the orchestrator's exec facility.  The parsers for the
 * engine's stringy stdout formats live here and only here, so a CLI format
 * change is a localized concern.
 *
 * All parsers tolerate trailing blank lines and variable inner spacing.
 */

use slog::Logger;
use std::sync::Arc;

use crate::api_error::ApiError;
use crate::api_model::Block;
use crate::api_model::ControllerInfo;
use crate::api_model::ReplicaMode;
use crate::orchestrator::ExecOutput;
use crate::orchestrator::OrchestratorApi;
use crate::orchestrator::PodPhase;

pub struct CommandGateway {
    orchestrator: Arc<dyn OrchestratorApi>,
    log: Logger,
}

impl CommandGateway {
    pub fn new(
        orchestrator: Arc<dyn OrchestratorApi>,
        log: Logger,
    ) -> CommandGateway {
        CommandGateway { orchestrator, log }
    }

    /**
     * Runs `argv` inside the block's controller container and returns the
     * captured output without interpreting the exit status.  Fails if the
     * block has no controller handle, if the controller pod is gone, or if
     * the pod is not in Running phase.
     */
    pub async fn exec(
        &self,
        block: &Block,
        argv: Vec<String>,
    ) -> Result<ExecOutput, ApiError> {
        if block.controller.is_none() {
            return Err(ApiError::NoController {
                block: block.name.as_str().to_string(),
            });
        }

        let pod = self
            .orchestrator
            .pod_read(&block.cluster, &block.namespace, block.name.as_str())
            .await?
            .ok_or_else(|| ApiError::PodNotFound {
                pod: block.name.as_str().to_string(),
            })?;
        if pod.phase != PodPhase::Running {
            return Err(ApiError::PodNotRunning {
                pod: block.name.as_str().to_string(),
            });
        }

        debug!(self.log, "exec";
            "block" => block.name.as_str(),
            "argv" => argv.join(" "));
        let output = self
            .orchestrator
            .exec(&block.cluster, &block.namespace, block.name.as_str(),
                &argv)
            .await?;
        if !output.success() {
            debug!(self.log, "exec failed";
                "block" => block.name.as_str(),
                "exit_code" => output.exit_code,
                "stderr" => %output.stderr);
        }
        Ok(output)
    }

    /**
     * Like [`CommandGateway::exec`], but treats a non-zero exit as an
     * engine command failure carrying the verbatim stderr.
     */
    pub async fn exec_checked(
        &self,
        block: &Block,
        argv: Vec<String>,
    ) -> Result<ExecOutput, ApiError> {
        let output = self.exec(block, argv).await?;
        if !output.success() {
            return Err(ApiError::EngineCommandFailed {
                detail: output.stderr,
            });
        }
        Ok(output)
    }
}

/**
 * One row of the engine's `ls-replica` table.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaRow {
    pub endpoint: String,
    pub mode: ReplicaMode,
    pub chain: Vec<String>,
}

/**
 * Parses the `ls-replica` table: a header line, then one row per replica
 * with the endpoint and mode as the first two whitespace-delimited tokens
 * and the snapshot chain as a trailing bracketed group.  Rows whose mode
 * token is unrecognized are reported as `ERR`.
 */
pub fn parse_replica_table(stdout: &str) -> Vec<ReplicaRow> {
    let mut rows = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()).skip(1) {
        let mut fields = line.split_whitespace();
        let endpoint = match fields.next() {
            Some(e) => e.to_string(),
            None => continue,
        };
        let mode = fields
            .next()
            .and_then(|m| m.parse::<ReplicaMode>().ok())
            .unwrap_or(ReplicaMode::ERR);

        let chain = match (line.find('['), line.rfind(']')) {
            (Some(open), Some(close)) if open < close => line
                [open + 1..close]
                .split_whitespace()
                .map(|s| s.to_string())
                .collect(),
            _ => Vec::new(),
        };

        rows.push(ReplicaRow { endpoint, mode, chain });
    }
    rows
}

/**
 * Parses `snapshots ls` output: a header line, then one snapshot name per
 * non-empty line.
 */
pub fn parse_snapshot_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .skip(1)
        .map(|l| l.to_string())
        .collect()
}

/**
 * Parses `info` output: the whole stdout is one JSON document.
 */
pub fn parse_controller_info(
    stdout: &str,
) -> Result<ControllerInfo, ApiError> {
    serde_json::from_str(stdout).map_err(|e| {
        ApiError::EngineCommandFailed {
            detail: format!("malformed controller info: {}", e),
        }
    })
}

/**
 * Parses a JSON stdout document (snapshot info, hash status) whole.
 */
pub fn parse_json_document(
    stdout: &str,
) -> Result<serde_json::Value, ApiError> {
    serde_json::from_str(stdout).map_err(|e| {
        ApiError::EngineCommandFailed {
            detail: format!("malformed engine output: {}", e),
        }
    })
}

/**
 * Filesystem usage as reported by `df`, converted from 1K-blocks to GiB.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct DiskFree {
    pub size_gib: f64,
    pub used_gib: f64,
    pub available_gib: f64,
    pub used_percent: u32,
}

const KB_PER_GIB: f64 = 1024.0 * 1024.0;

/**
 * Parses `df` output: the second non-empty line holds the 1K-block totals
 * and the use percentage.
 */
pub fn parse_df(stdout: &str) -> Result<DiskFree, ApiError> {
    let line = stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .nth(1)
        .ok_or_else(|| ApiError::EngineCommandFailed {
            detail: String::from("df output missing data line"),
        })?;

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(ApiError::EngineCommandFailed {
            detail: format!("unparseable df line: \"{}\"", line),
        });
    }

    let kb = |s: &str| -> Result<f64, ApiError> {
        s.parse::<u64>().map(|v| v as f64 / KB_PER_GIB).map_err(|_| {
            ApiError::EngineCommandFailed {
                detail: format!("unparseable df field: \"{}\"", s),
            }
        })
    };

    let used_percent = fields[4]
        .trim_end_matches('%')
        .parse::<u32>()
        .map_err(|_| ApiError::EngineCommandFailed {
            detail: format!("unparseable df percent: \"{}\"", fields[4]),
        })?;

    Ok(DiskFree {
        size_gib: kb(fields[1])?,
        used_gib: kb(fields[2])?,
        available_gib: kb(fields[3])?,
        used_percent,
    })
}

/**
 * Parses `du -s` output: the first field of the first non-empty line, in
 * 1K-blocks, converted to GiB.
 */
pub fn parse_du(stdout: &str) -> Result<f64, ApiError> {
    let line = stdout
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| ApiError::EngineCommandFailed {
            detail: String::from("du output empty"),
        })?;
    let field = line.split_whitespace().next().unwrap();
    field.parse::<u64>().map(|v| v as f64 / KB_PER_GIB).map_err(|_| {
        ApiError::EngineCommandFailed {
            detail: format!("unparseable du field: \"{}\"", field),
        }
    })
}

#[cfg(test)]
mod test {
    use super::parse_df;
    use super::parse_du;
    use super::parse_controller_info;
    use super::parse_replica_table;
    use super::parse_snapshot_list;
    use crate::api_model::ReplicaMode;

    #[test]
    fn test_parse_replica_table() {
        let stdout = "ADDRESS MODE CHAIN\n\
            tcp://10.0.0.11:10000   RW   [volume-head-001.img \
             volume-snap-a.img]\n\
            tcp://10.0.0.12:10000 ERR []\n\
            \n";
        let rows = parse_replica_table(stdout);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].endpoint, "tcp://10.0.0.11:10000");
        assert_eq!(rows[0].mode, ReplicaMode::RW);
        assert_eq!(
            rows[0].chain,
            vec!["volume-head-001.img", "volume-snap-a.img"]
        );
        assert_eq!(rows[1].endpoint, "tcp://10.0.0.12:10000");
        assert_eq!(rows[1].mode, ReplicaMode::ERR);
        assert!(rows[1].chain.is_empty());
    }

    #[test]
    fn test_parse_replica_table_tolerates_noise() {
        /* unknown mode tokens degrade to ERR; blank lines are skipped */
        let stdout = "ADDRESS  MODE\n\n tcp://10.0.0.13:10000    WO  \n\n";
        let rows = parse_replica_table(stdout);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].mode, ReplicaMode::ERR);
        assert!(rows[0].chain.is_empty());
    }

    #[test]
    fn test_parse_snapshot_list() {
        let stdout = "ID\nsnapshot-1\n  snapshot-2  \n\n";
        assert_eq!(
            parse_snapshot_list(stdout),
            vec!["snapshot-1", "snapshot-2"]
        );
        assert!(parse_snapshot_list("ID\n\n").is_empty());
        assert!(parse_snapshot_list("").is_empty());
    }

    #[test]
    fn test_parse_controller_info() {
        let info = parse_controller_info(
            "{\"frontendState\": \"up\", \
             \"endpoint\": \"/dev/longhorn/v1\"}",
        )
        .unwrap();
        assert!(info.is_up());
        assert_eq!(info.device(), Some("/dev/longhorn/v1".to_string()));

        let info =
            parse_controller_info("{\"frontendState\": \"down\"}").unwrap();
        assert!(!info.is_up());
        assert_eq!(info.device(), None);

        assert!(parse_controller_info("not json").is_err());
    }

    #[test]
    fn test_parse_df() {
        let stdout = "Filesystem     1K-blocks    Used Available Use% \
             Mounted on\n\
             /dev/longhorn/v1  10485760 1048576   9437184  10% /mnt/v1\n";
        let df = parse_df(stdout).unwrap();
        assert_eq!(df.size_gib, 10.0);
        assert_eq!(df.used_gib, 1.0);
        assert_eq!(df.available_gib, 9.0);
        assert_eq!(df.used_percent, 10);

        assert!(parse_df("").is_err());
        assert!(parse_df("Filesystem\n/dev/x bogus\n").is_err());
    }

    #[test]
    fn test_parse_du() {
        assert_eq!(parse_du("524288\t/mnt/folder\n").unwrap(), 0.5);
        assert_eq!(parse_du("\n1048576 /mnt/x\n").unwrap(), 1.0);
        assert!(parse_du("").is_err());
        assert!(parse_du("abc /mnt/x").is_err());
    }
}
