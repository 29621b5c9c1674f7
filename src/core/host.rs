//! Identity of the node running the hook.
//!
//! Every slug is scoped by node, cluster and domain so that nodes sharing one
//! monitoring project never address each other's endpoints.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::HookConfig;
use crate::error::HookError;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const STANDALONE_CLUSTER: &str = "standalone";
const FALLBACK_DOMAIN: &str = "local";
const DEFAULT_TIMEZONE: &str = "UTC";
const PVESH_STATUS_ARGS: &[&str] = &["get", "/cluster/status", "--output-format", "json"];

const MACHINE_ID: &str = "/etc/machine-id";

const NODE_CONFIG: &str = "/etc/pve/local/config";
const GUEST_CONFIG_ROOT: &str = "/etc/pve/local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub node: String,
    pub cluster: String,
    pub domain: String,
}

impl HostIdentity {
    pub fn new(
        node: impl Into<String>,
        cluster: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into().trim().to_lowercase(),
            cluster: cluster.into().trim().to_lowercase(),
            domain: domain.into().trim().to_lowercase(),
        }
    }

    /// `node.cluster.domain`
    pub fn suffix(&self) -> String {
        format!("{}.{}.{}", self.node, self.cluster, self.domain)
    }

    /// Resolve the identity, preferring configured values over discovery.
    ///
    /// Fails when `pvesh` is needed but times out, exits with an error or
    /// prints something unreadable. Guessing a name instead would address
    /// other endpoints than the ones earlier phases created.
    pub async fn discover(config: &HookConfig) -> Result<Self, HookError> {
        let status = if config.node.is_none() || config.cluster.is_none() {
            let output = run_command("pvesh", PVESH_STATUS_ARGS)
                .await?
                .ok_or_else(|| {
                    HookError::HostIdentity(
                        "pvesh could not read the cluster status; set HC_NODE and HC_CLUSTER"
                            .into(),
                    )
                })?;
            Some(output)
        } else {
            None
        };

        let domain = match &config.domain {
            Some(domain) => domain.clone(),
            // Hosts without a DNS domain exit non-zero here, consistently.
            None => run_command("hostname", &["--domain"])
                .await?
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| FALLBACK_DOMAIN.to_string()),
        };

        let identity = Self::resolve(config, status.as_deref(), domain)?;
        debug!(
            node = %identity.node,
            cluster = %identity.cluster,
            domain = %identity.domain,
            "Resolved host identity"
        );
        Ok(identity)
    }

    /// Combine configured values with the JSON printed by
    /// `pvesh get /cluster/status`.
    pub fn resolve(
        config: &HookConfig,
        cluster_status: Option<&str>,
        domain: String,
    ) -> Result<Self, HookError> {
        let status = match cluster_status {
            Some(json) => parse_cluster_status(json).ok_or_else(|| {
                HookError::HostIdentity("unreadable cluster status from pvesh".into())
            })?,
            None if config.node.is_none() || config.cluster.is_none() => {
                return Err(HookError::HostIdentity(
                    "no cluster status; set HC_NODE and HC_CLUSTER".into(),
                ));
            }
            None => ClusterStatus::default(),
        };

        let node = config
            .node
            .clone()
            .or(status.local_node)
            .or_else(system_hostname)
            .ok_or_else(|| HookError::HostIdentity("node name unknown; set HC_NODE".into()))?;

        // A readable status without a cluster entry is a standalone node.
        let cluster = config
            .cluster
            .clone()
            .or(status.cluster)
            .unwrap_or_else(|| STANDALONE_CLUSTER.to_string());

        Ok(Self::new(node, cluster, domain))
    }
}

/// Descriptive facts about the node. Best effort: anything that cannot be
/// read is left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFacts {
    pub machine_id: Option<String>,
    pub arch: Option<String>,
    pub kernel: Option<String>,
    pub timezone: Option<String>,
}

impl HostFacts {
    pub async fn collect() -> Self {
        let machine_id = tokio::fs::read_to_string(MACHINE_ID)
            .await
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        Self {
            machine_id,
            arch: host_fact("uname", &["--machine"]).await,
            kernel: host_fact("uname", &["--kernel-release"]).await,
            timezone: host_fact("timedatectl", &["show", "--property", "Timezone", "--value"]).await,
        }
    }

    /// IANA timezone of the node, `UTC` when unknown.
    pub fn timezone(&self) -> &str {
        self.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ClusterStatus {
    cluster: Option<String>,
    local_node: Option<String>,
}

#[derive(Deserialize)]
struct StatusEntry {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
    #[serde(default)]
    local: Option<u8>,
}

fn parse_cluster_status(json: &str) -> Option<ClusterStatus> {
    let entries: Vec<StatusEntry> = serde_json::from_str(json)
        .map_err(|e| warn!(error = %e, "Unparseable cluster status"))
        .ok()?;

    let cluster = entries
        .iter()
        .find(|e| e.kind == "cluster")
        .and_then(|e| e.name.clone());
    let local_node = entries
        .iter()
        .find(|e| e.kind == "node" && e.local == Some(1))
        .and_then(|e| e.name.clone());

    Some(ClusterStatus {
        cluster,
        local_node,
    })
}

fn system_hostname() -> Option<String> {
    let name = hostname::get().ok()?.into_string().ok()?;
    // Short name only; the domain is tracked separately.
    let short = name.split('.').next().unwrap_or_default().to_string();
    (!short.is_empty()).then_some(short)
}

/// Run a host command under a timeout. `Ok(None)` when it ran and exited
/// with an error; `Err` when it could not be run or did not finish.
async fn run_command(program: &str, args: &[&str]) -> Result<Option<String>, HookError> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
        .await
        .map_err(|_| {
            warn!(program, "Command timed out");
            HookError::HostIdentity(format!("{} timed out", program))
        })?
        .map_err(|e| HookError::HostIdentity(format!("{} unavailable: {}", program, e)))?;

    if !output.status.success() {
        debug!(program, status = %output.status, "Command failed");
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
}

async fn host_fact(program: &str, args: &[&str]) -> Option<String> {
    match run_command(program, args).await {
        Ok(output) => output.filter(|out| !out.is_empty()),
        Err(e) => {
            debug!(program, error = %e, "Host fact unavailable");
            None
        }
    }
}

/// Description of the local node, from the comment lines of its config.
pub async fn node_description() -> String {
    read_description(Path::new(NODE_CONFIG)).await
}

/// Description of a guest, from the comment lines of its config.
pub async fn guest_description(vmtype: &str, vmid: &str) -> String {
    let dir = match vmtype {
        "qemu" => "qemu-server",
        "lxc" => "lxc",
        _ => return String::new(),
    };
    let path = Path::new(GUEST_CONFIG_ROOT)
        .join(dir)
        .join(format!("{}.conf", vmid));
    read_description(&path).await
}

async fn read_description(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => comment_lines(&content),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No description available");
            String::new()
        }
    }
}

fn comment_lines(content: &str) -> String {
    content
        .lines()
        .filter_map(|line| line.strip_prefix('#'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
