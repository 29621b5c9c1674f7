use std::path::PathBuf;
use std::sync::Arc;

use crate::config::HookConfig;
use crate::core::log_capture::default_log_path;
use crate::core::{BackupTarget, HostIdentity, Outcome, Phase};
use crate::monitor::{MonitoringClient, ServiceEndpoints, Transport};

/// Everything a phase handler needs besides the invocation itself.
#[derive(Clone)]
pub struct HookContext {
    pub config: Arc<HookConfig>,
    pub host: HostIdentity,
    pub client: MonitoringClient,
}

impl HookContext {
    pub fn new(config: HookConfig, host: HostIdentity, transport: Arc<dyn Transport>) -> Self {
        let client = MonitoringClient::new(
            transport,
            config.retry_policy(),
            ServiceEndpoints::from(&config),
        );

        Self {
            config: Arc::new(config),
            host,
            client,
        }
    }
}

/// One call from the backup tool: the phase plus whatever the tool told us
/// about the job and target through arguments and environment.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub phase: Phase,
    pub mode: Option<String>,
    pub target: Option<BackupTarget>,
    /// `DUMPDIR` for local backups, `STOREID` for a backup server.
    pub storage: Option<String>,
    pub guest_hostname: Option<String>,
    /// `HOSTTYPE`, when the calling shell exports it.
    pub host_type: Option<String>,
    pub log_file: Option<PathBuf>,
    pub outcome: Option<Outcome>,
}

impl Invocation {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            mode: None,
            target: None,
            storage: None,
            guest_hostname: None,
            host_type: None,
            log_file: None,
            outcome: None,
        }
    }

    /// Build from positional arguments and the variables the backup tool
    /// exports to its hook.
    pub fn from_env(
        phase: Phase,
        mode: Option<String>,
        vmid: Option<String>,
        outcome: Option<Outcome>,
    ) -> Self {
        let vmtype = env_var("VMTYPE").unwrap_or_else(|| "unknown".to_string());
        let target = vmid
            .filter(|id| !id.trim().is_empty())
            .map(|id| BackupTarget::new(id.trim(), vmtype));

        Self {
            phase,
            mode: mode.filter(|m| !m.is_empty()),
            target,
            storage: env_var("DUMPDIR").or_else(|| env_var("STOREID")),
            guest_hostname: env_var("HOSTNAME"),
            host_type: env_var("HOSTTYPE"),
            log_file: env_var("LOGFILE").map(PathBuf::from),
            outcome,
        }
    }

    pub fn with_target(mut self, vmid: &str, vmtype: &str) -> Self {
        self.target = Some(BackupTarget::new(vmid, vmtype));
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Log of the current target: `LOGFILE`, or the backup tool's default.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file.clone().or_else(|| {
            self.target
                .as_ref()
                .map(|t| default_log_path(&t.vmtype, &t.vmid))
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
