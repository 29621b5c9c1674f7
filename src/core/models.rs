use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle phases emitted by the backup tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    JobInit,
    JobStart,
    BackupStart,
    PreStop,
    PreRestart,
    PostRestart,
    BackupEnd,
    BackupAbort,
    LogEnd,
    JobEnd,
    JobAbort,
    /// Any phase this hook has no handler for. Dispatching it is a no-op.
    Unknown(String),
}

impl Phase {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "job-init" => Self::JobInit,
            "job-start" => Self::JobStart,
            "backup-start" => Self::BackupStart,
            "pre-stop" => Self::PreStop,
            "pre-restart" => Self::PreRestart,
            "post-restart" => Self::PostRestart,
            "backup-end" => Self::BackupEnd,
            "backup-abort" => Self::BackupAbort,
            "log-end" => Self::LogEnd,
            "job-end" => Self::JobEnd,
            "job-abort" => Self::JobAbort,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::JobInit => "job-init",
            Self::JobStart => "job-start",
            Self::BackupStart => "backup-start",
            Self::PreStop => "pre-stop",
            Self::PreRestart => "pre-restart",
            Self::PostRestart => "post-restart",
            Self::BackupEnd => "backup-end",
            Self::BackupAbort => "backup-abort",
            Self::LogEnd => "log-end",
            Self::JobEnd => "job-end",
            Self::JobAbort => "job-abort",
            Self::Unknown(name) => name,
        }
    }

    /// Failures in these phases abort the backup job.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::JobInit | Self::JobStart)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one target's backup as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" | "ok" => Ok(Self::Success),
            "failure" | "fail" | "failed" => Ok(Self::Failure),
            other => Err(format!("unknown outcome: {}", other)),
        }
    }
}

/// One guest (VM or container) covered by a backup job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    pub vmid: String,
    /// Guest type as reported by the host, e.g. `qemu` or `lxc`.
    pub vmtype: String,
}

impl BackupTarget {
    pub fn new(vmid: impl Into<String>, vmtype: impl Into<String>) -> Self {
        Self {
            vmid: vmid.into(),
            vmtype: vmtype.into(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}-{}", self.vmid, self.vmtype)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub label: String,
    pub status: RunStatus,
}

/// A job reconstructed from the monitoring service's view of its targets.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub id: String,
    pub targets: Vec<TargetReport>,
}

impl BackupJob {
    /// Aggregate status: failed if any target failed, running while any
    /// target has not reached a terminal status, success otherwise.
    pub fn status(&self) -> RunStatus {
        if self.targets.iter().any(|t| t.status == RunStatus::Failed) {
            return RunStatus::Failed;
        }
        if self.targets.iter().any(|t| !t.status.is_terminal()) {
            return RunStatus::Running;
        }
        RunStatus::Success
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "job {}: {} ({} targets)",
            self.id,
            self.status().as_str(),
            self.targets.len()
        )];
        for target in &self.targets {
            lines.push(format!("{}: {}", target.label, target.status.as_str()));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(label: &str, status: RunStatus) -> TargetReport {
        TargetReport {
            label: label.to_string(),
            status,
        }
    }

    #[test]
    fn test_phase_names_round_trip() {
        for name in [
            "job-init",
            "job-start",
            "backup-start",
            "pre-stop",
            "pre-restart",
            "post-restart",
            "backup-end",
            "backup-abort",
            "log-end",
            "job-end",
            "job-abort",
        ] {
            let phase = Phase::from_name(name);
            assert!(!matches!(phase, Phase::Unknown(_)), "{}", name);
            assert_eq!(phase.as_str(), name);
        }
    }

    #[test]
    fn test_unknown_phase() {
        let phase = Phase::from_name("snapshot-frobnicate");
        assert_eq!(phase, Phase::Unknown("snapshot-frobnicate".into()));
        assert!(!phase.is_critical());
    }

    #[test]
    fn test_only_gating_phases_are_critical() {
        assert!(Phase::JobInit.is_critical());
        assert!(Phase::JobStart.is_critical());
        assert!(!Phase::BackupStart.is_critical());
        assert!(!Phase::BackupEnd.is_critical());
        assert!(!Phase::JobEnd.is_critical());
    }

    #[test]
    fn test_outcome_parsing() {
        assert_eq!("Success".parse::<Outcome>(), Ok(Outcome::Success));
        assert_eq!("fail".parse::<Outcome>(), Ok(Outcome::Failure));
        assert!("maybe".parse::<Outcome>().is_err());
    }

    #[test]
    fn test_job_aggregate() {
        let job = BackupJob {
            id: "J1".into(),
            targets: vec![
                report("101-qemu", RunStatus::Success),
                report("102-lxc", RunStatus::Failed),
            ],
        };
        assert_eq!(job.status(), RunStatus::Failed);

        let job = BackupJob {
            id: "J1".into(),
            targets: vec![
                report("101-qemu", RunStatus::Success),
                report("102-lxc", RunStatus::Running),
            ],
        };
        assert_eq!(job.status(), RunStatus::Running);

        let job = BackupJob {
            id: "J1".into(),
            targets: vec![report("101-qemu", RunStatus::Success)],
        };
        assert_eq!(job.status(), RunStatus::Success);
    }

    #[test]
    fn test_job_summary_lists_targets() {
        let job = BackupJob {
            id: "J1".into(),
            targets: vec![report("101-qemu", RunStatus::Failed)],
        };
        let summary = job.summary();
        assert!(summary.starts_with("job J1: failed (1 targets)"));
        assert!(summary.contains("101-qemu: failed"));
    }
}
