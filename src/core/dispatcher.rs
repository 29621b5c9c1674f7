use std::time::Duration;

use chrono::{DateTime, Utc};

use tracing::{debug, error, info, warn};

use crate::context::{HookContext, Invocation};
use crate::core::host::{HostFacts, guest_description, node_description};
use crate::core::log_capture::{self, MAX_PAYLOAD_BYTES};
use crate::core::models::{BackupJob, BackupTarget, Outcome, Phase, RunStatus, TargetReport};
use crate::core::naming::{Slug, slug};
use crate::core::tags::{Tags, job_tag};
use crate::error::HookError;
use crate::monitor::{
    EndpointRef, EndpointSpec, EndpointStatus, MonitoringClient, PingState, Schedule,
};

const JOB_SCHEDULE: Schedule = Schedule {
    timeout: Duration::from_secs(86_400),
    grace: Duration::from_secs(7_200),
};

const TARGET_SCHEDULE: Schedule = Schedule {
    timeout: Duration::from_secs(86_400),
    grace: Duration::from_secs(3_600),
};

/// Maps each backup phase to monitoring calls.
///
/// Holds no state of its own: every handler re-derives the slugs it needs
/// from the job id, the target and the host identity.
pub struct Dispatcher {
    ctx: HookContext,
}

impl Dispatcher {
    pub fn new(ctx: HookContext) -> Self {
        Self { ctx }
    }

    /// Handle one invocation.
    ///
    /// Errors are returned only for the gating phases (`job-init`,
    /// `job-start`). Anything failing later is logged and swallowed so the
    /// backup itself is never failed by monitoring.
    pub async fn run(&self, inv: &Invocation) -> Result<(), HookError> {
        let subject = self.subject_slug(inv);

        match self.handle_phase(inv).await {
            Ok(()) => {
                debug!(phase = %inv.phase, slug = %subject, "Phase handled");
                Ok(())
            }
            Err(e) if inv.phase.is_critical() => {
                error!(phase = %inv.phase, slug = %subject, error = %e, "Monitoring setup failed");
                Err(e)
            }
            Err(e) => {
                warn!(
                    phase = %inv.phase,
                    slug = %subject,
                    error = %e,
                    "Monitoring update failed, backup continues"
                );
                Ok(())
            }
        }
    }

    pub fn job_slug(&self) -> Slug {
        slug(&self.ctx.host, &self.ctx.config.job_id, None)
    }

    pub fn target_slug(&self, target: &BackupTarget) -> Slug {
        slug(&self.ctx.host, &self.ctx.config.job_id, Some(target))
    }

    fn subject_slug(&self, inv: &Invocation) -> Slug {
        match &inv.target {
            Some(target) => self.target_slug(target),
            None => self.job_slug(),
        }
    }

    fn client(&self) -> &MonitoringClient {
        &self.ctx.client
    }

    async fn handle_phase(&self, inv: &Invocation) -> Result<(), HookError> {
        match &inv.phase {
            Phase::JobInit => self.handle_job_init(inv).await,
            Phase::JobStart => self.handle_job_start().await,
            Phase::BackupStart => self.handle_backup_start(inv).await,
            Phase::PreStop | Phase::PreRestart | Phase::PostRestart => {
                self.handle_progress(inv).await
            }
            Phase::BackupEnd => {
                let outcome = inv.outcome.unwrap_or(Outcome::Success);
                self.handle_backup_end(inv, outcome).await
            }
            Phase::BackupAbort => self.handle_backup_abort(inv).await,
            Phase::LogEnd => self.handle_log_end(inv).await,
            Phase::JobEnd => self.handle_job_end().await,
            Phase::JobAbort => self.handle_job_abort().await,
            Phase::Unknown(name) => {
                debug!(phase = %name, "No handler for phase, ignoring");
                Ok(())
            }
        }
    }

    async fn handle_job_init(&self, inv: &Invocation) -> Result<(), HookError> {
        let host = &self.ctx.host;
        let facts = HostFacts::collect().await;
        let tags = Tags::new()
            .with("role", "job")
            .with("cluster", &host.cluster)
            .with("node", &host.node)
            .with_opt("storage", inv.storage.as_deref())
            .with_opt("machine-id", facts.machine_id.as_deref())
            .with_opt("arch", facts.arch.as_deref())
            .with_opt("kernel", facts.kernel.as_deref());

        let spec = EndpointSpec {
            slug: self.job_slug(),
            name: format!("{} {}", self.ctx.config.job_id, host.suffix()),
            tags,
            schedule: JOB_SCHEDULE,
            description: node_description().await,
            timezone: facts.timezone().to_string(),
        };

        let endpoint = self.client().ensure_endpoint(&spec).await?;
        info!(
            slug = %endpoint.slug,
            uuid = endpoint.uuid.as_deref().unwrap_or("-"),
            "Job endpoint ready"
        );
        Ok(())
    }

    async fn handle_job_start(&self) -> Result<(), HookError> {
        let job = EndpointRef::from_slug(self.job_slug());
        self.client().send_ping(&job, PingState::Start, None).await?;
        info!(slug = %job.slug, "Job start reported");
        Ok(())
    }

    async fn handle_backup_start(&self, inv: &Invocation) -> Result<(), HookError> {
        let target = require_target(inv)?;
        let host = &self.ctx.host;
        let job = self.job_slug();

        let tags = Tags::new()
            .with("role", "target")
            .with("job", job.as_str())
            .with("cluster", &host.cluster)
            .with("node", &host.node)
            .with_opt("storage", inv.storage.as_deref())
            .with_opt("mode", inv.mode.as_deref())
            .with("vmid", &target.vmid)
            .with("vmtype", &target.vmtype)
            .with_opt("hostname", inv.guest_hostname.as_deref())
            .with_opt("type", inv.host_type.as_deref());

        let spec = EndpointSpec {
            slug: self.target_slug(target),
            name: format!(
                "{}.{}.{}.{}.{}",
                host.node,
                host.domain,
                target.vmtype,
                target.vmid,
                inv.guest_hostname.as_deref().unwrap_or("unknown")
            ),
            tags,
            schedule: TARGET_SCHEDULE,
            description: guest_description(&target.vmtype, &target.vmid).await,
            timezone: HostFacts::collect().await.timezone().to_string(),
        };

        let endpoint = self.client().ensure_endpoint(&spec).await?;
        self.client()
            .send_ping(&endpoint, PingState::Start, None)
            .await?;
        info!(slug = %endpoint.slug, target = %target.label(), "Target start reported");

        self.note_on_job(inv, target).await;
        Ok(())
    }

    /// pre-stop, pre-restart, post-restart: informational only.
    async fn handle_progress(&self, inv: &Invocation) -> Result<(), HookError> {
        let target = require_target(inv)?;
        let endpoint = EndpointRef::from_slug(self.target_slug(target));
        let note = progress_note(&inv.phase, target);

        self.client()
            .send_ping(&endpoint, PingState::Log, Some(&note))
            .await?;
        self.note_on_job(inv, target).await;
        Ok(())
    }

    async fn handle_backup_end(&self, inv: &Invocation, outcome: Outcome) -> Result<(), HookError> {
        let target = require_target(inv)?;
        let endpoint = EndpointRef::from_slug(self.target_slug(target));
        let note = progress_note(&inv.phase, target);

        self.client()
            .send_ping(&endpoint, PingState::from(outcome), Some(&note))
            .await?;
        info!(slug = %endpoint.slug, outcome = ?outcome, "Target outcome reported");

        self.note_on_job(inv, target).await;
        Ok(())
    }

    async fn handle_backup_abort(&self, inv: &Invocation) -> Result<(), HookError> {
        self.handle_backup_end(inv, Outcome::Failure).await?;

        let target = require_target(inv)?;
        let slug = self.target_slug(target);
        match self.client().find_endpoint(&slug).await {
            Ok(Some(EndpointStatus {
                uuid: Some(uuid), ..
            })) => {
                warn!(
                    slug = %slug,
                    vmid = %target.vmid,
                    url = %self.client().dashboard_url(&uuid),
                    "Backup aborted"
                );
            }
            Ok(_) => warn!(slug = %slug, vmid = %target.vmid, "Backup aborted"),
            Err(e) => debug!(slug = %slug, error = %e, "Endpoint lookup failed"),
        }
        Ok(())
    }

    async fn handle_log_end(&self, inv: &Invocation) -> Result<(), HookError> {
        let target = require_target(inv)?;
        let endpoint = EndpointRef::from_slug(self.target_slug(target));

        let Some(path) = inv.log_path() else {
            return Err(HookError::MissingTarget {
                phase: inv.phase.to_string(),
            });
        };

        let payload = log_capture::capture(&path, MAX_PAYLOAD_BYTES).await?;
        self.client()
            .send_ping(&endpoint, PingState::Log, Some(&payload))
            .await?;
        info!(slug = %endpoint.slug, bytes = payload.len(), "Target log forwarded");
        Ok(())
    }

    /// Recompute the job outcome from the service's view of its targets.
    /// Anything short of every target succeeding reports a failure.
    async fn handle_job_end(&self) -> Result<(), HookError> {
        let job = EndpointRef::from_slug(self.job_slug());
        let job_id = &self.ctx.config.job_id;

        let endpoints = match self.current_targets(&job.slug).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(slug = %job.slug, error = %e, "Target status unavailable, reporting job failure");
                let note = format!("job {}: target status unavailable: {}", job_id, e);
                self.client()
                    .send_ping(&job, PingState::Failure, Some(&note))
                    .await?;
                return Err(e);
            }
        };

        let report = BackupJob {
            id: job_id.clone(),
            targets: endpoints.iter().map(TargetReport::from).collect(),
        };
        let status = report.status();
        let state = if status == RunStatus::Success {
            PingState::Success
        } else {
            PingState::Failure
        };

        self.client()
            .send_ping(&job, state, Some(&report.summary()))
            .await?;
        info!(
            slug = %job.slug,
            status = status.as_str(),
            targets = report.targets.len(),
            "Job outcome reported"
        );
        Ok(())
    }

    /// Targets of the current run: tagged with the job and pinged since the
    /// job's latest start signal. Without a visible start, every tagged
    /// target counts.
    async fn current_targets(&self, job: &Slug) -> Result<Vec<EndpointStatus>, HookError> {
        let since = self.run_started_at(job).await?;
        let tagged = self.client().list_endpoints(&job_tag(job)).await?;

        let Some(since) = since else {
            warn!(slug = %job, "No start signal found for job, counting every tagged target");
            return Ok(tagged);
        };

        let (current, stale): (Vec<_>, Vec<_>) =
            tagged.into_iter().partition(|t| t.pinged_since(since));
        if !stale.is_empty() {
            debug!(slug = %job, stale = stale.len(), "Ignoring targets from earlier runs");
        }
        Ok(current)
    }

    async fn run_started_at(&self, job: &Slug) -> Result<Option<DateTime<Utc>>, HookError> {
        match self.client().find_endpoint(job).await? {
            Some(EndpointStatus {
                uuid: Some(uuid), ..
            }) => self.client().last_start(&uuid).await,
            _ => Ok(None),
        }
    }

    async fn handle_job_abort(&self) -> Result<(), HookError> {
        let job = EndpointRef::from_slug(self.job_slug());
        let note = format!("job {} aborted", self.ctx.config.job_id);
        self.client()
            .send_ping(&job, PingState::Failure, Some(&note))
            .await
    }

    /// Mirror a target's progress on the job endpoint. Best effort.
    async fn note_on_job(&self, inv: &Invocation, target: &BackupTarget) {
        let job = EndpointRef::from_slug(self.job_slug());
        let note = progress_note(&inv.phase, target);

        if let Err(e) = self
            .client()
            .send_ping(&job, PingState::Log, Some(&note))
            .await
        {
            warn!(phase = %inv.phase, slug = %job.slug, error = %e, "Failed to log progress on job endpoint");
        }
    }
}

fn require_target(inv: &Invocation) -> Result<&BackupTarget, HookError> {
    inv.target.as_ref().ok_or_else(|| HookError::MissingTarget {
        phase: inv.phase.to_string(),
    })
}

fn progress_note(phase: &Phase, target: &BackupTarget) -> String {
    format!("{}: {}", phase, target.label())
}
