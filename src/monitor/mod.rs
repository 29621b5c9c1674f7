//! Client for the heartbeat monitoring service.
//!
//! ## Architecture
//!
//! - `api`: wire types of the management API
//! - `retry`: backoff policy injected into the client
//! - `transport`: the HTTP seam, with a reqwest implementation
//! - `simulated`: an in-memory service behind the same seam
//!
//! The client keeps no state between calls. Every request is retried on
//! network failures only; credential and request errors surface at once.

pub mod api;
pub mod retry;
pub mod simulated;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::HookConfig;
use crate::core::models::{Outcome, RunStatus, TargetReport};
use crate::core::naming::Slug;
use crate::core::tags::Tags;
use crate::error::HookError;

pub use api::CheckStatus;
pub use retry::RetryPolicy;
pub use simulated::{Fault, RecordedPing, SimulatedCheck, SimulatedService};
pub use transport::{
    HttpMethod, HttpRequest, HttpResponse, ReqwestTransport, RequestBody, Transport,
    TransportError,
};

/// Pick the transport: the real service, or the in-memory one.
pub fn get_transport(
    simulation: bool,
    policy: &RetryPolicy,
) -> Result<Arc<dyn Transport>, HookError> {
    if simulation {
        return Ok(Arc::new(SimulatedService::auto_provisioning()));
    }

    let transport = ReqwestTransport::new(policy.request_timeout)
        .map_err(|e| HookError::Config(format!("failed to build HTTP client: {}", e)))?;
    Ok(Arc::new(transport))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Start,
    Success,
    Failure,
    Log,
}

impl PingState {
    /// Path suffix appended to the ping URL.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Start => "/start",
            Self::Success => "",
            Self::Failure => "/fail",
            Self::Log => "/log",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Log => "log",
        }
    }
}

impl From<Outcome> for PingState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Success,
            Outcome::Failure => Self::Failure,
        }
    }
}

/// Expected period and grace time of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub timeout: Duration,
    pub grace: Duration,
}

#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub slug: Slug,
    pub name: String,
    pub tags: Tags,
    pub schedule: Schedule,
    pub description: String,
    /// IANA name, empty when unknown.
    pub timezone: String,
}

/// Handle on a remote endpoint. Pings only need the slug, so a ref can be
/// rebuilt from a slug in any later invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRef {
    pub slug: Slug,
    pub uuid: Option<String>,
}

impl EndpointRef {
    pub fn from_slug(slug: Slug) -> Self {
        Self { slug, uuid: None }
    }
}

/// Remote view of one endpoint, as listed by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub slug: Slug,
    pub uuid: Option<String>,
    pub name: String,
    pub tags: String,
    pub status: CheckStatus,
    pub started: bool,
    pub last_ping: Option<DateTime<Utc>>,
}

impl EndpointStatus {
    pub fn run_status(&self) -> RunStatus {
        if self.started {
            return RunStatus::Running;
        }
        match self.status {
            CheckStatus::Up | CheckStatus::Grace => RunStatus::Success,
            CheckStatus::Down => RunStatus::Failed,
            CheckStatus::New | CheckStatus::Paused | CheckStatus::Unknown => RunStatus::Pending,
        }
    }

    /// Whether the endpoint heard anything at or after `since`.
    pub fn pinged_since(&self, since: DateTime<Utc>) -> bool {
        self.last_ping.is_some_and(|at| at >= since)
    }

    /// `<vmid>-<vmtype>` when tagged, otherwise the endpoint name or slug.
    pub fn label(&self) -> String {
        match (
            Tags::lookup(&self.tags, "vmid"),
            Tags::lookup(&self.tags, "vmtype"),
        ) {
            (Some(vmid), Some(vmtype)) => format!("{}-{}", vmid, vmtype),
            _ if !self.name.is_empty() => self.name.clone(),
            _ => self.slug.to_string(),
        }
    }
}

impl From<&EndpointStatus> for TargetReport {
    fn from(endpoint: &EndpointStatus) -> Self {
        TargetReport {
            label: endpoint.label(),
            status: endpoint.run_status(),
        }
    }
}

/// Service location and credentials.
#[derive(Clone)]
pub struct ServiceEndpoints {
    pub api_base: String,
    pub ping_base: String,
    pub rw_api_key: String,
    pub ping_key: String,
}

impl From<&HookConfig> for ServiceEndpoints {
    fn from(config: &HookConfig) -> Self {
        Self {
            api_base: config.base_domain.clone(),
            ping_base: config.ping_domain.clone(),
            rw_api_key: config.rw_api_key.clone(),
            ping_key: config.ping_key.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MonitoringClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    service: ServiceEndpoints,
}

impl MonitoringClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, service: ServiceEndpoints) -> Self {
        Self {
            transport,
            policy,
            service,
        }
    }

    /// Create the endpoint, or update it in place if the slug exists.
    pub async fn ensure_endpoint(&self, spec: &EndpointSpec) -> Result<EndpointRef, HookError> {
        let body = api::UpsertCheck {
            name: spec.name.clone(),
            slug: spec.slug.to_string(),
            tags: spec.tags.to_string(),
            desc: spec.description.clone(),
            timeout: spec.schedule.timeout.as_secs(),
            grace: spec.schedule.grace.as_secs(),
            tz: spec.timezone.clone(),
            channels: "*".to_string(),
            unique: vec!["slug".to_string()],
        };
        let body = serde_json::to_value(&body).map_err(|e| HookError::Validation {
            status: 0,
            body: format!("unserializable check: {}", e),
        })?;

        let request = HttpRequest {
            method: HttpMethod::Post,
            url: self.api_url(api::CHECKS_PATH, None)?,
            api_key: Some(self.service.rw_api_key.clone()),
            body: Some(RequestBody::Json(body)),
        };

        let response = self.execute("ensure_endpoint", spec.slug.as_str(), request).await?;
        let record: api::CheckRecord = decode(&response)?;

        debug!(
            slug = %spec.slug,
            created = response.status == 201,
            "Endpoint ensured"
        );

        Ok(EndpointRef {
            slug: spec.slug.clone(),
            uuid: record.uuid,
        })
    }

    pub async fn send_ping(
        &self,
        endpoint: &EndpointRef,
        state: PingState,
        payload: Option<&str>,
    ) -> Result<(), HookError> {
        let url = format!(
            "{}/{}/{}{}",
            self.service.ping_base,
            self.service.ping_key,
            endpoint.slug,
            state.suffix()
        );

        let request = HttpRequest {
            method: HttpMethod::Post,
            url,
            api_key: None,
            body: Some(RequestBody::Text(payload.unwrap_or_default().to_string())),
        };

        self.execute("send_ping", endpoint.slug.as_str(), request).await?;
        debug!(slug = %endpoint.slug, state = state.as_str(), "Ping sent");
        Ok(())
    }

    /// List endpoints carrying `tag`.
    pub async fn list_endpoints(&self, tag: &str) -> Result<Vec<EndpointStatus>, HookError> {
        self.query_checks("list_endpoints", ("tag", tag)).await
    }

    /// Look up one endpoint by slug.
    pub async fn find_endpoint(&self, slug: &Slug) -> Result<Option<EndpointStatus>, HookError> {
        let mut found = self
            .query_checks("find_endpoint", ("slug", slug.as_str()))
            .await?;
        Ok(found.pop())
    }

    /// Time of the most recent start signal in an endpoint's history.
    pub async fn last_start(&self, uuid: &str) -> Result<Option<DateTime<Utc>>, HookError> {
        let request = HttpRequest {
            method: HttpMethod::Get,
            url: self.api_url(&api::pings_path(uuid), None)?,
            api_key: Some(self.service.rw_api_key.clone()),
            body: None,
        };

        let response = self.execute("last_start", uuid, request).await?;
        let list: api::PingList = decode(&response)?;

        Ok(list
            .pings
            .into_iter()
            .filter(|ping| ping.kind == "start")
            .map(|ping| ping.date)
            .max())
    }

    /// Page of an endpoint in the service's web UI.
    pub fn dashboard_url(&self, uuid: &str) -> String {
        format!("{}/checks/{}/details/", self.service.api_base, uuid)
    }

    async fn query_checks(
        &self,
        op: &'static str,
        filter: (&str, &str),
    ) -> Result<Vec<EndpointStatus>, HookError> {
        let request = HttpRequest {
            method: HttpMethod::Get,
            url: self.api_url(api::CHECKS_PATH, Some(filter))?,
            api_key: Some(self.service.rw_api_key.clone()),
            body: None,
        };

        let response = self.execute(op, filter.1, request).await?;
        let list: api::CheckList = decode(&response)?;

        Ok(list
            .checks
            .into_iter()
            .map(|check| EndpointStatus {
                slug: Slug::from_raw(check.slug),
                uuid: check.uuid,
                name: check.name,
                tags: check.tags,
                status: check.status,
                started: check.started,
                last_ping: check.last_ping,
            })
            .collect())
    }

    fn api_url(&self, path: &str, query: Option<(&str, &str)>) -> Result<String, HookError> {
        let mut url = reqwest::Url::parse(&format!("{}{}", self.service.api_base, path))
            .map_err(|e| HookError::Config(format!("invalid HC_BASE_DOMAIN: {}", e)))?;
        if let Some((key, value)) = query {
            url.query_pairs_mut().append_pair(key, value);
        }
        Ok(url.to_string())
    }

    /// Run one request under the retry policy. `subject` is the slug or tag
    /// the request is about, for logging.
    async fn execute(
        &self,
        op: &'static str,
        subject: &str,
        request: HttpRequest,
    ) -> Result<HttpResponse, HookError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(
                self.policy.request_timeout,
                self.transport.send(request.clone()),
            )
            .await
            {
                Err(_) => Err(HookError::from(TransportError::Timeout)),
                Ok(Err(e)) => Err(HookError::from(e)),
                Ok(Ok(response)) => match HookError::from_status(response.status, &response.body) {
                    Some(e) => Err(e),
                    None => Ok(response),
                },
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt - 1);
                    warn!(
                        op,
                        subject,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(op, subject, attempt, error = %e, "Request failed");
                    return Err(e);
                }
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(response: &HttpResponse) -> Result<T, HookError> {
    serde_json::from_str(&response.body).map_err(|e| HookError::Validation {
        status: response.status,
        body: format!("unexpected response body: {}", e),
    })
}
