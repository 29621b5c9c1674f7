use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use super::api::{CHECKS_PATH, CheckList, CheckRecord, CheckStatus, PingList, PingRecord, UpsertCheck};
use super::transport::{HttpMethod, HttpRequest, HttpResponse, RequestBody, Transport, TransportError};
use super::PingState;

/// Failure to inject into the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Connection refused before any response.
    Network,
    /// Respond with this status code and no side effects.
    Status(u16),
    /// Hold the request this long, then serve it normally.
    Stall(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedCheck {
    pub slug: String,
    pub uuid: String,
    pub name: String,
    pub tags: String,
    pub desc: String,
    pub timeout: u64,
    pub grace: u64,
    pub tz: String,
    pub status: CheckStatus,
    pub started: bool,
    pub n_pings: u64,
    pub last_ping: Option<DateTime<Utc>>,
}

impl SimulatedCheck {
    fn new(slug: &str, uuid: String) -> Self {
        Self {
            slug: slug.to_string(),
            uuid,
            name: String::new(),
            tags: String::new(),
            desc: String::new(),
            timeout: 0,
            grace: 0,
            tz: String::new(),
            status: CheckStatus::New,
            started: false,
            n_pings: 0,
            last_ping: None,
        }
    }

    fn record(&self) -> CheckRecord {
        CheckRecord {
            name: self.name.clone(),
            slug: self.slug.clone(),
            tags: self.tags.clone(),
            status: self.status,
            started: self.started,
            last_ping: self.last_ping,
            uuid: Some(self.uuid.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPing {
    pub slug: String,
    pub state: PingState,
    pub body: String,
    pub at: DateTime<Utc>,
}

/// Start of the simulated clock.
const EPOCH_SECS: i64 = 1_700_000_000;

#[derive(Default)]
struct State {
    checks: BTreeMap<String, SimulatedCheck>,
    pings: Vec<RecordedPing>,
    faults: VecDeque<Fault>,
    requests: usize,
    next_id: u64,
    ticks: i64,
}

impl State {
    /// Every ping lands one second after the previous one, so ordering by
    /// time is never ambiguous.
    fn tick(&mut self) -> DateTime<Utc> {
        self.ticks += 1;
        DateTime::from_timestamp(EPOCH_SECS + self.ticks, 0).unwrap_or_default()
    }

    fn new_uuid(&mut self) -> String {
        self.next_id += 1;
        format!("00000000-0000-4000-8000-{:012x}", self.next_id)
    }
}

/// In-memory monitoring service behind the [`Transport`] seam.
///
/// Implements the subset of the API the hook uses: upsert by slug, list by
/// tag, and slug pings. Clones share state, so a test can hand one clone to
/// the client and inspect the other.
#[derive(Clone, Default)]
pub struct SimulatedService {
    state: Arc<Mutex<State>>,
    credentials: Option<(String, String)>,
    auto_provision: bool,
}

impl SimulatedService {
    /// Accepts any key. Pings to unknown slugs get a 404.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects any read-write key or ping key other than these.
    pub fn with_credentials(rw_api_key: &str, ping_key: &str) -> Self {
        Self {
            credentials: Some((rw_api_key.to_string(), ping_key.to_string())),
            ..Self::default()
        }
    }

    /// Pings to unknown slugs create the check first. Used for dry runs,
    /// where each invocation starts with an empty service.
    pub fn auto_provisioning() -> Self {
        Self {
            auto_provision: true,
            ..Self::default()
        }
    }

    /// Fail the next request with `fault`. Faults queue in order.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    pub fn inject_n(&self, fault: Fault, times: usize) {
        let mut state = self.lock();
        for _ in 0..times {
            state.faults.push_back(fault.clone());
        }
    }

    pub fn checks(&self) -> Vec<SimulatedCheck> {
        self.lock().checks.values().cloned().collect()
    }

    pub fn check(&self, slug: &str) -> Option<SimulatedCheck> {
        self.lock().checks.get(slug).cloned()
    }

    pub fn pings(&self) -> Vec<RecordedPing> {
        self.lock().pings.clone()
    }

    pub fn pings_for(&self, slug: &str) -> Vec<RecordedPing> {
        self.lock()
            .pings
            .iter()
            .filter(|p| p.slug == slug)
            .cloned()
            .collect()
    }

    /// Requests received, faulted ones included.
    pub fn request_count(&self) -> usize {
        self.lock().requests
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_api(&self, request: &HttpRequest, url: &reqwest::Url) -> HttpResponse {
        if let Some((rw_key, _)) = &self.credentials {
            if request.api_key.as_deref() != Some(rw_key.as_str()) {
                return HttpResponse::new(401, json!({"error": "wrong api key"}).to_string());
            }
        }

        if let Some(uuid) = history_uuid(url.path()) {
            return self.history(uuid);
        }

        match request.method {
            HttpMethod::Get => {
                let query = |key: &str| {
                    url.query_pairs()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| v.into_owned())
                };
                self.list(query("tag").as_deref(), query("slug").as_deref())
            }
            HttpMethod::Post => match &request.body {
                Some(RequestBody::Json(value)) => match serde_json::from_value(value.clone()) {
                    Ok(upsert) => self.upsert(upsert),
                    Err(e) => HttpResponse::new(400, json!({"error": e.to_string()}).to_string()),
                },
                _ => HttpResponse::new(400, json!({"error": "could not parse request body"}).to_string()),
            },
        }
    }

    fn list(&self, tag: Option<&str>, slug: Option<&str>) -> HttpResponse {
        let state = self.lock();
        let checks = state
            .checks
            .values()
            .filter(|c| match tag {
                Some(tag) => c.tags.split_whitespace().any(|t| t == tag),
                None => true,
            })
            .filter(|c| slug.is_none_or(|slug| c.slug == slug))
            .map(SimulatedCheck::record)
            .collect();

        let body = serde_json::to_string(&CheckList { checks }).unwrap_or_default();
        HttpResponse::new(200, body)
    }

    /// Ping history, newest first like the real service.
    fn history(&self, uuid: &str) -> HttpResponse {
        let state = self.lock();
        let Some(check) = state.checks.values().find(|c| c.uuid == uuid) else {
            return HttpResponse::new(404, json!({"error": "not found"}).to_string());
        };

        let pings = state
            .pings
            .iter()
            .rev()
            .filter(|p| p.slug == check.slug)
            .map(|p| PingRecord {
                kind: wire_kind(p.state).to_string(),
                date: p.at,
            })
            .collect();

        let body = serde_json::to_string(&PingList { pings }).unwrap_or_default();
        HttpResponse::new(200, body)
    }

    fn upsert(&self, upsert: UpsertCheck) -> HttpResponse {
        let valid_slug = !upsert.slug.is_empty()
            && upsert
                .slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid_slug {
            return HttpResponse::new(400, json!({"error": "invalid slug"}).to_string());
        }

        let mut state = self.lock();
        let status = if state.checks.contains_key(&upsert.slug) {
            200
        } else {
            let uuid = state.new_uuid();
            state
                .checks
                .insert(upsert.slug.clone(), SimulatedCheck::new(&upsert.slug, uuid));
            201
        };

        let Some(check) = state.checks.get_mut(&upsert.slug) else {
            return HttpResponse::new(500, "lost check");
        };
        check.name = upsert.name;
        check.tags = upsert.tags;
        check.desc = upsert.desc;
        check.timeout = upsert.timeout;
        check.grace = upsert.grace;
        check.tz = upsert.tz;

        let body = serde_json::to_string(&check.record()).unwrap_or_default();
        HttpResponse::new(status, body)
    }

    fn handle_ping(&self, request: &HttpRequest, url: &reqwest::Url) -> HttpResponse {
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let (state, rest) = match segments.split_last() {
            Some((&"start", rest)) => (PingState::Start, rest),
            Some((&"fail", rest)) => (PingState::Failure, rest),
            Some((&"log", rest)) => (PingState::Log, rest),
            Some(_) => (PingState::Success, segments.as_slice()),
            None => return HttpResponse::new(400, "invalid url format"),
        };

        let [.., key, slug] = rest else {
            return HttpResponse::new(400, "invalid url format");
        };

        if let Some((_, ping_key)) = &self.credentials {
            if *key != ping_key.as_str() {
                return HttpResponse::new(404, "not found");
            }
        }

        let body = match &request.body {
            Some(RequestBody::Text(text)) => text.clone(),
            Some(RequestBody::Json(value)) => value.to_string(),
            None => String::new(),
        };

        let mut guard = self.lock();
        let shared = &mut *guard;

        if !shared.checks.contains_key(*slug) {
            if !self.auto_provision {
                return HttpResponse::new(404, "not found");
            }
            let mut check = SimulatedCheck::new(slug, shared.new_uuid());
            check.name = slug.to_string();
            shared.checks.insert(slug.to_string(), check);
        }

        let at = shared.tick();
        if let Some(check) = shared.checks.get_mut(*slug) {
            check.n_pings += 1;
            // Log events leave last_ping alone, as on the real service.
            if state != PingState::Log {
                check.last_ping = Some(at);
            }
            match state {
                PingState::Start => check.started = true,
                PingState::Success => {
                    check.status = CheckStatus::Up;
                    check.started = false;
                }
                PingState::Failure => {
                    check.status = CheckStatus::Down;
                    check.started = false;
                }
                PingState::Log => {}
            }
        }

        shared.pings.push(RecordedPing {
            slug: slug.to_string(),
            state,
            body,
            at,
        });

        HttpResponse::new(200, "OK")
    }
}

#[async_trait]
impl Transport for SimulatedService {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let fault = {
            let mut state = self.lock();
            state.requests += 1;
            state.faults.pop_front()
        };

        match fault {
            Some(Fault::Network) => {
                return Err(TransportError::Connect(
                    "simulated connection refused".to_string(),
                ));
            }
            Some(Fault::Status(code)) => {
                return Ok(HttpResponse::new(code, "simulated failure"));
            }
            Some(Fault::Stall(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| TransportError::Other(format!("invalid url: {}", e)))?;

        let (kind, response) = if url.path().contains(CHECKS_PATH) {
            ("api", self.handle_api(&request, &url))
        } else {
            ("ping", self.handle_ping(&request, &url))
        };

        info!(
            kind,
            method = ?request.method,
            status = response.status,
            "(SimulatedService) Handled request"
        );

        Ok(response)
    }
}

/// `<uuid>` of a `.../checks/<uuid>/pings/` path.
fn history_uuid(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once(CHECKS_PATH)?;
    let uuid = rest.strip_suffix("/pings/")?;
    (!uuid.is_empty() && !uuid.contains('/')).then_some(uuid)
}

fn wire_kind(state: PingState) -> &'static str {
    match state {
        PingState::Start => "start",
        PingState::Success => "success",
        PingState::Failure => "fail",
        PingState::Log => "log",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(slug: &str, suffix: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Post,
            url: format!("https://hc.test/ping/key/{}{}", slug, suffix),
            api_key: None,
            body: Some(RequestBody::Text(body.to_string())),
        }
    }

    fn upsert(slug: &str, tags: &str) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Post,
            url: format!("https://hc.test{}", CHECKS_PATH),
            api_key: Some("rw".into()),
            body: Some(RequestBody::Json(json!({
                "name": slug, "slug": slug, "tags": tags,
                "timeout": 60, "grace": 60, "unique": ["slug"]
            }))),
        }
    }

    #[tokio::test]
    async fn test_upsert_then_update() {
        let service = SimulatedService::new();

        let first = service.send(upsert("a", "x=1")).await.unwrap();
        let second = service.send(upsert("a", "x=2")).await.unwrap();

        assert_eq!(first.status, 201);
        assert_eq!(second.status, 200);
        assert_eq!(service.checks().len(), 1);
        assert_eq!(service.check("a").unwrap().tags, "x=2");
    }

    #[tokio::test]
    async fn test_ping_transitions() {
        let service = SimulatedService::new();
        service.send(upsert("a", "")).await.unwrap();

        service.send(ping("a", "/start", "")).await.unwrap();
        assert!(service.check("a").unwrap().started);

        service.send(ping("a", "/log", "note")).await.unwrap();
        assert!(service.check("a").unwrap().started);

        service.send(ping("a", "/fail", "boom")).await.unwrap();
        let check = service.check("a").unwrap();
        assert_eq!(check.status, CheckStatus::Down);
        assert!(!check.started);
        assert_eq!(check.n_pings, 3);

        let pings = service.pings_for("a");
        assert_eq!(pings[1].body, "note");
        assert_eq!(pings[2].state, PingState::Failure);
    }

    #[tokio::test]
    async fn test_ping_history_newest_first() {
        let service = SimulatedService::new();
        service.send(upsert("a", "")).await.unwrap();
        service.send(ping("a", "/start", "")).await.unwrap();
        service.send(ping("a", "", "")).await.unwrap();

        let uuid = service.check("a").unwrap().uuid;
        let response = service
            .send(HttpRequest {
                method: HttpMethod::Get,
                url: format!("https://hc.test{}{}/pings/", CHECKS_PATH, uuid),
                api_key: Some("rw".into()),
                body: None,
            })
            .await
            .unwrap();

        let list: PingList = serde_json::from_str(&response.body).unwrap();
        let kinds: Vec<&str> = list.pings.iter().map(|p| p.kind.as_str()).collect();
        assert_eq!(kinds, vec!["success", "start"]);
        assert!(list.pings[0].date > list.pings[1].date);
        assert_eq!(service.check("a").unwrap().last_ping, Some(list.pings[0].date));
    }

    #[tokio::test]
    async fn test_unknown_slug_is_not_found() {
        let service = SimulatedService::new();
        let response = service.send(ping("ghost", "", "")).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(service.pings().is_empty());
    }

    #[tokio::test]
    async fn test_auto_provisioning() {
        let service = SimulatedService::auto_provisioning();
        let response = service.send(ping("ghost", "", "")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(service.check("ghost").unwrap().status, CheckStatus::Up);
    }

    #[tokio::test]
    async fn test_credentials_enforced() {
        let service = SimulatedService::with_credentials("good", "pk");
        let response = service.send(upsert("a", "")).await.unwrap();
        assert_eq!(response.status, 401);
        assert!(service.checks().is_empty());
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let service = SimulatedService::new();
        service.inject(Fault::Network);
        service.inject(Fault::Status(503));

        assert!(service.send(upsert("a", "")).await.is_err());
        assert_eq!(service.send(upsert("a", "")).await.unwrap().status, 503);
        assert_eq!(service.send(upsert("a", "")).await.unwrap().status, 201);
        assert_eq!(service.request_count(), 3);
    }
}
