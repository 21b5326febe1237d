//! Declarative job and stream definitions loaded from a JSON playbook.
//!
//! A playbook turns into a [`JobRegistry`] of [`PhasedTask`]s driving HTTP
//! requests, plus a [`Collector`] of [`HttpStreamSource`]s.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use redline_backoff::{Collector, CollectorConfig, DEFAULT_TRACKED_IDS};
use redline_core::{CoreError, Slug};
use redline_jobs::{JobContext, JobRegistry, JobRunner, JobRunnerConfig, PhasedTask, TaskError};

use crate::http;
use crate::sources::HttpStreamSource;

#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error("failed to read playbook {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid playbook: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid playbook: {0}")]
    Invalid(String),

    #[error(transparent)]
    Name(#[from] CoreError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Playbook {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub streams: Vec<StreamSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub name: Slug,
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
    /// Must answer with an accepted status before a run is admitted.
    #[serde(default)]
    pub preflight: Option<RequestSpec>,
    /// Sent, best effort, when a stop is requested for an active run.
    #[serde(default)]
    pub on_stop: Vec<RequestSpec>,
    pub phases: Vec<PhaseSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseSpec {
    pub name: Slug,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub run_once: bool,
    /// Earlier phases replayed on the same session when this phase runs on its own.
    #[serde(default)]
    pub requires: Vec<Slug>,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    Request(RequestSpec),
    Poll(PollSpec),
}

/// Repeats a request until its JSON body satisfies `until`.
#[derive(Debug, Clone, Deserialize)]
pub struct PollSpec {
    pub request: RequestSpec,
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Unbounded when absent; the loop still ends on a stop request.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    pub until: Condition,
}

/// JSON pointer test against a response body.
///
/// With `each`, `pointer` must name an array and every element's `each`
/// pointer must equal `equals` (an empty array matches).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Condition {
    pub pointer: String,
    pub equals: Value,
    #[serde(default)]
    pub each: Option<String>,
}

impl Condition {
    pub fn is_met(&self, body: &Value) -> bool {
        let Some(target) = body.pointer(&self.pointer) else {
            return false;
        };
        match &self.each {
            None => *target == self.equals,
            Some(inner) => target.as_array().is_some_and(|items| {
                items
                    .iter()
                    .all(|item| item.pointer(inner) == Some(&self.equals))
            }),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.each {
            None => write!(f, "{} == {}", self.pointer, self.equals),
            Some(inner) => write!(f, "every {}{} == {}", self.pointer, inner, self.equals),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSpec {
    pub name: Slug,
    pub request: RequestSpec,
    /// Pointer to the array of items in the response; the whole body otherwise.
    #[serde(default)]
    pub items_pointer: Option<String>,
    /// Pointer to each item's id. When set, items already emitted are skipped
    /// and items without an id are dropped.
    #[serde(default)]
    pub id_pointer: Option<String>,
    #[serde(default = "default_tracked_ids")]
    pub max_tracked_ids: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Form(BTreeMap<String, String>),
    Json(Value),
}

/// A validated outbound request.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawRequest")]
pub struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Option<Body>,
    pub timeout_secs: u64,
    pub expect_status: Option<StatusCode>,
}

impl RequestSpec {
    /// `expect_status` when set, any 2xx otherwise.
    pub fn accepts(&self, status: StatusCode) -> bool {
        self.expect_status
            .map_or(status.is_success(), |expected| expected == status)
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

#[derive(Deserialize)]
struct RawRequest {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    form: Option<BTreeMap<String, String>>,
    #[serde(default)]
    json: Option<Value>,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
    #[serde(default)]
    expect_status: Option<u16>,
}

impl TryFrom<RawRequest> for RequestSpec {
    type Error = String;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        let method = Method::from_bytes(raw.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid method {:?}", raw.method))?;

        let url = Url::parse(&raw.url).map_err(|e| format!("invalid url {:?}: {e}", raw.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("unsupported url scheme in {:?}", raw.url));
        }

        if raw.timeout_secs == 0 {
            return Err(format!("timeout_secs must be greater than zero for {}", raw.url));
        }

        let headers = raw
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| format!("invalid header name {name:?}"))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| format!("invalid value for header {name}"))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, String>>()?;

        let body = match (raw.form, raw.json) {
            (Some(_), Some(_)) => {
                return Err(format!("{} has both a form and a json body", raw.url));
            }
            (Some(form), None) => Some(Body::Form(form)),
            (None, Some(json)) => Some(Body::Json(json)),
            (None, None) => None,
        };

        let expect_status = raw
            .expect_status
            .map(|code| {
                StatusCode::from_u16(code).map_err(|_| format!("invalid expect_status {code}"))
            })
            .transpose()?;

        Ok(Self {
            method,
            url,
            headers,
            body,
            timeout_secs: raw.timeout_secs,
            expect_status,
        })
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    5
}

fn default_follow_redirects() -> bool {
    true
}

fn default_tracked_ids() -> usize {
    DEFAULT_TRACKED_IDS
}

impl Playbook {
    pub fn load(path: &Path) -> Result<Self, PlaybookError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PlaybookError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, PlaybookError> {
        let playbook: Self = serde_json::from_str(raw)?;
        playbook.validate()?;
        Ok(playbook)
    }

    fn validate(&self) -> Result<(), PlaybookError> {
        for job in &self.jobs {
            if job.phases.is_empty() {
                return Err(invalid(format!("job {} has no phases", job.name)));
            }
            let mut seen = HashSet::new();
            for phase in &job.phases {
                if let Some(missing) = phase.requires.iter().find(|r| !seen.contains(r.as_str())) {
                    return Err(invalid(format!(
                        "{}/{} requires {missing}, which is not declared before it",
                        job.name, phase.name
                    )));
                }
                if !seen.insert(phase.name.as_str()) {
                    return Err(invalid(format!(
                        "job {} declares phase {} twice",
                        job.name, phase.name
                    )));
                }
                for step in &phase.steps {
                    if let StepSpec::Poll(poll) = step {
                        validate_poll(poll)
                            .map_err(|e| invalid(format!("{}/{}: {e}", job.name, phase.name)))?;
                    }
                }
            }
        }

        for stream in &self.streams {
            validate_stream(stream).map_err(|e| invalid(format!("stream {}: {e}", stream.name)))?;
        }
        Ok(())
    }

    /// One runner per job, in a registry keyed by job name.
    pub fn registry(&self, config: &JobRunnerConfig) -> Result<JobRegistry, PlaybookError> {
        let mut registry = JobRegistry::new();
        for job in &self.jobs {
            let runner = JobRunner::with_config(job.name.clone(), Arc::new(job.task()), config.clone());
            registry.register(runner)?;
        }
        Ok(registry)
    }

    pub fn collector(&self, config: CollectorConfig) -> Result<Collector, PlaybookError> {
        let mut collector = Collector::new(config);
        for stream in &self.streams {
            collector.add_stream(HttpStreamSource::new(stream.clone()))?;
        }
        Ok(collector)
    }
}

fn invalid(msg: String) -> PlaybookError {
    PlaybookError::Invalid(msg)
}

fn validate_pointer(pointer: &str) -> Result<(), String> {
    if pointer.is_empty() || pointer.starts_with('/') {
        Ok(())
    } else {
        Err(format!("json pointer {pointer:?} must be empty or start with '/'"))
    }
}

fn validate_stream(stream: &StreamSpec) -> Result<(), String> {
    for pointer in [&stream.items_pointer, &stream.id_pointer].into_iter().flatten() {
        validate_pointer(pointer)?;
    }
    if stream.max_tracked_ids == 0 {
        return Err("max_tracked_ids must be greater than zero".to_string());
    }
    Ok(())
}

fn validate_poll(poll: &PollSpec) -> Result<(), String> {
    if poll.interval_secs == 0 {
        return Err("poll interval_secs must be greater than zero".to_string());
    }
    if poll.max_attempts == Some(0) {
        return Err("poll max_attempts must be greater than zero".to_string());
    }
    validate_pointer(&poll.until.pointer)?;
    if let Some(each) = &poll.until.each {
        validate_pointer(each)?;
    }
    Ok(())
}

impl JobSpec {
    /// Phased task whose per-run session is a cookie-keeping HTTP client.
    pub fn task(&self) -> PhasedTask<Client> {
        let follow_redirects = self.follow_redirects;
        let mut task = PhasedTask::with_session(move |_| {
            Ok(http::session_client(follow_redirects).context("failed to build HTTP session")?)
        });

        for phase in &self.phases {
            let steps = phase.steps.clone();
            let action = move |ctx: &JobContext, client: &Client| run_steps(ctx, client, &steps);
            let added = if phase.run_once {
                task.once_phase(phase.name.as_str(), &phase.description, action)
            } else {
                task.phase(phase.name.as_str(), &phase.description, action)
            };
            task = added.requires(phase.requires.iter().map(Slug::as_str));
        }

        if let Some(check) = self.preflight.clone() {
            task = task.preflight(move || preflight(&check));
        }
        if !self.on_stop.is_empty() {
            let requests = self.on_stop.clone();
            task = task.on_stop(move |ctx| send_stop_requests(ctx, &requests));
        }
        task
    }
}

fn run_steps(ctx: &JobContext, client: &Client, steps: &[StepSpec]) -> Result<(), TaskError> {
    for (i, step) in steps.iter().enumerate() {
        if i > 0 && ctx.stop_requested() {
            ctx.warn("Stop requested, skipping remaining steps");
            return Ok(());
        }
        match step {
            StepSpec::Request(request) => {
                execute(ctx, client, request)?;
            }
            StepSpec::Poll(poll) => run_poll(ctx, client, poll)?,
        }
    }
    Ok(())
}

fn execute(ctx: &JobContext, client: &Client, request: &RequestSpec) -> Result<Response, TaskError> {
    let response = http::send(client, request).map_err(|e| request_error(request, e))?;
    let status = response.status();

    if request.expect_status.is_some() && !request.accepts(status) {
        return Err(TaskError::failed(format!(
            "{} returned {}, expected {}",
            request.describe(),
            status.as_u16(),
            request.expect_status.map_or(0, |s| s.as_u16())
        )));
    }

    let line = format!("{} -> {}", request.describe(), status.as_u16());
    if request.accepts(status) {
        ctx.info(line);
    } else {
        ctx.warn(line);
    }
    Ok(response)
}

fn request_error(request: &RequestSpec, err: reqwest::Error) -> TaskError {
    if err.is_timeout() {
        TaskError::Timeout(format!(
            "{} after {}s",
            request.describe(),
            request.timeout_secs
        ))
    } else {
        TaskError::failed(format!("{} failed: {err}", request.describe()))
    }
}

fn run_poll(ctx: &JobContext, client: &Client, poll: &PollSpec) -> Result<(), TaskError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let response = execute(ctx, client, &poll.request)?;
        let body: Value = response.json().map_err(|e| {
            TaskError::failed(format!("{} returned invalid JSON: {e}", poll.request.describe()))
        })?;

        if poll.until.is_met(&body) {
            ctx.info(format!("{} after {attempts} attempt(s)", poll.until));
            return Ok(());
        }
        tracing::debug!(job = %ctx.job(), attempts, condition = %poll.until, "condition not met yet");

        if poll.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(TaskError::Timeout(format!(
                "{} not reached after {attempts} attempts",
                poll.until
            )));
        }
        if ctx.sleep(Duration::from_secs(poll.interval_secs)) {
            ctx.warn("Stop requested while polling");
            return Ok(());
        }
    }
}

fn preflight(check: &RequestSpec) -> Result<(), TaskError> {
    let client = http::session_client(true).context("failed to build HTTP client")?;
    let response = http::send(&client, check).map_err(|e| request_error(check, e))?;
    let status = response.status();
    if !check.accepts(status) {
        return Err(TaskError::failed(format!(
            "{} responded with status code {}",
            check.url,
            status.as_u16()
        )));
    }
    Ok(())
}

fn send_stop_requests(ctx: &JobContext, requests: &[RequestSpec]) {
    let client = match http::session_client(true) {
        Ok(client) => client,
        Err(e) => {
            ctx.warn(format!("Cannot send stop requests: {e}"));
            return;
        }
    };

    for request in requests {
        match http::send(&client, request) {
            Ok(response) if request.accepts(response.status()) => {
                ctx.info(format!("Stop request {} -> {}", request.describe(), response.status().as_u16()));
            }
            Ok(response) => {
                ctx.warn(format!(
                    "Stop request {} failed with status code {}",
                    request.describe(),
                    response.status().as_u16()
                ));
            }
            Err(e) => ctx.warn(format!("Stop request {} failed: {e}", request.describe())),
        }
    }
}
