//! Playbook jobs and stream sources against a stub upstream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use redline_api::playbook::Playbook;
use redline_api::sources::HttpStreamSource;
use redline_backoff::{CollectorConfig, StreamOutcome, StreamSource, UpstreamError};
use redline_jobs::{JobError, JobRunner, JobRunnerConfig, JobSnapshot, JobState};

#[derive(Default)]
struct Upstream {
    polls: AtomicUsize,
    stops: AtomicUsize,
}

struct StubServer {
    base_url: String,
    upstream: Arc<Upstream>,
    handle: tokio::task::JoinHandle<()>,
}

impl StubServer {
    async fn spawn() -> Self {
        let upstream = Arc::new(Upstream::default());
        let app = Router::new()
            .route("/version", get(|| async { Json(json!({ "version": "2.14.0" })) }))
            .route("/login", post(login))
            .route("/dashboard", get(dashboard))
            .route("/scan/status", get(scan_status))
            .route("/scan/stop", get(scan_stop))
            .route("/events", get(|| async { Json(json!({ "events": [{ "id": 1 }, { "id": 2 }] })) }))
            .route("/down", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable") }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            )
            .layer(Extension(upstream.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            upstream,
            handle,
        }
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn login() -> impl IntoResponse {
    (
        StatusCode::FOUND,
        [
            (header::SET_COOKIE, "session=abc123; Path=/"),
            (header::LOCATION, "/dashboard"),
        ],
    )
}

async fn dashboard(headers: HeaderMap) -> StatusCode {
    let authed = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|c| c.contains("session=abc123"));
    if authed {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn scan_status(Extension(up): Extension<Arc<Upstream>>) -> Json<Value> {
    let n = up.polls.fetch_add(1, Ordering::SeqCst) + 1;
    let progress = if n >= 3 { 100 } else { n * 30 };
    Json(json!({ "status": progress.to_string() }))
}

async fn scan_stop(Extension(up): Extension<Arc<Upstream>>) -> Json<Value> {
    up.stops.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "Result": "OK" }))
}

fn runner(playbook: &Playbook, job: &str) -> Arc<JobRunner> {
    let registry = playbook.registry(&JobRunnerConfig::default()).unwrap();
    registry.get(job).unwrap().clone()
}

async fn start(runner: &Arc<JobRunner>) -> Result<uuid::Uuid, JobError> {
    let r = runner.clone();
    tokio::task::spawn_blocking(move || r.start()).await.unwrap()
}

async fn wait(runner: &JobRunner, pred: impl Fn(&JobSnapshot) -> bool) -> JobSnapshot {
    for _ in 0..500 {
        let status = runner.status();
        if pred(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting; last status: {:?}", runner.status());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn playbook_run_keeps_session_and_polls_to_completion() {
    let srv = StubServer::spawn().await;
    let base = &srv.base_url;
    let playbook = Playbook::from_json(
        &json!({ "jobs": [{
            "name": "scan",
            "follow_redirects": false,
            "preflight": { "url": format!("{base}/version") },
            "phases": [
                { "name": "login", "steps": [
                    { "kind": "request", "method": "POST", "url": format!("{base}/login"),
                      "form": { "username": "demo", "password": "demo" }, "expect_status": 302 }
                ]},
                { "name": "dashboard", "steps": [
                    { "kind": "request", "url": format!("{base}/dashboard"), "expect_status": 200 }
                ]},
                { "name": "spider", "steps": [
                    { "kind": "poll", "request": { "url": format!("{base}/scan/status") },
                      "interval_secs": 1, "max_attempts": 5,
                      "until": { "pointer": "/status", "equals": "100" } }
                ]}
            ]
        }]})
        .to_string(),
    )
    .unwrap();
    let runner = runner(&playbook, "scan");

    start(&runner).await.unwrap();
    let done = wait(&runner, |s| !s.running).await;

    assert_eq!(done.state, JobState::Finished, "log: {:#?}", done.log);
    assert_eq!(srv.upstream.polls.load(Ordering::SeqCst), 3);
    assert!(done.log.iter().any(|l| l.ends_with("/login -> 302")));
    assert!(done.log.iter().any(|l| l.ends_with("/dashboard -> 200")));
    assert!(done.log.iter().any(|l| l.contains("after 3 attempt(s)")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_phase_logs_in_first_when_it_requires_a_session() {
    let srv = StubServer::spawn().await;
    let base = &srv.base_url;
    let playbook = Playbook::from_json(
        &json!({ "jobs": [{
            "name": "exploit",
            "follow_redirects": false,
            "phases": [
                { "name": "login", "steps": [
                    { "kind": "request", "method": "POST", "url": format!("{base}/login"),
                      "form": { "username": "demo", "password": "demo" }, "expect_status": 302 }
                ]},
                { "name": "xss", "requires": ["login"], "steps": [
                    { "kind": "request", "url": format!("{base}/dashboard"), "expect_status": 200 }
                ]},
                { "name": "anonymous", "steps": [
                    { "kind": "request", "url": format!("{base}/dashboard"), "expect_status": 200 }
                ]}
            ]
        }]})
        .to_string(),
    )
    .unwrap();
    let runner = runner(&playbook, "exploit");

    let r = runner.clone();
    tokio::task::spawn_blocking(move || r.run_phase("xss")).await.unwrap().unwrap();
    let status = runner.status();
    assert_eq!(status.state, JobState::Finished, "log: {:#?}", status.log);
    assert!(status.log.iter().any(|l| l.ends_with("Running login before xss")));
    assert!(status.log.iter().any(|l| l.ends_with("/login -> 302")));
    assert!(status.log.iter().any(|l| l.ends_with("/dashboard -> 200")));

    // Without a declared prerequisite the fresh session has no cookie.
    let r = runner.clone();
    let err = tokio::task::spawn_blocking(move || r.run_phase("anonymous")).await.unwrap().unwrap_err();
    assert!(err.to_string().contains("returned 401, expected 200"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unexpected_status_fails_the_run() {
    let srv = StubServer::spawn().await;
    let base = &srv.base_url;
    let playbook = Playbook::from_json(
        &json!({ "jobs": [{
            "name": "traffic",
            "phases": [{ "name": "account", "steps": [
                { "kind": "request", "url": format!("{base}/dashboard"), "expect_status": 200 }
            ]}]
        }]})
        .to_string(),
    )
    .unwrap();
    let runner = runner(&playbook, "traffic");

    start(&runner).await.unwrap();
    let done = wait(&runner, |s| !s.running).await;

    assert_eq!(done.state, JobState::Error);
    assert!(done.log.last().unwrap().contains("returned 401, expected 200"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_preflight_rejects_start() {
    let srv = StubServer::spawn().await;
    let base = &srv.base_url;
    let playbook = Playbook::from_json(
        &json!({ "jobs": [{
            "name": "scan",
            "preflight": { "url": format!("{base}/down") },
            "phases": [{ "name": "spider", "steps": [] }]
        }]})
        .to_string(),
    )
    .unwrap();
    let runner = runner(&playbook, "scan");

    let err = start(&runner).await.unwrap_err();
    assert!(matches!(err, JobError::Preflight(_)));
    assert!(err.to_string().contains("responded with status code 500"));
    assert_eq!(runner.status().state, JobState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_calls_hooks_and_ends_polling() {
    let srv = StubServer::spawn().await;
    let base = &srv.base_url;
    let playbook = Playbook::from_json(
        &json!({ "jobs": [{
            "name": "scan",
            "on_stop": [{ "url": format!("{base}/scan/stop") }],
            "phases": [
                { "name": "active-scan", "steps": [
                    { "kind": "poll", "request": { "url": format!("{base}/scan/status") },
                      "interval_secs": 1,
                      "until": { "pointer": "/status", "equals": "never" } }
                ]},
                { "name": "report", "steps": [] }
            ]
        }]})
        .to_string(),
    )
    .unwrap();
    let runner = runner(&playbook, "scan");

    start(&runner).await.unwrap();
    wait(&runner, |s| s.state == JobState::Phase("active-scan".into())).await;

    let r = runner.clone();
    tokio::task::spawn_blocking(move || r.request_stop()).await.unwrap();
    assert_eq!(srv.upstream.stops.load(Ordering::SeqCst), 1);

    let done = wait(&runner, |s| !s.running).await;
    assert_eq!(done.state, JobState::Stopped);
    assert!(done.log.iter().any(|l| l.contains("Stop request GET")));
    assert!(done.log.iter().any(|l| l.ends_with("scan stopped during report phase")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_timeout_is_reported() {
    let srv = StubServer::spawn().await;
    let base = &srv.base_url;
    let playbook = Playbook::from_json(
        &json!({ "jobs": [{
            "name": "traffic",
            "phases": [{ "name": "browse", "steps": [
                { "kind": "request", "url": format!("{base}/slow"), "timeout_secs": 1 }
            ]}]
        }]})
        .to_string(),
    )
    .unwrap();
    let runner = runner(&playbook, "traffic");

    start(&runner).await.unwrap();
    let done = wait(&runner, |s| !s.running).await;

    assert_eq!(done.state, JobState::Error);
    assert!(done.log.last().unwrap().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_source_counts_items_and_reports_status_errors() {
    let srv = StubServer::spawn().await;
    let base = srv.base_url.clone();
    let playbook = Playbook::from_json(
        &json!({ "streams": [
            { "name": "audit", "request": { "url": format!("{base}/events") }, "items_pointer": "/events" },
            { "name": "broken", "request": { "url": format!("{base}/down") } }
        ]})
        .to_string(),
    )
    .unwrap();

    let (ok, err) = tokio::task::spawn_blocking(move || {
        let audit = HttpStreamSource::new(playbook.streams[0].clone());
        let broken = HttpStreamSource::new(playbook.streams[1].clone());
        (audit.collect(), broken.collect())
    })
    .await
    .unwrap();

    let ok = ok.unwrap();
    assert_eq!(ok.items, 2);
    assert_eq!(ok.new, 2);
    match err.unwrap_err() {
        UpstreamError::Status { code, body } => {
            assert_eq!(code, 500);
            assert_eq!(body, "database unavailable");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tracked_stream_emits_each_item_once() {
    let srv = StubServer::spawn().await;
    let base = srv.base_url.clone();
    let playbook = Playbook::from_json(
        &json!({ "streams": [{
            "name": "audit",
            "request": { "url": format!("{base}/events") },
            "items_pointer": "/events",
            "id_pointer": "/id"
        }]})
        .to_string(),
    )
    .unwrap();
    let collector = playbook.collector(CollectorConfig::default()).unwrap();

    let (first, second, status, forgotten, third) = tokio::task::spawn_blocking(move || {
        let first = collector.collect_once();
        let second = collector.collect_once();
        let status = collector.status();
        let forgotten = collector.clear_tracking();
        let third = collector.collect_once();
        (first, second, status, forgotten, third)
    })
    .await
    .unwrap();

    let collected = |new, duplicates| StreamOutcome::Collected {
        items: 2,
        new,
        duplicates,
        missing_ids: 0,
    };
    assert_eq!(first.streams[0].outcome, collected(2, 0));
    assert_eq!(second.streams[0].outcome, collected(0, 2));
    assert_eq!(status.duplicate_tracking[0].stats.tracked_ids, 2);
    assert_eq!(forgotten, 2);
    assert_eq!(third.streams[0].outcome, collected(2, 0));
}
