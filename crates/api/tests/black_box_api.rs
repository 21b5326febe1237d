use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;

use redline_api::app::{build_app, AppState};
use redline_backoff::{
    BackoffConfig, CollectReport, Collector, CollectorConfig, SeenIds, Sighting, StreamSource,
    TrackingStats, UpstreamError,
};
use redline_core::Slug;
use redline_jobs::{JobRegistry, JobRunner, PhasedTask, TaskError};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(state: AppState) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = build_app(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Fails on every odd call.
struct Flaky {
    name: Slug,
    calls: AtomicUsize,
}

impl StreamSource for Flaky {
    fn name(&self) -> &Slug {
        &self.name
    }

    fn collect(&self) -> Result<CollectReport, UpstreamError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            Err(UpstreamError::status(502, "bad gateway"))
        } else {
            Ok(CollectReport::untracked(4))
        }
    }
}

/// Always returns the same two incidents.
struct Incidents {
    name: Slug,
    seen: Mutex<SeenIds>,
}

impl StreamSource for Incidents {
    fn name(&self) -> &Slug {
        &self.name
    }

    fn collect(&self) -> Result<CollectReport, UpstreamError> {
        let mut seen = self.seen.lock().unwrap();
        let mut report = CollectReport {
            items: 2,
            ..CollectReport::default()
        };
        for id in ["inc-1", "inc-2"] {
            match seen.observe(Some(id)) {
                Sighting::New => report.new += 1,
                _ => report.duplicates += 1,
            }
        }
        Ok(report)
    }

    fn tracking(&self) -> Option<TrackingStats> {
        Some(self.seen.lock().unwrap().stats())
    }

    fn clear_tracking(&self) -> usize {
        self.seen.lock().unwrap().clear()
    }
}

fn slug(s: &str) -> Slug {
    Slug::new(s).unwrap()
}

fn state() -> AppState {
    let mut jobs = JobRegistry::new();

    // Waits in its first phase until stopped.
    jobs.register(JobRunner::new(
        slug("exploit"),
        PhasedTask::new()
            .phase("login", "Sign in", |ctx, _| {
                ctx.info("logged in");
                while !ctx.sleep(Duration::from_millis(20)) {}
                Ok(())
            })
            .phase("xss", "Reflected XSS", |_, _| Ok(())),
    ))
    .unwrap();

    jobs.register(JobRunner::new(
        slug("traffic"),
        PhasedTask::new()
            .phase("browse", "Load pages", |ctx, _| {
                ctx.info("GET / -> 200");
                Ok(())
            })
            .phase("broken", "Always fails", |_, _| Err(TaskError::failed("upstream said no"))),
    ))
    .unwrap();

    jobs.register(JobRunner::new(
        slug("scan"),
        PhasedTask::new()
            .phase("spider", "Crawl", |_, _| Ok(()))
            .preflight(|| Err(TaskError::failed("scanner is not responding"))),
    ))
    .unwrap();

    let mut collector = Collector::new(
        CollectorConfig::default()
            .with_backoff(BackoffConfig::default().with_threshold(1).with_pause(Duration::from_secs(600))),
    );
    collector
        .add_stream(Flaky {
            name: slug("audit-events"),
            calls: AtomicUsize::new(0),
        })
        .unwrap();
    collector
        .add_stream(Incidents {
            name: slug("incidents"),
            seen: Mutex::new(SeenIds::default()),
        })
        .unwrap();

    AppState {
        jobs: Arc::new(jobs),
        collector: Arc::new(collector),
    }
}

async fn status_until(
    client: &reqwest::Client,
    srv: &TestServer,
    job: &str,
    pred: impl Fn(&Value) -> bool,
) -> Value {
    for _ in 0..250 {
        let body: Value = client
            .get(srv.url(&format!("/jobs/{job}/status")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if pred(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{job} never reached the expected status");
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn(state()).await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn start_conflict_stop_and_status() {
    let srv = TestServer::spawn(state()).await;
    let client = reqwest::Client::new();

    let res = client.post(srv.url("/jobs/exploit/start")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "exploit started in background");
    assert!(body["run_id"].is_string());

    let running = status_until(&client, &srv, "exploit", |s| s["state"] == "login").await;
    assert_eq!(running["running"], true);
    assert_eq!(running["message"], "exploit is currently login");

    // GET is accepted as well as POST.
    let res = client.get(srv.url("/jobs/exploit/start")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "already_running");
    assert_eq!(body["message"], "exploit is already running");

    let res = client.post(srv.url("/jobs/exploit/stop")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "exploit stop requested");

    let done = status_until(&client, &srv, "exploit", |s| s["running"] == false).await;
    assert_eq!(done["state"], "stopped");
    assert_eq!(done["message"], "No exploit is currently running");
    let log: Vec<&str> = done["log"].as_array().unwrap().iter().map(|l| l.as_str().unwrap()).collect();
    assert!(log.iter().any(|l| l.ends_with("INFO: logged in")));
    assert!(log.iter().any(|l| l.ends_with("WARNING: exploit stopped during xss phase")));
}

#[tokio::test]
async fn stop_when_idle_is_ok() {
    let srv = TestServer::spawn(state()).await;
    let res = reqwest::Client::new()
        .get(srv.url("/jobs/traffic/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = reqwest::get(srv.url("/jobs/traffic/status")).await.unwrap().json().await.unwrap();
    assert_eq!(body["state"], "idle");
    assert_eq!(body["running"], false);
}

#[tokio::test]
async fn failed_run_reports_error_and_clear_empties_log() {
    let srv = TestServer::spawn(state()).await;
    let client = reqwest::Client::new();

    let res = client.post(srv.url("/jobs/traffic/start")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let done = status_until(&client, &srv, "traffic", |s| s["running"] == false).await;
    assert_eq!(done["state"], "error");
    let last = done["log"].as_array().unwrap().last().unwrap().as_str().unwrap();
    assert!(last.ends_with("ERROR: traffic execution failed: upstream said no"));

    let res = client.post(srv.url("/jobs/traffic/clear")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = client
        .get(srv.url("/jobs/traffic/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["log"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn preflight_failure_is_service_unavailable() {
    let srv = TestServer::spawn(state()).await;

    let res = reqwest::Client::new()
        .post(srv.url("/jobs/scan/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "preflight_failed");

    let status: Value = reqwest::get(srv.url("/jobs/scan/status")).await.unwrap().json().await.unwrap();
    assert_eq!(status["state"], "idle");
}

#[tokio::test]
async fn preflight_route_reports_health_without_starting() {
    let srv = TestServer::spawn(state()).await;

    let res = reqwest::get(srv.url("/jobs/scan/preflight")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "preflight_failed");
    assert_eq!(body["message"], "preflight check failed: scanner is not responding");

    let res = reqwest::get(srv.url("/jobs/traffic/preflight")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "alive");
    assert_eq!(body["job"], "traffic");

    let res = reqwest::get(srv.url("/jobs/nope/preflight")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let status: Value = reqwest::get(srv.url("/jobs/traffic/status")).await.unwrap().json().await.unwrap();
    assert_eq!(status["state"], "idle");
    assert!(status["run_id"].is_null());
}

#[tokio::test]
async fn collector_skips_seen_items_until_tracking_is_cleared() {
    let srv = TestServer::spawn(state()).await;
    let client = reqwest::Client::new();

    let summary: Value = client.post(srv.url("/collector/collect")).send().await.unwrap().json().await.unwrap();
    assert_eq!(summary["streams"][1]["stream"], "incidents");
    assert_eq!(summary["streams"][1]["new"], 2);

    let summary: Value = client.post(srv.url("/collector/collect")).send().await.unwrap().json().await.unwrap();
    assert_eq!(summary["streams"][1]["new"], 0);
    assert_eq!(summary["streams"][1]["duplicates"], 2);

    let status: Value = client.get(srv.url("/collector/status")).send().await.unwrap().json().await.unwrap();
    let tracking = status["duplicate_tracking"].as_array().unwrap();
    assert_eq!(tracking.len(), 1);
    assert_eq!(tracking[0]["stream"], "incidents");
    assert_eq!(tracking[0]["tracked_ids"], 2);
    assert_eq!(tracking[0]["duplicates_total"], 2);

    let res = client.post(srv.url("/collector/clear-tracking")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "Duplicate tracking cleared (2 ids forgotten)");

    let summary: Value = client.post(srv.url("/collector/collect")).send().await.unwrap().json().await.unwrap();
    assert_eq!(summary["streams"][1]["new"], 2);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let srv = TestServer::spawn(state()).await;
    for path in ["/jobs/nope/start", "/jobs/nope/status", "/jobs/nope/phases"] {
        let res = reqwest::get(srv.url(path)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND, "{path}");
    }
}

#[tokio::test]
async fn lists_jobs_and_phases() {
    let srv = TestServer::spawn(state()).await;

    let jobs: Value = reqwest::get(srv.url("/jobs")).await.unwrap().json().await.unwrap();
    let names: Vec<&str> = jobs.as_array().unwrap().iter().map(|j| j["job"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["exploit", "scan", "traffic"]);
    assert_eq!(jobs[0]["phases"], 2);
    assert_eq!(jobs[0]["state"], "idle");

    let phases: Value = reqwest::get(srv.url("/jobs/exploit/phases")).await.unwrap().json().await.unwrap();
    assert_eq!(phases["job"], "exploit");
    assert_eq!(phases["phases"][1]["name"], "xss");
    assert_eq!(phases["phases"][1]["description"], "Reflected XSS");
    assert_eq!(phases["phases"][1]["run_once"], false);
}

#[tokio::test]
async fn single_phase_runs_synchronously() {
    let srv = TestServer::spawn(state()).await;
    let client = reqwest::Client::new();

    let res = client.post(srv.url("/jobs/traffic/phases/browse")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "browse phase completed");

    let status: Value = client.get(srv.url("/jobs/traffic/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["state"], "finished");
    assert_eq!(status["running"], false);

    let res = client.post(srv.url("/jobs/traffic/phases/broken")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "phase_failed");

    let res = client.post(srv.url("/jobs/traffic/phases/missing")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_phase");
}

#[tokio::test]
async fn collector_backoff_and_reset() {
    let srv = TestServer::spawn(state()).await;
    let client = reqwest::Client::new();

    let status: Value = client.get(srv.url("/collector/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["interval_secs"], 20);
    assert_eq!(status["streams"][0]["stream"], "audit-events");
    assert_eq!(status["streams"][0]["paused"], false);

    let summary: Value = client.post(srv.url("/collector/collect")).send().await.unwrap().json().await.unwrap();
    assert_eq!(summary["streams"][0]["outcome"], "failed");
    assert_eq!(summary["streams"][0]["consecutive_failures"], 1);

    let summary: Value = client.post(srv.url("/collector/collect")).send().await.unwrap().json().await.unwrap();
    assert_eq!(summary["streams"][0]["outcome"], "skipped");

    let status: Value = client.get(srv.url("/collector/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["streams"][0]["paused"], true);
    assert_eq!(status["streams"][0]["threshold"], 1);

    let res = client
        .post(srv.url("/collector/streams/audit-events/reset"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let summary: Value = client.post(srv.url("/collector/collect")).send().await.unwrap().json().await.unwrap();
    assert_eq!(summary["streams"][0]["outcome"], "collected");
    assert_eq!(summary["streams"][0]["items"], 4);
    assert_eq!(summary["streams"][0]["new"], 4);

    let res = client.post(srv.url("/collector/reset-failures")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.post(srv.url("/collector/streams/nope/reset")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_stream");
}
