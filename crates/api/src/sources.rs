//! Polled HTTP streams feeding the collector.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use reqwest::blocking::Client;
use serde_json::Value;

use redline_backoff::{CollectReport, SeenIds, Sighting, StreamSource, TrackingStats, UpstreamError};
use redline_core::Slug;

use crate::http;
use crate::playbook::StreamSpec;

/// Tracing target for collected payload items.
pub const COLLECTED_TARGET: &str = "redline::collected";

/// Fetches a JSON document and emits each item it contains.
///
/// With an `id_pointer`, only items whose id has not been emitted before are
/// emitted; the rest are counted as duplicates or missing ids.
#[derive(Debug)]
pub struct HttpStreamSource {
    spec: StreamSpec,
    client: OnceLock<Client>,
    seen: Option<Mutex<SeenIds>>,
}

impl HttpStreamSource {
    pub fn new(spec: StreamSpec) -> Self {
        let seen = spec
            .id_pointer
            .as_ref()
            .map(|_| Mutex::new(SeenIds::new(spec.max_tracked_ids)));
        Self {
            spec,
            client: OnceLock::new(),
            seen,
        }
    }

    // Built on first use, on the collector thread.
    fn client(&self) -> Result<&Client, UpstreamError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = http::session_client(true).map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn seen(&self) -> Option<MutexGuard<'_, SeenIds>> {
        self.seen
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn items<'a>(&self, body: &'a Value) -> Result<Vec<&'a Value>, UpstreamError> {
        let target = match &self.spec.items_pointer {
            Some(pointer) => body
                .pointer(pointer)
                .ok_or_else(|| UpstreamError::Decode(format!("no value at {pointer}")))?,
            None => body,
        };
        Ok(match target {
            Value::Array(items) => items.iter().collect(),
            Value::Null => Vec::new(),
            other => vec![other],
        })
    }

    /// Sort items into new, duplicate and id-less, emitting the new ones.
    fn emit(&self, items: &[&Value]) -> CollectReport {
        let mut report = CollectReport {
            items: items.len(),
            ..CollectReport::default()
        };
        let mut seen = self.seen();
        let id_pointer = self.spec.id_pointer.as_deref().unwrap_or_default();

        for item in items {
            let sighting = match seen.as_mut() {
                Some(seen) => seen.observe(item_id(item, id_pointer).as_deref()),
                None => Sighting::New,
            };
            match sighting {
                Sighting::New => {
                    report.new += 1;
                    tracing::info!(target: COLLECTED_TARGET, stream = %self.spec.name, item = %item, "collected");
                }
                Sighting::Duplicate => report.duplicates += 1,
                Sighting::MissingId => {
                    report.missing_ids += 1;
                    tracing::warn!(stream = %self.spec.name, pointer = id_pointer, "item has no id, not emitted");
                }
            }
        }
        report
    }
}

/// Scalar id at `pointer`; `null`, objects and arrays do not count as ids.
fn item_id(item: &Value, pointer: &str) -> Option<String> {
    match item.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl StreamSource for HttpStreamSource {
    fn name(&self) -> &Slug {
        &self.spec.name
    }

    fn collect(&self) -> Result<CollectReport, UpstreamError> {
        let request = &self.spec.request;
        let response = http::send(self.client()?, request)
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if !request.accepts(status) {
            let body = response.text().unwrap_or_default();
            return Err(UpstreamError::status(status.as_u16(), body));
        }

        let body: Value = response
            .json()
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        let items = self.items(&body)?;
        Ok(self.emit(&items))
    }

    fn tracking(&self) -> Option<TrackingStats> {
        self.seen().map(|seen| seen.stats())
    }

    fn clear_tracking(&self) -> usize {
        self.seen().map_or(0, |mut seen| seen.clear())
    }
}
