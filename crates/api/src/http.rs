//! Blocking HTTP plumbing shared by playbook jobs and stream sources.
//!
//! Blocking clients own a private runtime; build and use them only on worker
//! threads or inside `spawn_blocking`.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::redirect::Policy;

use crate::playbook::{Body, RequestSpec};

const MAX_REDIRECTS: usize = 10;

/// A client with a cookie jar, so a login in one phase carries over to the next.
pub fn session_client(follow_redirects: bool) -> reqwest::Result<Client> {
    let policy = if follow_redirects {
        Policy::limited(MAX_REDIRECTS)
    } else {
        Policy::none()
    };
    Client::builder().cookie_store(true).redirect(policy).build()
}

pub fn send(client: &Client, request: &RequestSpec) -> reqwest::Result<Response> {
    let mut builder = client
        .request(request.method.clone(), request.url.clone())
        .timeout(Duration::from_secs(request.timeout_secs));

    for (name, value) in &request.headers {
        builder = builder.header(name.clone(), value.clone());
    }

    builder = match &request.body {
        Some(Body::Form(fields)) => builder.form(fields),
        Some(Body::Json(value)) => builder.json(value),
        None => builder,
    };

    builder.send()
}
