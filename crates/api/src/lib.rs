//! HTTP control surface for playbook-driven jobs and polled streams.

pub mod app;
pub mod config;
pub mod http;
pub mod playbook;
pub mod sources;
