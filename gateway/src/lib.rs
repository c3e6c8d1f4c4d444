//! `augur-gateway` serves metric-producing functions as cached, batchable HTTP endpoints.
//!
//! Metric functions are registered on a [`server::GatewayBuilder`]; each binding adds a route,
//! a response-cache policy and a descriptor in the metric registry. Requests are served one at a
//! time over HTTP or many at a time through the batch endpoint, both via the same pipeline.
//!
//! Core modules:
//! - [`config`]: gateway config (YAML + `AUGUR_*` environment)
//! - [`binder`]: metric functions and endpoint binding
//! - [`cache`]: TTL response cache keyed by request URL
//! - [`registry`]: metric descriptors + metadata export
//! - [`transform`]: table reshaping and JSON encoding
//! - [`batching`]: batch request dispatch
//! - [`server`]: dispatch pipeline and axum wiring

pub mod batching;
pub mod binder;
pub mod cache;
pub mod config;
pub mod error;
pub mod registry;
pub mod routes;
pub mod server;
pub mod table;
pub mod transform;
