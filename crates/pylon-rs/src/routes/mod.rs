//! HTTP route handlers and endpoint configuration.
//!
//! - [`health`] - unauthenticated health endpoint
//! - [`metrics`] - admin-only monitoring snapshot
//! - [`auth_http`] - login, logout, refresh, profile, API key management
//! - [`admin`] - service, route, cache, and plugin administration
//! - [`http`] - the `/api` catch-all that feeds the pipeline

pub mod admin;
pub mod auth_http;
pub mod health;
pub mod http;
pub mod metrics;
