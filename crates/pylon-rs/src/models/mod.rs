//! Data models and domain types for the Pylon gateway.
//!
//! # Module Organization
//!
//! - [`context`] - Per-request mutable state threaded through the pipeline
//! - [`error`] - Gateway error taxonomy and HTTP mappings
//! - [`principal`] - Authenticated identities and permissions
//! - [`service`] - Backend service descriptors and instance endpoints
//! - [`settings`] - Root configuration tree

pub mod context;
pub mod error;
pub mod principal;
pub mod service;
pub mod settings;
