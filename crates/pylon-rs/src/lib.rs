//! # Pylon API Gateway
//!
//! A reverse-proxy API gateway built with Rust and Actix Web. Pylon sits
//! between external clients and a fleet of backend services and runs every
//! request through a fixed pipeline: security filtering, rate limiting,
//! request transformation, authentication, quota accounting, response
//! caching, circuit breaking, load-balanced routing, upstream proxying, and
//! response transformation, with plugin hooks at published points.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │   Client    │──▶│   Pylon Gateway  │──▶│   Upstream       │
//! │  (Browser,  │   │                  │   │   Services       │
//! │   Mobile,   │   │  ┌───────────────┤   │ (Microservices,  │
//! │   API)      │   │  │ Security      ││   │  APIs, etc.)     │
//! └─────────────┘   │  ├───────────────┤│   └──────────────────┘
//!                   │  │ Rate Limiter  ││
//!                   │  ├───────────────┤│
//!                   │  │ Auth Verifier ││
//!                   │  ├───────────────┤│
//!                   │  │ Response Cache││
//!                   │  ├───────────────┤│
//!                   │  │ Circuit Break ││
//!                   │  ├───────────────┤│
//!                   │  │ Load Balancer ││
//!                   │  └───────────────┘│
//!                   └──────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - **[`config`]** - configuration loading, merging, and validation
//! - **[`logs`]** - logging configuration
//! - **[`middleware`]** - cross-cutting HTTP middleware
//! - **[`models`]** - data models, domain types, and validation logic
//! - **[`pipeline`]** - the stage sequence and its orchestrator
//! - **[`routes`]** - HTTP route definitions and handlers
//! - **[`services`]** - the stateful controllers behind the pipeline
//! - **[`utils`]** - request helpers
//!
//! ## Environment Variables
//!
//! - `PYLON_CONFIG_PATH`: configuration file path (default: `./config.json`)
//! - `PYLON_HOST`: server bind address (default: `0.0.0.0`)
//! - `PYLON_PORT`: server port (default: `8080`)
//! - `PYLON_JWT_SECRET`: JWT signing secret
//! - `PYLON_REDIS_URL`: external cache store URL
//! - `PYLON_ENV`: deployment environment name
//! - `NO_COLOR`: disable colored log output

pub mod config;
pub mod logs;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
pub mod utils;
