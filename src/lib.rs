//! # storyq
//!
//! Postgres-backed task dispatch for storyboard generation.
//!
//! A producer records storyboard and shot generation tasks and enqueues them
//! on pgmq. A pool of dispatchers claims each task, calls the external
//! generation worker over HTTP, and reconciles the answer into shots and task
//! status. Observability goes through OpenTelemetry.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod producer;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod telemetry;
pub mod worker;
