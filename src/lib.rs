//! # Commerce Connectors Library
//!
//! Shopify and Stripe connectors: scheduled backfills through per-connection request
//! queues, signed webhook ingestion, and normalization into idempotent metric records.

pub mod config;
pub mod connectors;
pub mod crypto;
pub mod cursor;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod normalization;
pub mod pagination;
pub mod rate_limit;
pub mod repositories;
pub mod request_queue;
pub mod scheduler;
pub mod server;
pub mod sync_orchestrator;
pub mod sync_tasks;
pub mod telemetry;
pub mod webhook_verification;
pub use migration;
