//! Connwatch - connection catalog, credential vault and connectivity prober
//!
//! This library keeps per-application connection definitions and checks
//! that they actually work:
//! - Classifies connection types into categories and required fields
//! - Encrypts credentials at rest with AES-256-GCM and rotating keys
//! - Builds driver connection strings, with a redacted form for display
//! - Probes relational, NoSQL, HTTP API, cloud and SaaS endpoints
//! - Runs cron schedules that test every active connection of an application
//! - Publishes probe and run events to signed webhooks

pub mod api;
pub mod builder;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod events;
pub mod model;
pub mod notifications;
pub mod probe;
pub mod scheduler;
pub mod secrets;
pub mod store;
pub mod tester;
