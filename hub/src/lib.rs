//! Hub library: system manager/scheduler, dual transport, auth, persistence,
//! record pipeline, rollup, and alerting. `main.rs` wires these into a binary;
//! `tests/scenarios.rs` exercises them directly against fakes.

pub mod alerts;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod expiry_map;
pub mod http;
pub mod identity;
pub mod ids;
pub mod manager;
pub mod pipeline;
pub mod rollup;
pub mod transport;
pub mod worker;
