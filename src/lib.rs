//! Epsilon Bridge Library
//!
//! Reads the live state of an EmptyEpsilon server through its two outputs,
//! the sACN (E1.31) broadcast stream and the HTTP query API, and fuses them
//! into per-entity snapshots.
//!
//! # Features
//!
//! - `metrics_server` - HTTP endpoint for Prometheus metrics and snapshot dumps (enabled by default)

pub mod channel_map;
pub mod config;
pub mod fusion;
pub mod metrics;
pub mod net;
pub mod query;
pub mod util;
