//! Metric helpers for `inlet`.
//!
//! This module defines metric names and helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. All functions become no-ops
//! if the optional `metrics` Cargo feature is disabled.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking active connections.
pub const CONNECTIONS_ACTIVE: &str = "inlet_connections_active";
/// Name of the counter tracking frames delivered to the ingress queue.
pub const FRAMES_INGRESSED: &str = "inlet_frames_ingressed_total";
/// Name of the counter tracking decode and framing failures.
pub const INGRESS_ERRORS: &str = "inlet_ingress_errors_total";
/// Name of the counter tracking reader task panics.
pub const CONNECTION_PANICS: &str = "inlet_connection_panics_total";

/// Increment the active connections gauge.
#[cfg(feature = "metrics")]
pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

#[cfg(not(feature = "metrics"))]
pub fn inc_connections() {}

/// Decrement the active connections gauge.
#[cfg(feature = "metrics")]
pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

#[cfg(not(feature = "metrics"))]
pub fn dec_connections() {}

/// Record a frame delivered to the ingress queue.
#[cfg(feature = "metrics")]
pub fn inc_frames_ingressed() { counter!(FRAMES_INGRESSED).increment(1); }

#[cfg(not(feature = "metrics"))]
pub fn inc_frames_ingressed() {}

/// Record a decode or framing failure.
#[cfg(feature = "metrics")]
pub fn inc_ingress_errors() { counter!(INGRESS_ERRORS).increment(1); }

#[cfg(not(feature = "metrics"))]
pub fn inc_ingress_errors() {}

/// Record a panicking reader task.
#[cfg(feature = "metrics")]
pub fn inc_connection_panics() { counter!(CONNECTION_PANICS).increment(1); }

#[cfg(not(feature = "metrics"))]
pub fn inc_connection_panics() {}
