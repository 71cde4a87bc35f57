//! Shared domain types for the Homelab Hub control plane.
//!
//! Everything here is serialization-ready and database-mappable; no I/O.

pub mod action;
pub mod alert;
pub mod compliance;
pub mod config;
pub mod credential;
pub mod error;
pub mod heartbeat;
pub mod server;
pub mod service;
pub mod settings;
pub mod telemetry;

pub use error::{Error, Result};
