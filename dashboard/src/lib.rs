//! Real-time telemetry for an incubator fleet dashboard.
//!
//! Devices report through the backend; the dashboard keeps a bounded window
//! of recent samples per device, fed by a live per-farm stream and seeded
//! from recorded history, and relays operator commands back to the devices.
//!
//! # Modules
//!
//! - [`connection`]: per-farm websocket stream
//! - [`store`]: bounded per-device sample windows
//! - [`history`]: REST reads of recorded telemetry
//! - [`command`]: device command relay
//! - [`subscription`]: glues stream, history and store together per farm
//! - [`views`]: read-only adapters for detail and fleet screens

pub mod backoff;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod message;
pub mod session;
pub mod store;
pub mod subscription;
pub mod types;
pub mod views;
