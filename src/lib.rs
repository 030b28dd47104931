//! Swift BLE telemetry library
//! Keeps a live collection of a BLE peripheral's characteristics and
//! measures read, write and notify throughput for each of them.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod state;
pub mod utils;
