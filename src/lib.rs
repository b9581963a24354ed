//! Weather Cache Library
//!
//! A request-coalescing, time-expiring cache in front of a weather API, plus
//! the HTTP front end and configuration used by the `weather-cache` binary.

pub mod cache;
pub mod cli;
pub mod data;
pub mod server;
