//! Cache module for weather lookups
//!
//! This module provides an in-memory store that expires entries after a fixed
//! TTL, and a resolver that sits in front of a slow upstream: it serves fresh
//! entries from memory and collapses concurrent misses for the same key into a
//! single upstream fetch whose result every waiting caller receives.

mod resolver;
mod store;

pub use resolver::{Fetcher, ResolveError, Resolver};
pub use store::{ExpiringStore, DEFAULT_CACHE_TTL, DEFAULT_SWEEP_INTERVAL};
