//! Tollgate - Fixed-window rate limiting over a shared counter store
//!
//! This crate counts trials per caller identity inside fixed windows kept in
//! an external key-value store, so every process sharing the store enforces
//! the same limits. Callers over the limit are either rejected or, when a
//! delay is configured, throttled by waiting before they proceed.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;

pub use error::{Result, TollgateError};
pub use ratelimit::{Decision, Identity, Limiter, LimiterFactory, LimiterOptions};
