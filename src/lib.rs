//! Transparent HTTPS interception with a correlated audit log.
//!
//! A root certificate authority mints per-host leaf certificates so that
//! tunneled TLS can be terminated on both sides, every decoded exchange is
//! recorded in an append-only journal, and a read-only query surface serves
//! the redacted records.

pub mod audit;
pub mod config;
pub mod error;
pub mod intercept;
pub mod query;
pub mod state;
pub mod tls;
pub mod web;
