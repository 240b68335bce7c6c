//! preview-cache: adaptive cache for theme preview samples.
//!
//! Sits in front of an expensive preview builder and keeps recent results
//! in a bounded in-memory store:
//!   request → fresh entry? → write-through backend? → builder (with retries)
//!
//! Eviction protects entries that are hit often, recently used and costly
//! to rebuild. The TTL follows the observed hit ratio and a background task
//! keeps the hottest keys warm.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod server;
