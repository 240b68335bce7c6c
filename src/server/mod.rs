//! HTTP server in front of the preview cache.
//!
//! - [`preview_api`]: Request/response types and route handlers

pub mod preview_api;
