//! HTTP client for the Bleemeo REST API.
//!
//! Handles JWT acquisition/refresh, a single retry on 401, pagination
//! following `next` links (terminating silently on a mid-listing 404),
//! and the HTTP-Basic-authenticated initial agent registration call.

pub mod auth;
pub mod client;
pub mod pagination;

pub use client::ApiClient;
