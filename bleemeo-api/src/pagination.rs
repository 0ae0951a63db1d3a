//! The `{count, next, previous, results}` envelope every listing endpoint
//! wraps its results in.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Page<T> {
    #[allow(dead_code)]
    pub count: Option<u64>,
    pub next: Option<String>,
    #[allow(dead_code)]
    pub previous: Option<String>,
    pub results: Vec<T>,
}
