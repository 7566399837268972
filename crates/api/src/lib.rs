//! HTTP API: webhook intake, course administration and queue inspection.

pub mod app;
pub mod middleware;
