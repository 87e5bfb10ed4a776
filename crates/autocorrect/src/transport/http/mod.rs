//! HTTP transport: the autocorrect endpoint and health check.

mod routes;
mod server;

pub use routes::{AutocorrectRequest, AutocorrectResponse, HealthCheckResponse, routes};
pub use server::{ServerConfig, serve};
