//! # API Adapters
//!
//! HTTP surface of the offer engine: error mapping, Prometheus metrics,
//! the pixel template renderer and (behind `web-axum`) the axum router.

pub mod error;
pub mod metrics;
pub mod template;

#[cfg(feature = "web-axum")]
pub mod routes;

pub use error::ApiError;
pub use metrics::Metrics;
pub use template::PixelTemplateRenderer;

#[cfg(feature = "web-axum")]
pub use routes::{router, AppState};
