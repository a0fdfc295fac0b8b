//! Multi-process HTTP/HTTPS serving frontend.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod reload;
pub mod supervisor;

pub use config::schema::ServingConfig;
pub use error::ServeError;
pub use http::WorkerServer;
pub use lifecycle::{launch, Shutdown};
