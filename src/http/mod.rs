//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (shared listener descriptor)
//!     → server.rs (axum-server accept loop, middleware stack)
//!     → cache layer (optional)
//!     → hosted application (upstream.rs by default)
//!     → Send to client
//! ```

pub mod server;
pub mod upstream;

pub use server::{AppFactory, RunningServer, ServerControl, WorkerServer, X_REQUEST_ID, X_SERVED_BY};
pub use upstream::{UpstreamSettings, UpstreamTarget};
