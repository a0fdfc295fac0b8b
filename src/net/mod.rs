//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ServingConfig
//!     → tls.rs (load key/cert before anything is bound)
//!     → listener.rs (bind http/https/cache, or adopt inherited descriptors)
//!     → descriptors exported to workers (inherited or duplicated)
//!     → each worker's HTTP server accepts from the shared sockets
//! ```
//!
//! # Design Decisions
//! - Sockets are bound once, by the supervising process, and never rebound
//! - Workers hold duplicated descriptors; the kernel spreads accepts
//! - Any bind failure aborts startup (fail-closed, no retry)

pub mod listener;
pub mod tls;

pub use listener::{BindingInfo, ListenerBinding, ListenerSet, Protocol};
