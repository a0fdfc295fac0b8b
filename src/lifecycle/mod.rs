//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Parse config → Bind or adopt listeners → Daemonize → Runtime → Role
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → LifecycleEvent::Shutdown (drain workers, exit 0)
//!     SIGHUP         → LifecycleEvent::Reload (new generation, drain old)
//!
//! Shutdown (shutdown.rs):
//!     Pool stopped → signal helper tasks (watcher debounce loop), await them
//! ```
//!
//! # Design Decisions
//! - Listeners are bound before daemonizing so bind errors reach the terminal
//! - Workers never daemonize; they inherit the supervisor's session

pub mod daemon;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use daemon::{daemonize, PidFile};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::{spawn_signal_listener, LifecycleEvent, ReloadCause};
pub use startup::{launch, serve, LifecycleChannel};
