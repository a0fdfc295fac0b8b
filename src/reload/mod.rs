//! Change-triggered reload.
//!
//! # Data Flow
//! ```text
//! notify (background thread)
//!     → ignore.rs (drop VCS, build output, editor swap files)
//!     → debounce task (one event per burst)
//!     → LifecycleEvent::Reload(FileChange)
//!     → WorkerPool::reload (new generation first, then drain the old)
//! ```

pub mod ignore;
pub mod watcher;

pub use ignore::IgnoreRules;
pub use watcher::ChangeWatcher;
