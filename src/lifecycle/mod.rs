//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Ctrl+C / proxy.close() → listeners stop accepting
//!         → sessions close (pools and DNS cancel waiters)
//!         → tracked tunnels are force-closed
//! ```
//!
//! # Design Decisions
//! - A single broadcast channel fans the signal out to every accept loop
//! - Closing is idempotent; the second trigger is a no-op

pub mod shutdown;

pub use shutdown::Shutdown;
