//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Connections observe shutdown through channel closure; nothing is
//!   force-killed here

pub mod shutdown;

pub use shutdown::Shutdown;
