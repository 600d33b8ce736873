//! Channel primitives the tunnel core is built on.
//!
//! # Responsibilities
//! - FIFO hand-off queue with cancellable pop
//! - Single-producer/single-consumer channel with capacity semantics
//! - Cancellation signal composition
//!
//! # Design Decisions
//! - Everything cross-task flows through these channels; no shared
//!   mutable state outside them and the registry maps
//! - Cancellation is a normal terminal event, never an error surface

pub mod channel;
pub mod queue;
pub mod signal;

pub use channel::{Channel, SendError};
pub use queue::Queue;
pub use signal::{link, Signal};
