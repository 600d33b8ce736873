//! Observability subsystem.
//!
//! # Design Decisions
//! - Structured logging via tracing; fields over formatted strings
//! - `RUST_LOG` wins; `DEBUG=1` is the quick verbose toggle
//! - No metrics layer: log events are the operational surface

pub mod logging;
