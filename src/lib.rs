//! Self-hosted HTTP tunnel library.
//!
//! A public-facing server accepts ordinary HTTP requests on behalf of
//! many private clients. Each client dials in over one WebSocket,
//! claims a domain, and replays the requests routed to it against a
//! local address, streaming the responses back.
//!
//! # Architecture Overview
//!
//! ```text
//!                          ┌──────────────────────────────────────────┐
//!                          │               TUNNEL SERVER              │
//!   Public Request         │  ┌─────────┐   ┌──────────┐   ┌───────┐  │
//!   ───────────────────────┼─▶│ server  │──▶│ registry │──▶│ conn  │  │
//!                          │  │ handler │   │ host→id  │   │ state │  │
//!                          │  └─────────┘   └──────────┘   └───┬───┘  │
//!                          └────────────────────────────────────┼─────┘
//!                                 one WebSocket, many requests  │
//!                              request-start/data/end  ▲        ▼ response-*
//!                          ┌────────────────────────────────────┼─────┐
//!   Local App              │  ┌─────────┐   ┌──────────┐   ┌───┴───┐  │
//!   ◀──────────────────────┼──│ reqwest │◀──│ dispatch │◀──│ duplex│  │
//!                          │  └─────────┘   └──────────┘   └───────┘  │
//!                          │               TUNNEL CLIENT              │
//!                          └──────────────────────────────────────────┘
//! ```
//!
//! The `sync` channels, the `protocol` message union, and the
//! `transport` binding are shared by both endpoints; `server` and
//! `client` are the two state machines on top.

// Core subsystems
pub mod client;
pub mod protocol;
pub mod server;
pub mod sync;
pub mod transport;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use client::{connect, ClientError, ConnectOptions, Tunnel};
pub use config::{ClientConfig, ServerConfig};
pub use lifecycle::Shutdown;
pub use server::{handler, serve, HandlerOptions, ServeError};
