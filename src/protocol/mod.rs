//! The wire protocol shared by the server routing core and the client
//! execution core.
//!
//! # Responsibilities
//! - Define the tagged message union both endpoints speak
//! - Serialise it under two interchangeable codecs (JSON, binary)
//!
//! # Design Decisions
//! - Message ids are UUIDs minted by whichever side originates a
//!   request; they demultiplex fragments of many concurrent requests on
//!   one transport
//! - The codec is negotiated at upgrade time via the `v` query
//!   parameter and never changes for the life of a connection

pub mod codec;
pub mod message;

pub use codec::{Codec, CodecError, WireFrame, PROTOCOL_VERSION};
pub use message::Message;
