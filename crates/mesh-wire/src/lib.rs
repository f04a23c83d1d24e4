//! Packet envelopes and framed transport for the mesh protocol
//!
//! Every message on the wire is a JSON object carried in a length-prefixed
//! frame. This crate provides:
//!
//! - [`Packet`] and its factory constructors, covering every control and
//!   message envelope the registry and the peer buses exchange
//! - the framing codec ([`read_packet`] / [`write_packet`])
//! - [`Connection`], a cloneable handle over a TCP stream that serializes
//!   writers and tracks liveness
//!
//! The crate is runtime-agnostic: it uses `async-net` sockets and standard
//! `futures` I/O traits, so it runs under smol, tokio, or async-std alike.

#![warn(missing_docs)]

pub mod connection;
pub mod error;
pub mod framing;
pub mod packet;

pub use connection::Connection;
pub use error::{Error, Result};
pub use framing::{MAX_FRAME_LEN, read_packet, write_packet};
pub use packet::*;
