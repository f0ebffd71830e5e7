//! Coracle WebSocket
//!
//! RFC 6455 framing and handshake over any coracle stream:
//! - Frame marshal/unmarshal on caller-supplied buffers (`frame`)
//! - Client and server opening handshake (`handshake`)
//! - Message-oriented connection with fragmentation, control-frame
//!   handling and role-based masking (`conn`)
//!
//! The connection implements the core `Messages` trait, so a WebSocket can
//! stand in anywhere the varint framer does, and the core `Stream` trait,
//! so it can itself be layered under other codecs.

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod conn;
pub mod frame;
pub mod handshake;

pub use conn::{Conn, Message, Role};
pub use frame::{Frame, Opcode};
