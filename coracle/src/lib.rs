//! Coracle
//!
//! A connection-serving core for high-throughput networking: an
//! epoll/kqueue reactor multiplexes TCP, UNIX, WebSocket and in-process
//! connections onto a small worker pool. Protocol logic is supplied as a
//! `{upgrade, serve}` handler pair; framing, buffer pooling and adaptive
//! write batching come from `coracle-core`, the WebSocket codec from
//! `coracle-ws`.
//!
//! ```no_run
//! use coracle::socket::new_socket;
//!
//! # fn main() -> coracle::Result<()> {
//! let socket = new_socket("tcp", None)?;
//! let listener = socket.listen("127.0.0.1:9000")?;
//! listener.serve_data(None, Box::new(|req: &[u8]| req.to_vec()))?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod handler;
pub mod server;
pub mod socket;
pub mod tls;

pub use coracle_core::error::{Error, Result};
pub use coracle_core::{buffer, inproc, messages, poll, scheduler, stream, writer};
pub use coracle_ws as ws;

pub use handler::{ConnHandler, DataHandler, Handler};
pub use server::{Accept, Server, ServerOptions};
pub use socket::{new_socket, Listener, Socket, SocketConn};
pub use tls::TlsConfig;
