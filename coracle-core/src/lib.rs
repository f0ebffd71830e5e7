//! Coracle Core
//!
//! This crate contains the runtime-agnostic building blocks of the coracle
//! networking toolkit:
//! - Size-bucketed, page-quantized buffer pool (`buffer`)
//! - Bounded work scheduler with batched dispatch and idle shrink (`scheduler`)
//! - Readiness poller over epoll/kqueue (`poll`)
//! - Stream abstraction shared by every transport (`stream`)
//! - Varint-length message framer (`messages`)
//! - Adaptive batching writer (`writer`)
//! - In-process loopback transport (`inproc`)
//! - Error types (`error`)

// The poll module needs raw fd access for the kernel pollers.
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod buffer;
pub mod error;
pub mod inproc;
pub mod messages;
pub mod poll;
pub mod scheduler;
pub mod stream;
pub mod writer;

pub use error::{Error, Result};

// A small prelude for downstream crates. Kept minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::buffer::{assign_pool, get_buffer, put_buffer, Buffers, Pool};
    pub use crate::error::{Error, Result};
    pub use crate::messages::{Batch, Messages, StreamMessages};
    pub use crate::poll::{Event, Mode, Poll};
    pub use crate::scheduler::{Scheduler, SchedulerOptions};
    pub use crate::stream::{Addr, Conn, Stream};
    pub use crate::writer::{ConcurrencyFn, Writer};
}
