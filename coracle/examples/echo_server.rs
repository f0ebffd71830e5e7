//! A framed echo server on TCP.
//!
//! Run with `cargo run --example echo_server`, then talk to it with the
//! `echo_client` example.

use std::sync::Arc;

use coracle::messages::Messages;
use coracle::socket::{new_socket, Ctx};

fn main() -> coracle::Result<()> {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    let socket = new_socket("tcp", None)?;
    let listener = socket.listen("127.0.0.1:9090")?;
    println!("echo server on {}", listener.addr().map_or_else(String::new, |a| a.to_string()));

    listener.serve_messages(
        Box::new(|messages| Ok(Box::new(messages) as Ctx)),
        Box::new(|ctx| {
            let messages = ctx
                .downcast_ref::<Arc<dyn Messages>>()
                .expect("messages context");
            let mut buf = Vec::new();
            let n = messages.read_message(&mut buf)?;
            messages.write_message(&buf[..n])
        }),
    )
}
