//! End-to-end echo flows: framed messages over the in-process transport
//! and WebSocket frames over TCP, both served through the reactor.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use coracle::messages::Messages;
use coracle::socket::{new_socket, Ctx};

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_inproc_message_echo() {
    let socket = new_socket("inproc", None).unwrap();
    let listener = socket.listen("echo-framed").unwrap();
    let closer = listener.acceptor();

    let server = thread::spawn(move || {
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
    });

    let conn = socket.dial("echo-framed").unwrap();
    let messages = conn.messages();
    messages.write_message(b"Hello World").unwrap();
    let mut buf = Vec::new();
    let n = messages.read_message(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"Hello World");

    messages.close().unwrap();
    closer.close().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn test_websocket_echo_over_tcp() {
    let socket = new_socket("ws", None).unwrap();
    let listener = socket.listen("127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap().address().to_string();
    let closer = listener.acceptor();

    let server = thread::spawn(move || {
        listener.serve_data(None, Box::new(|req: &[u8]| req.to_vec()))
    });

    let conn = socket.dial(&addr).unwrap();
    let messages = conn.messages();

    // Deterministic pseudo-random payloads, seeded per size.
    let mut buf = Vec::new();
    for size in [64usize, 512, 65536] {
        let mut seed = 0u64;
        let payload: Vec<u8> = (0..size)
            .map(|_| {
                seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                (seed >> 56) as u8
            })
            .collect();
        messages.write_message(&payload).unwrap();
        let n = messages.read_message(&mut buf).unwrap();
        assert_eq!(&buf[..n], &payload[..], "echo mismatch at size {size}");
    }

    messages.close().unwrap();
    closer.close().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn test_websocket_text_echo() {
    let socket = new_socket("ws", None).unwrap();
    let listener = socket.listen("127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap().address().to_string();
    let closer = listener.acceptor();

    let server = thread::spawn(move || {
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
    });

    let conn = socket.dial(&addr).unwrap();
    let messages = conn.messages();
    messages.write_message("godmorgon".as_bytes()).unwrap();
    let mut buf = Vec::new();
    let n = messages.read_message(&mut buf).unwrap();
    assert_eq!(std::str::from_utf8(&buf[..n]).unwrap(), "godmorgon");

    messages.close().unwrap();
    closer.close().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn test_framer_echo_over_tcp_many_messages() {
    let socket = new_socket("tcp", None).unwrap();
    let listener = socket.listen("127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap().address().to_string();
    let closer = listener.acceptor();

    let server = thread::spawn(move || {
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
    });

    let conn = socket.dial(&addr).unwrap();
    let messages = conn.messages();
    for i in 0..100u32 {
        let payload = i.to_be_bytes();
        messages.write_message(&payload).unwrap();
        let mut buf = Vec::new();
        let n = messages.read_message(&mut buf).unwrap();
        assert_eq!(&buf[..n], &payload);
    }

    messages.close().unwrap();
    closer.close().unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.is_finished()));
    server.join().unwrap().unwrap();
}
