//! Socket-layer behaviour across schemes: CONNECT upgrade, UNIX
//! transport, framed messages through `SocketConn`, and serve_conn.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use coracle::socket::{address, new_socket, url, Ctx};
use coracle::stream::Conn;
use coracle::Error;

#[test]
fn test_http_connect_upgrade() {
    let socket = new_socket("http", None).unwrap();
    let listener = socket.listen("127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap().address().to_string();

    let server = thread::spawn(move || {
        let conn = listener.accept().unwrap();
        let messages = conn.messages();
        let mut buf = Vec::new();
        let n = messages.read_message(&mut buf).unwrap();
        messages.write_message(&buf[..n]).unwrap();
        listener.close().unwrap();
    });

    let conn = socket.dial(&addr).unwrap();
    let messages = conn.messages();
    messages.write_message(b"through the tunnel").unwrap();
    let mut buf = Vec::new();
    let n = messages.read_message(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"through the tunnel");
    server.join().unwrap();
}

#[test]
fn test_http_rejects_non_connect() {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    let socket = new_socket("http", None).unwrap();
    let listener = socket.listen("127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap().address().to_string();

    let server = thread::spawn(move || listener.accept().map(|_| ()));

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.contains("405"), "response was: {response}");
    assert!(server.join().unwrap().is_err());
}

#[cfg(unix)]
#[test]
fn test_unix_socket_roundtrip() {
    let dir = std::env::temp_dir().join(format!("coracle-unix-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("echo.sock");
    let path_str = path.to_str().unwrap().to_string();

    let socket = new_socket("unix", None).unwrap();
    let listener = socket.listen(&path_str).unwrap();

    let server = thread::spawn(move || {
        let conn = listener.accept().unwrap();
        let messages = conn.messages();
        let mut buf = Vec::new();
        let n = messages.read_message(&mut buf).unwrap();
        messages.write_message(&buf[..n]).unwrap();
        listener.close().unwrap();
    });

    let conn = socket.dial(&path_str).unwrap();
    let messages = conn.messages();
    messages.write_message(b"over the socket file").unwrap();
    let mut buf = Vec::new();
    let n = messages.read_message(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"over the socket file");
    server.join().unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_serve_conn_over_tcp() {
    let socket = new_socket("tcp", None).unwrap();
    let listener = socket.listen("127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap().address().to_string();
    let closer = listener.acceptor();

    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let server = thread::spawn(move || {
        listener.serve_conn(
            Box::new(|conn: Conn| Ok(Box::new(conn) as Ctx)),
            Box::new(move |ctx| {
                let conn = ctx.downcast_ref::<Conn>().expect("conn context");
                let mut buf = [0u8; 64];
                match conn.read(&mut buf) {
                    Ok(0) => Err(Error::Eof),
                    Ok(n) => {
                        counter.fetch_add(1, Ordering::Relaxed);
                        conn.write_all(&buf[..n]).map_err(Error::from_read)
                    }
                    Err(e) => Err(Error::from_read(e)),
                }
            }),
        )
    });

    let conn = socket.dial(&addr).unwrap().connection();
    conn.write_all(b"raw bytes").unwrap();
    let mut buf = [0u8; 64];
    let mut got = 0;
    while got < 9 {
        let n = conn.read(&mut buf[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(&buf[..got], b"raw bytes");
    assert!(served.load(Ordering::Relaxed) >= 1);

    conn.close().unwrap();
    closer.close().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn test_ws_url_helpers() {
    let socket = new_socket("wss", None).unwrap();
    // Without TLS material the socket keeps the plain scheme.
    assert_eq!(socket.scheme(), "ws");
    assert_eq!(url(&*socket, "example.org:443"), "ws://example.org:443");
    assert_eq!(
        address(&*socket, "ws://example.org:443").unwrap(),
        "example.org:443"
    );
}
