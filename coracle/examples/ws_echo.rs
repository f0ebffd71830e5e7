//! WebSocket echo: serves `ws://127.0.0.1:9091` and echoes every message,
//! then dials itself once when run with the `client` argument.

use coracle::socket::new_socket;

fn main() -> coracle::Result<()> {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    let socket = new_socket("ws", None)?;
    if std::env::args().nth(1).as_deref() == Some("client") {
        let conn = socket.dial("127.0.0.1:9091")?;
        let messages = conn.messages();
        messages.write_message(b"over the websocket")?;
        let mut buf = Vec::new();
        let n = messages.read_message(&mut buf)?;
        println!("{}", String::from_utf8_lossy(&buf[..n]));
        return messages.close();
    }

    let listener = socket.listen("127.0.0.1:9091")?;
    listener.serve_data(None, Box::new(|req: &[u8]| req.to_vec()))
}
