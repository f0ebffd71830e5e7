//! Client for the `echo_server` example.

fn main() -> coracle::Result<()> {
    let socket = coracle::socket::new_socket("tcp", None)?;
    let conn = socket.dial("127.0.0.1:9090")?;
    let messages = conn.messages();

    let mut buf = Vec::new();
    for line in ["Hello World", "still here", "bye"] {
        messages.write_message(line.as_bytes())?;
        let n = messages.read_message(&mut buf)?;
        println!("{}", String::from_utf8_lossy(&buf[..n]));
    }
    messages.close()
}
