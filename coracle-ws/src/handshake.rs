//! WebSocket opening handshake.
//!
//! The client sends an HTTP/1.1 upgrade request with a random 16-byte
//! base64 key; the server answers `101 Switching Protocols` carrying
//! `Sec-WebSocket-Accept = base64(sha1(key || GUID))`. Header names and
//! the relevant values are matched case-insensitively.

use std::io;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use coracle_core::error::{Error, Result};
use coracle_core::stream::Conn;

/// The protocol GUID fixed by RFC 6455.
pub const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The upgrade request path used by coracle sockets.
pub const PATH: &str = "/";

const MAX_ALLOW_HEADERS: usize = 32;
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Generate a new `Sec-WebSocket-Key`.
#[must_use]
pub fn new_sec_key() -> String {
    let input: [u8; 16] = rand::random();
    STANDARD.encode(input)
}

/// Derive `Sec-WebSocket-Accept` from `Sec-WebSocket-Key`.
#[must_use]
pub fn derive_accept_key(sec_key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(sec_key);
    sha1.update(GUID);
    STANDARD.encode(sha1.finalize())
}

/// Drive the client side of the handshake. Returns any bytes the peer sent
/// past the end of the HTTP response; they belong to the frame layer.
pub fn client(conn: &Conn, host: &str, path: &str) -> Result<Vec<u8>> {
    let key = new_sec_key();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    conn.write_all(request.as_bytes())
        .map_err(Error::from_read)?;

    let mut head = Vec::with_capacity(1024);
    loop {
        read_some(conn, &mut head)?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_ALLOW_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&head) {
            Ok(httparse::Status::Complete(n)) => {
                if response.code != Some(101) {
                    return Err(Error::handshake(format!(
                        "unexpected status {:?}",
                        response.code
                    )));
                }
                let accept = find_header(response.headers, "sec-websocket-accept")
                    .ok_or_else(|| Error::handshake("missing Sec-WebSocket-Accept"))?;
                let expected = derive_accept_key(key.as_bytes());
                if !accept.eq_ignore_ascii_case(expected.as_bytes()) {
                    return Err(Error::handshake("Sec-WebSocket-Accept mismatch"));
                }
                return Ok(head.split_off(n));
            }
            Ok(httparse::Status::Partial) => {
                if head.len() > MAX_HEAD_BYTES {
                    return Err(Error::handshake("response header too large"));
                }
            }
            Err(e) => return Err(Error::handshake(format!("bad response: {e}"))),
        }
    }
}

/// Drive the server side of the handshake. Returns any bytes the peer sent
/// past the end of the HTTP request.
pub fn server(conn: &Conn) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    let (key, leftover) = loop {
        read_some(conn, &mut head)?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_ALLOW_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&head) {
            Ok(httparse::Status::Complete(n)) => {
                if request.method != Some("GET") {
                    return Err(Error::handshake("upgrade request must be GET"));
                }
                let upgrade = find_header(request.headers, "upgrade")
                    .ok_or_else(|| Error::handshake("missing Upgrade header"))?;
                if !upgrade.eq_ignore_ascii_case(b"websocket") {
                    return Err(Error::handshake("Upgrade header is not websocket"));
                }
                let key = find_header(request.headers, "sec-websocket-key")
                    .ok_or_else(|| Error::handshake("missing Sec-WebSocket-Key"))?
                    .to_vec();
                break (key, head.split_off(n));
            }
            Ok(httparse::Status::Partial) => {
                if head.len() > MAX_HEAD_BYTES {
                    return Err(Error::handshake("request header too large"));
                }
            }
            Err(e) => return Err(Error::handshake(format!("bad request: {e}"))),
        }
    };

    let accept = derive_accept_key(&key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    conn.write_all(response.as_bytes())
        .map_err(Error::from_read)?;
    Ok(leftover)
}

fn find_header<'h>(headers: &[httparse::Header<'h>], name: &str) -> Option<&'h [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

// One read into `head`. The handshake runs before a connection is handed
// to the poller, so a non-blocking stream that is momentarily dry is
// retried after a short pause rather than surfaced.
fn read_some(conn: &Conn, head: &mut Vec<u8>) -> Result<()> {
    let mut chunk = [0u8; 1024];
    loop {
        match conn.read(&mut chunk) {
            Ok(0) => return Err(Error::Eof),
            Ok(n) => {
                head.extend_from_slice(&chunk[..n]);
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::from_read(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coracle_core::inproc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(
            derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_sec_key_is_16_bytes_base64() {
        for _ in 0..64 {
            let key = new_sec_key();
            assert_eq!(key.len(), 24);
            assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        }
    }

    fn pair(name: &str) -> (Conn, Conn) {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let addr = format!("test-hs-{name}-{}", NEXT.fetch_add(1, Ordering::Relaxed));
        let listener = inproc::listen(&addr).unwrap();
        let l = listener.clone();
        let t = std::thread::spawn(move || l.accept().unwrap());
        let client = inproc::dial(&addr).unwrap();
        let server = t.join().unwrap();
        (client, server)
    }

    #[test]
    fn test_client_server_handshake() {
        let (client_conn, server_conn) = pair("ok");
        let server = std::thread::spawn(move || server(&server_conn));
        let leftover = client(&client_conn, "example.com", "/").unwrap();
        assert!(leftover.is_empty());
        assert!(server.join().unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_bad_accept_key_fails() {
        let (client_conn, server_conn) = pair("bad");
        let fake = std::thread::spawn(move || {
            let mut head = Vec::new();
            // Consume the request head.
            loop {
                read_some(&server_conn, &mut head).unwrap();
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            server_conn
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\n\
                      Upgrade: websocket\r\n\
                      Connection: Upgrade\r\n\
                      Sec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\n\r\n",
                )
                .unwrap();
        });
        let err = client(&client_conn, "example.com", "/").unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        fake.join().unwrap();
    }

    #[test]
    fn test_non_get_rejected() {
        let (client_conn, server_conn) = pair("method");
        let t = std::thread::spawn(move || server(&server_conn));
        client_conn
            .write_all(b"POST / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let err = t.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }
}
