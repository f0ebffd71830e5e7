//! Message-oriented WebSocket connection.
//!
//! Wraps a byte stream after the opening handshake. Reads reassemble
//! fragmented messages and service interleaved control frames (ping is
//! answered with an identical pong, close with a close reply and EOF).
//! Writes emit single-frame messages, masked when this side is the
//! client. Reads and writes hold independent locks, mirroring the varint
//! framer, and the writer can be upgraded to the batching writer.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::{Buf, BytesMut};

use coracle_core::error::{Error, Result};
use coracle_core::messages::{Batch, Messages};
use coracle_core::stream::{Addr, Conn as CoreConn, Stream};
use coracle_core::writer::{ConcurrencyFn, Writer};

use crate::frame::{Frame, Opcode};
use crate::handshake;

const READ_BUFFER_SIZE: usize = 65536;
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Which side of the connection this is. Clients mask outgoing frames,
/// servers must not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A received message, text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// The payload bytes regardless of kind.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}

struct ReadState {
    accumulated: BytesMut,
    scratch: Vec<u8>,
    // Reassembly buffer for fragmented messages.
    fragments: Vec<u8>,
    // Reused across frames to keep payload allocations alive.
    frame: Frame,
    // Bytes already reassembled but not yet consumed via Stream::read.
    stream_leftover: BytesMut,
}

enum Sink {
    Direct(CoreConn),
    Batched(Writer),
}

struct WriteState {
    sink: Sink,
    wire: Vec<u8>,
    frame: Frame,
}

/// A WebSocket connection.
pub struct Conn {
    stream: CoreConn,
    role: Role,
    reading: Mutex<ReadState>,
    writing: Mutex<WriteState>,
    closed: AtomicBool,
}

impl Conn {
    /// Wrap an already-upgraded stream.
    #[must_use]
    pub fn new(stream: CoreConn, role: Role) -> Self {
        Self::with_leftover(stream, role, Vec::new())
    }

    /// Dial-side constructor: runs the client handshake on `stream`.
    pub fn connect(stream: CoreConn, host: &str, path: &str) -> Result<Self> {
        let leftover = handshake::client(&stream, host, path)?;
        Ok(Self::with_leftover(stream, Role::Client, leftover))
    }

    /// Accept-side constructor: runs the server handshake on `stream`.
    pub fn accept(stream: CoreConn) -> Result<Self> {
        let leftover = handshake::server(&stream)?;
        Ok(Self::with_leftover(stream, Role::Server, leftover))
    }

    fn with_leftover(stream: CoreConn, role: Role, leftover: Vec<u8>) -> Self {
        let mut accumulated = BytesMut::new();
        accumulated.extend_from_slice(&leftover);
        Self {
            stream: stream.clone(),
            role,
            reading: Mutex::new(ReadState {
                accumulated,
                scratch: vec![0u8; READ_BUFFER_SIZE],
                fragments: Vec::new(),
                frame: Frame::default(),
                stream_leftover: BytesMut::new(),
            }),
            writing: Mutex::new(WriteState {
                sink: Sink::Direct(stream),
                wire: Vec::new(),
                frame: Frame::default(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// This side's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Read one message and report whether it was text.
    pub fn receive_message(&self) -> Result<Message> {
        let mut st = self.reading.lock().expect("ws read lock poisoned");
        let opcode = self.read_message_locked(&mut st)?;
        let payload = std::mem::take(&mut st.fragments);
        if opcode == Opcode::Text {
            let text = String::from_utf8(payload)
                .map_err(|_| Error::protocol("invalid utf-8 in text message"))?;
            Ok(Message::Text(text))
        } else {
            Ok(Message::Binary(payload))
        }
    }

    /// Send a message, text or binary.
    pub fn send_message(&self, message: &Message) -> Result<()> {
        match message {
            Message::Text(s) => self.write_frame(Opcode::Text, s.as_bytes()),
            Message::Binary(b) => self.write_frame(Opcode::Binary, b),
        }
    }

    /// Read one text message.
    pub fn read_text_message(&self) -> Result<String> {
        match self.receive_message()? {
            Message::Text(s) => Ok(s),
            Message::Binary(b) => String::from_utf8(b)
                .map_err(|_| Error::protocol("invalid utf-8 in text message")),
        }
    }

    /// Write one text message.
    pub fn write_text_message(&self, text: &str) -> Result<()> {
        self.write_frame(Opcode::Text, text.as_bytes())
    }

    // Reads frames until a complete data message sits in `st.fragments`,
    // servicing control frames on the way. Returns the message opcode.
    fn read_message_locked(&self, st: &mut ReadState) -> Result<Opcode> {
        st.fragments.clear();
        let mut message_opcode = None;
        loop {
            self.read_frame_locked(st)?;

            if st.frame.opcode.is_control() {
                if !st.frame.fin {
                    return Err(Error::protocol("fragmented control frame"));
                }
                if st.frame.payload.len() > MAX_CONTROL_PAYLOAD {
                    return Err(Error::protocol("control frame payload exceeds 125 bytes"));
                }
                match st.frame.opcode {
                    Opcode::Ping => {
                        let payload = st.frame.payload.clone();
                        self.write_frame(Opcode::Pong, &payload)?;
                    }
                    Opcode::Pong => {}
                    _ => {
                        // Close: echo the status code, if any, and tear
                        // down.
                        let code = if st.frame.payload.len() >= 2 {
                            st.frame.payload[..2].to_vec()
                        } else {
                            Vec::new()
                        };
                        let _ = self.write_frame(Opcode::Close, &code);
                        let _ = self.stream.close();
                        return Err(Error::Eof);
                    }
                }
                continue;
            }

            match (st.frame.opcode, message_opcode) {
                (Opcode::Continuation, None) => {
                    return Err(Error::protocol("continuation frame without a message"));
                }
                (Opcode::Continuation, Some(_)) => {}
                (op, None) => message_opcode = Some(op),
                (_, Some(_)) => {
                    return Err(Error::protocol("data frame inside a fragmented message"));
                }
            }

            let payload = std::mem::take(&mut st.frame.payload);
            if st.fragments.is_empty() {
                st.fragments = payload;
            } else {
                st.fragments.extend_from_slice(&payload);
                st.frame.payload = payload;
                st.frame.payload.clear();
            }

            if st.frame.fin {
                return Ok(message_opcode.unwrap_or(Opcode::Binary));
            }
        }
    }

    // Reads one frame into `st.frame`, enforcing the masking policy.
    fn read_frame_locked(&self, st: &mut ReadState) -> Result<()> {
        loop {
            let parsed = {
                let ReadState {
                    accumulated, frame, ..
                } = st;
                Frame::unmarshal_into(accumulated, frame)?
            };
            if let Some(n) = parsed {
                st.accumulated.advance(n);
                match self.role {
                    Role::Server if st.frame.mask.is_none() => {
                        return Err(Error::protocol("client frame is not masked"));
                    }
                    Role::Client if st.frame.mask.is_some() => {
                        return Err(Error::protocol("server frame is masked"));
                    }
                    _ => {}
                }
                return Ok(());
            }
            let ReadState {
                accumulated,
                scratch,
                ..
            } = st;
            let n = self.stream.read(scratch).map_err(Error::from_read)?;
            if n == 0 {
                return Err(Error::Eof);
            }
            accumulated.extend_from_slice(&scratch[..n]);
        }
    }

    fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut st = self.writing.lock().expect("ws write lock poisoned");
        let WriteState { sink, wire, frame } = &mut *st;
        frame.fin = true;
        frame.rsv1 = false;
        frame.rsv2 = false;
        frame.rsv3 = false;
        frame.opcode = opcode;
        frame.mask = match self.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        };
        frame.payload.clear();
        frame.payload.extend_from_slice(payload);
        wire.clear();
        frame.marshal(wire);
        match sink {
            Sink::Direct(conn) => conn.write_all(wire).map_err(Error::from_read),
            Sink::Batched(w) => w.write(wire).map(|_| ()).map_err(Error::from_read),
        }
    }
}

impl Messages for Conn {
    fn read_message(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut st = self.reading.lock().expect("ws read lock poisoned");
        self.read_message_locked(&mut st)?;
        buf.clear();
        buf.extend_from_slice(&st.fragments);
        Ok(buf.len())
    }

    fn write_message(&self, payload: &[u8]) -> Result<()> {
        self.write_frame(Opcode::Binary, payload)
    }

    fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        // Best-effort close frame; the peer may already be gone.
        if let Err(e) = self.write_frame(Opcode::Close, &[]) {
            tracing::debug!(error = %e, "close frame not delivered");
        }
        {
            let st = self.writing.lock().expect("ws write lock poisoned");
            if let Sink::Batched(w) = &st.sink {
                let _ = w.close();
            }
        }
        self.stream.close().map_err(Error::from_read)
    }
}

impl Batch for Conn {
    fn set_concurrency(&self, concurrency: ConcurrencyFn) {
        let mut st = self.writing.lock().expect("ws write lock poisoned");
        st.sink = Sink::Batched(Writer::new(self.stream.clone(), Some(concurrency), 0, false));
    }
}

// A WebSocket connection is itself a byte stream: reads drain message
// payloads in order, writes emit one binary message per call. This lets a
// WebSocket sit under any layer that expects a plain stream.
impl Stream for Conn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.reading.lock().expect("ws read lock poisoned");
        if st.stream_leftover.is_empty() {
            match self.read_message_locked(&mut st) {
                Ok(_) => {}
                Err(Error::Eof) => return Ok(0),
                Err(Error::Io(e)) => return Err(e),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
            }
            let fragments = std::mem::take(&mut st.fragments);
            st.stream_leftover.extend_from_slice(&fragments);
        }
        let n = buf.len().min(st.stream_leftover.len());
        buf[..n].copy_from_slice(&st.stream_leftover[..n]);
        st.stream_leftover.advance(n);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.write_frame(Opcode::Binary, buf) {
            Ok(()) => Ok(buf.len()),
            Err(Error::Io(e)) => Err(e),
            Err(Error::Eof) => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        }
    }

    fn close(&self) -> io::Result<()> {
        match Messages::close(self) {
            Ok(()) | Err(Error::Eof) => Ok(()),
            Err(Error::Io(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }

    fn local_addr(&self) -> Option<Addr> {
        self.stream.local_addr()
    }

    fn remote_addr(&self) -> Option<Addr> {
        self.stream.remote_addr()
    }

    fn raw_fd(&self) -> Option<coracle_core::poll::RawFd> {
        self.stream.raw_fd()
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coracle_core::inproc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn ws_pair(name: &str) -> (Arc<Conn>, Arc<Conn>) {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let addr = format!("test-ws-{name}-{}", NEXT.fetch_add(1, Ordering::Relaxed));
        let listener = inproc::listen(&addr).unwrap();
        let l = listener.clone();
        let server = thread::spawn(move || {
            let stream = l.accept().unwrap();
            Conn::accept(stream).unwrap()
        });
        let stream = inproc::dial(&addr).unwrap();
        let client = Conn::connect(stream, &addr, "/").unwrap();
        let server = server.join().unwrap();
        (Arc::new(client), Arc::new(server))
    }

    #[test]
    fn test_echo_roundtrip() {
        let (client, server) = ws_pair("echo");
        let echo = thread::spawn(move || {
            let mut buf = Vec::new();
            loop {
                match server.read_message(&mut buf) {
                    Ok(n) => server.write_message(&buf[..n]).unwrap(),
                    Err(Error::Eof) => return,
                    Err(e) => panic!("server error: {e}"),
                }
            }
        });

        let mut buf = Vec::new();
        for size in [64usize, 512, 65536] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            client.write_message(&payload).unwrap();
            let n = client.read_message(&mut buf).unwrap();
            assert_eq!(&buf[..n], &payload[..]);
        }
        Messages::close(&*client).unwrap();
        echo.join().unwrap();
    }

    #[test]
    fn test_text_messages() {
        let (client, server) = ws_pair("text");
        client.write_text_message("hej").unwrap();
        assert_eq!(server.read_text_message().unwrap(), "hej");

        server
            .send_message(&Message::Text("svar".into()))
            .unwrap();
        match client.receive_message().unwrap() {
            Message::Text(s) => assert_eq!(s, "svar"),
            Message::Binary(_) => panic!("expected text"),
        }
    }

    #[test]
    fn test_ping_gets_pong() {
        let (client, server) = ws_pair("ping");
        // Hand-roll a masked ping from the client side.
        let ping = Frame {
            opcode: Opcode::Ping,
            mask: Some(rand::random()),
            payload: b"stayin-alive".to_vec(),
            ..Frame::default()
        };
        let mut wire = Vec::new();
        ping.marshal(&mut wire);
        client.stream.write_all(&wire).unwrap();
        // Nudge the server read loop with a data message.
        client.write_message(b"data").unwrap();

        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            let n = server.read_message(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"data");
        });
        // The pong comes back before any data the server might send.
        let mut st = client.reading.lock().unwrap();
        client.read_frame_locked(&mut st).unwrap();
        assert_eq!(st.frame.opcode, Opcode::Pong);
        assert_eq!(st.frame.payload, b"stayin-alive");
        drop(st);
        reader.join().unwrap();
    }

    #[test]
    fn test_fragmented_message_reassembles() {
        let (client, server) = ws_pair("frag");
        for (fin, opcode, chunk) in [
            (false, Opcode::Text, &b"one "[..]),
            (false, Opcode::Continuation, &b"two "[..]),
            (true, Opcode::Continuation, &b"three"[..]),
        ] {
            let frame = Frame {
                fin,
                opcode,
                mask: Some(rand::random()),
                payload: chunk.to_vec(),
                ..Frame::default()
            };
            let mut wire = Vec::new();
            frame.marshal(&mut wire);
            client.stream.write_all(&wire).unwrap();
        }
        assert_eq!(server.read_text_message().unwrap(), "one two three");
    }

    #[test]
    fn test_unmasked_client_frame_rejected() {
        let (client, server) = ws_pair("mask");
        let frame = Frame {
            opcode: Opcode::Binary,
            mask: None,
            payload: vec![1, 2, 3],
            ..Frame::default()
        };
        let mut wire = Vec::new();
        frame.marshal(&mut wire);
        client.stream.write_all(&wire).unwrap();
        let mut buf = Vec::new();
        let err = server.read_message(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_masked_server_frame_rejected() {
        let (client, server) = ws_pair("server-mask");
        let frame = Frame {
            opcode: Opcode::Binary,
            mask: Some(rand::random()),
            payload: vec![1, 2, 3],
            ..Frame::default()
        };
        let mut wire = Vec::new();
        frame.marshal(&mut wire);
        server.stream.write_all(&wire).unwrap();
        let mut buf = Vec::new();
        let err = client.read_message(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_oversized_control_frame_rejected() {
        let (client, server) = ws_pair("control");
        let frame = Frame {
            opcode: Opcode::Ping,
            mask: Some(rand::random()),
            payload: vec![0u8; 126],
            ..Frame::default()
        };
        let mut wire = Vec::new();
        frame.marshal(&mut wire);
        client.stream.write_all(&wire).unwrap();
        let mut buf = Vec::new();
        let err = server.read_message(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_close_frame_yields_eof_and_reply() {
        let (client, server) = ws_pair("close");
        Messages::close(&*client).unwrap();
        let mut buf = Vec::new();
        let err = server.read_message(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Eof));
        // Idempotent on both sides.
        Messages::close(&*client).unwrap();
        Messages::close(&*server).unwrap();
    }

    #[test]
    fn test_batched_writer_upgrade() {
        let (client, server) = ws_pair("batch");
        let inflight = Arc::new(AtomicUsize::new(0));
        let oracle = inflight.clone();
        client.set_concurrency(Arc::new(move || oracle.load(Ordering::Relaxed)));

        let writers = 4;
        let per_writer = 25;
        let mut handles = Vec::new();
        for i in 0..writers {
            let client = client.clone();
            let inflight = inflight.clone();
            handles.push(thread::spawn(move || {
                inflight.fetch_add(1, Ordering::Relaxed);
                let payload = vec![i as u8; 256];
                for _ in 0..per_writer {
                    client.write_message(&payload).unwrap();
                }
                inflight.fetch_sub(1, Ordering::Relaxed);
            }));
        }

        let mut buf = Vec::new();
        for _ in 0..writers * per_writer {
            let n = server.read_message(&mut buf).unwrap();
            assert_eq!(n, 256);
            assert!(buf[..n].iter().all(|&b| b == buf[0]));
        }
        for h in handles {
            h.join().unwrap();
        }
        Messages::close(&*client).unwrap();
    }

    #[test]
    fn test_stream_layering() {
        let (client, server) = ws_pair("layer");
        let t = thread::spawn(move || {
            let mut buf = [0u8; 4];
            let mut n = 0;
            while n < 4 {
                let r = Stream::read(&*server, &mut buf[n..]).unwrap();
                if r == 0 {
                    break;
                }
                n += r;
            }
            assert_eq!(&buf, b"abcd");
        });
        Stream::write(&*client, b"ab").unwrap();
        Stream::write(&*client, b"cd").unwrap();
        t.join().unwrap();
    }
}
