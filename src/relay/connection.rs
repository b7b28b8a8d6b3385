use std::io::{self, Read, Write};
use std::time::Instant;

use mio::net::TcpStream;

use crate::error::ProtocolError;
use crate::net::framing::{self, Frame};
use crate::net::handshake;

/// What a read pass observed on the socket.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes may have been buffered; the stream is still open.
    Open,
    /// The peer finished the stream (end-of-stream or hard error).
    Closed,
}

/// One accepted client socket plus the state the relay keeps for it:
/// a read-assembly buffer, an outbound queue flushed on writable events,
/// the next heartbeat deadline, and a flag for deferred removal.
pub struct Connection {
    stream: TcpStream,
    read_buf: Vec<u8>,
    out_buf: Vec<u8>,
    pub next_ping: Instant,
    dead: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, next_ping: Instant) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            out_buf: Vec::new(),
            next_ping,
            dead: false,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Marks the connection for removal at the next sweep. Safe to call
    /// more than once; removal itself happens exactly once.
    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Drains the socket into the read buffer until `WouldBlock`.
    pub fn fill_read_buf(&mut self) -> ReadOutcome {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Open,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return ReadOutcome::Closed,
            }
        }
    }

    /// Splits off the HTTP request head if the buffer holds the blank-line
    /// terminator yet. Bytes past the head stay buffered; a client may
    /// pipeline its first frames behind the upgrade request.
    pub fn take_request_head(&mut self) -> Option<Vec<u8>> {
        let end = handshake::head_complete(&self.read_buf)?;
        Some(self.read_buf.drain(..end).collect())
    }

    /// Decodes every complete frame currently buffered; a trailing partial
    /// frame stays buffered until more bytes arrive.
    pub fn drain_frames(&mut self) -> Result<Vec<Frame>, ProtocolError> {
        framing::drain_frames(&mut self.read_buf)
    }

    /// Queues bytes and attempts an immediate flush; whatever does not fit
    /// goes out on the next writable event. A hard write failure marks the
    /// connection dead instead of propagating.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.out_buf.extend_from_slice(bytes);
        if self.flush_out().is_err() {
            self.mark_dead();
        }
    }

    /// Pushes queued bytes into the socket until empty or `WouldBlock`.
    pub fn flush_out(&mut self) -> io::Result<()> {
        while !self.out_buf.is_empty() {
            match self.stream.write(&self.out_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.out_buf.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.read_buf.len()
    }
}

/// Builds a server-side [`Connection`] wired to a plain blocking peer
/// socket over loopback.
#[cfg(test)]
pub(crate) fn test_pair() -> (Connection, std::net::TcpStream) {
    use std::time::Duration;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = std::net::TcpStream::connect(addr).unwrap();
    let (server_side, _) = listener.accept().unwrap();
    server_side.set_nonblocking(true).unwrap();
    let conn = Connection::new(
        TcpStream::from_std(server_side),
        Instant::now() + Duration::from_secs(60),
    );
    (conn, peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn fill_until(conn: &mut Connection, want: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while conn.buffered() < want {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {want} buffered bytes"
            );
            conn.fill_read_buf();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn frames_assemble_across_partial_reads() {
        let (mut conn, mut peer) = test_pair();
        let wire = framing::encode_client_frame(0x81, b"assembled", [9, 9, 9, 9]);
        let (first, second) = wire.split_at(5);

        peer.write_all(first).unwrap();
        fill_until(&mut conn, first.len());
        assert!(conn.drain_frames().unwrap().is_empty());

        peer.write_all(second).unwrap();
        fill_until(&mut conn, wire.len());
        let frames = conn.drain_frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"assembled");
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn request_head_split_leaves_pipelined_bytes() {
        let (mut conn, mut peer) = test_pair();
        let frame = framing::encode_client_frame(0x81, b"early", [1, 2, 3, 4]);
        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        peer.write_all(&frame).unwrap();
        fill_until(&mut conn, 27 + frame.len());

        let head = conn.take_request_head().unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        let frames = conn.drain_frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"early");
    }

    #[test]
    fn peer_close_reads_as_closed() {
        let (mut conn, peer) = test_pair();
        drop(peer);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "never observed close");
            if conn.fill_read_buf() == ReadOutcome::Closed {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn queued_bytes_reach_the_peer() {
        let (mut conn, mut peer) = test_pair();
        conn.queue(b"payload bytes");
        assert!(!conn.is_dead());

        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut got = [0u8; 13];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"payload bytes");
    }
}
