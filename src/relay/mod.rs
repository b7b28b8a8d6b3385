use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::config::Config;
use crate::net::framing::Opcode;
use crate::net::{handshake, tcp_opt};

pub mod broadcast;
pub mod connection;
pub mod heartbeat;
pub mod registry;

use connection::{Connection, ReadOutcome};
use heartbeat::HeartbeatMonitor;
use registry::ConnectionRegistry;

const LISTENER: Token = Token(0);

/// Upper bound on one poll pass when no heartbeat deadline is pending.
const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// The relay server: one mio poll loop dispatching accepts, reads,
/// writes, and heartbeat deadlines. Connections that have not finished
/// their upgrade yet live in `pending`; only upgraded connections are in
/// the registry and receive broadcasts.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    pending: HashMap<Token, Connection>,
    registry: ConnectionRegistry,
    heartbeat: HeartbeatMonitor,
    next_token: usize,
}

impl Server {
    /// Binds the listener and readies the poll loop. A bind failure is
    /// fatal to the process; everything past this point is isolated to
    /// single connections.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = tcp_opt::create_listener(config.listen_addr())?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        info!("listening on {}", listener.local_addr()?);

        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            listener,
            pending: HashMap::new(),
            registry: ConnectionRegistry::new(),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval),
            next_token: 1,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once()?;
        }
    }

    /// One dispatch round: wait for events (bounded by the earliest ping
    /// deadline), handle them, fire due pings, sweep dead connections.
    pub fn poll_once(&mut self) -> io::Result<()> {
        let timeout = self.poll_timeout();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER {
                self.accept_ready();
            } else if self.pending.contains_key(&token) {
                self.pending_ready(token, readable);
            } else if self.registry.contains(token) {
                self.open_ready(token, readable, writable);
            }
        }

        self.heartbeat.fire_due(&mut self.registry, Instant::now());
        self.sweep();
        Ok(())
    }

    fn poll_timeout(&self) -> Duration {
        match self.heartbeat.next_deadline(&self.registry) {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(IDLE_POLL_TIMEOUT),
            None => IDLE_POLL_TIMEOUT,
        }
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = tcp_opt::apply_stream_options(&stream) {
                        warn!("failed to tune socket for {}: {}", peer, e);
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let mut conn =
                        Connection::new(stream, Instant::now() + self.heartbeat.interval());
                    if let Err(e) = self.poll.registry().register(
                        conn.stream_mut(),
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!("failed to register {}: {}", peer, e);
                        continue;
                    }
                    debug!("accepted {} as {:?}", peer, token);
                    self.pending.insert(token, conn);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Reads the upgrade request; once the head is complete, negotiates
    /// and promotes the connection into the registry. A handshake failure
    /// closes the socket without ever registering it.
    fn pending_ready(&mut self, token: Token, readable: bool) {
        if !readable {
            return;
        }
        let Some(conn) = self.pending.get_mut(&token) else {
            return;
        };

        let outcome = conn.fill_read_buf();
        let head = conn.take_request_head();

        match head {
            Some(head) => {
                let head_text = String::from_utf8_lossy(&head).into_owned();
                match handshake::negotiate(&head_text) {
                    Ok(response) => self.promote(token, response),
                    Err(e) => {
                        warn!("{:?} upgrade rejected: {}", token, e);
                        self.drop_pending(token);
                    }
                }
            }
            None if outcome == ReadOutcome::Closed => {
                debug!("{:?} closed before completing its handshake", token);
                self.drop_pending(token);
            }
            None => {}
        }
    }

    /// Moves an upgraded connection into the registry: writes the 101
    /// response, arms the heartbeat, announces the arrival, and drains any
    /// frames the client pipelined behind its request.
    fn promote(&mut self, token: Token, response: String) {
        let Some(mut conn) = self.pending.remove(&token) else {
            return;
        };
        conn.queue(response.as_bytes());
        if conn.is_dead() {
            debug!("{:?} died while receiving its upgrade response", token);
            let _ = self.poll.registry().deregister(conn.stream_mut());
            return;
        }

        self.heartbeat.arm(&mut conn, Instant::now());
        self.registry.add(token, conn);
        info!("{:?} upgraded; {} connected", token, self.registry.len());

        let note = format!(
            "New participant joined the chat. Connected: {}",
            self.registry.len()
        );
        broadcast::notify_all(&mut self.registry, note.as_bytes());

        self.relay_buffered(token);
    }

    fn open_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let mut closed = false;
        if let Some(conn) = self.registry.get_mut(token) {
            if writable && conn.flush_out().is_err() {
                conn.mark_dead();
            }
            if readable && conn.fill_read_buf() == ReadOutcome::Closed {
                closed = true;
            }
        } else {
            return;
        }

        self.relay_buffered(token);

        if closed && self.registry.contains(token) {
            self.remove_connection(token);
            info!("{:?} disconnected; {} connected", token, self.registry.len());
        }
    }

    /// Decodes every buffered frame on `token` and fans text frames out to
    /// the whole registry, the sender included. Frames with any other tag
    /// are decoded for their length and dropped. A decode failure closes
    /// only the offending connection.
    fn relay_buffered(&mut self, token: Token) {
        let frames = match self.registry.get_mut(token) {
            Some(conn) => match conn.drain_frames() {
                Ok(frames) => frames,
                Err(e) => {
                    warn!("{:?} removed after decode failure: {}", token, e);
                    self.remove_connection(token);
                    return;
                }
            },
            None => return,
        };

        for frame in frames {
            if Opcode::from_byte(frame.opcode) == Some(Opcode::Text) {
                debug!("{:?} relayed {} bytes", token, frame.payload.len());
                broadcast::notify_all(&mut self.registry, &frame.payload);
            }
        }
    }

    /// Removes a connection and with it its heartbeat deadline. Idempotent:
    /// end-of-stream and a write error may both name the same token.
    fn remove_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.registry.remove(token) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
        }
    }

    /// Deferred teardown: connections marked dead during broadcast or
    /// heartbeat writes are dropped here, after dispatch, so no iteration
    /// ever observes a removal mid-flight.
    fn sweep(&mut self) {
        for (token, mut conn) in self.registry.sweep_dead() {
            warn!("{:?} removed after write failure", token);
            let _ = self.poll.registry().deregister(conn.stream_mut());
        }

        let dead_pending: Vec<Token> = self
            .pending
            .iter()
            .filter(|(_, conn)| conn.is_dead())
            .map(|(token, _)| *token)
            .collect();
        for token in dead_pending {
            self.drop_pending(token);
        }
    }

    fn drop_pending(&mut self, token: Token) {
        if let Some(mut conn) = self.pending.remove(&token) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    use crate::net::framing;

    const UPGRADE_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn test_server(heartbeat: Duration) -> Server {
        let config = Config {
            addr: "127.0.0.1".parse().unwrap(),
            port: 0,
            heartbeat_interval: heartbeat,
        };
        Server::bind(&config).unwrap()
    }

    /// Pumps the server loop until `buf` is filled from `client`.
    fn read_exact_pumping(server: &mut Server, client: &mut StdTcpStream, buf: &mut [u8]) {
        client.set_nonblocking(true).unwrap();
        let mut filled = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while filled < buf.len() {
            assert!(
                Instant::now() < deadline,
                "timed out after {filled}/{} bytes",
                buf.len()
            );
            server.poll_once().unwrap();
            match client.read(&mut buf[filled..]) {
                Ok(0) => panic!("peer closed after {filled} bytes"),
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    fn expect_text(server: &mut Server, client: &mut StdTcpStream, text: &str) {
        let expected = framing::encode_text_frame(text.as_bytes());
        let mut buf = vec![0u8; expected.len()];
        read_exact_pumping(server, client, &mut buf);
        assert_eq!(buf, expected);
    }

    /// Connects, upgrades, and consumes the 101 response plus the join
    /// announcement for the expected headcount.
    fn connect_and_upgrade(server: &mut Server, expected_count: usize) -> StdTcpStream {
        let addr = server.local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(UPGRADE_REQUEST).unwrap();

        let expected = handshake::upgrade_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let mut buf = vec![0u8; expected.len()];
        read_exact_pumping(server, &mut client, &mut buf);
        assert_eq!(buf, expected.as_bytes());

        expect_text(
            server,
            &mut client,
            &format!("New participant joined the chat. Connected: {expected_count}"),
        );
        client
    }

    #[test]
    fn relays_text_frames_to_every_participant() {
        let mut server = test_server(Duration::from_secs(30));
        let mut alice = connect_and_upgrade(&mut server, 1);
        let mut bob = connect_and_upgrade(&mut server, 2);
        expect_text(
            &mut server,
            &mut alice,
            "New participant joined the chat. Connected: 2",
        );

        let wire = framing::encode_client_frame(0x81, b"hi from bob", [0x37, 0xfa, 0x21, 0x3d]);
        bob.write_all(&wire).unwrap();

        expect_text(&mut server, &mut alice, "hi from bob");
        expect_text(&mut server, &mut bob, "hi from bob");
    }

    #[test]
    fn non_text_frames_are_ignored() {
        let mut server = test_server(Duration::from_secs(30));
        let mut alice = connect_and_upgrade(&mut server, 1);

        // a masked client ping, then a text frame; only the text is relayed
        let mut wire = framing::encode_client_frame(0x89, &[], [1, 2, 3, 4]);
        wire.extend(framing::encode_client_frame(0x81, b"after ping", [1, 2, 3, 4]));
        alice.write_all(&wire).unwrap();

        expect_text(&mut server, &mut alice, "after ping");
    }

    #[test]
    fn rejected_upgrade_is_closed_and_never_registered() {
        let mut server = test_server(Duration::from_secs(30));
        let addr = server.local_addr().unwrap();
        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        client.set_nonblocking(true).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "socket never closed");
            server.poll_once().unwrap();
            let mut probe = [0u8; 16];
            match client.read(&mut probe) {
                Ok(0) => break,
                Ok(_) => panic!("unexpected bytes from a rejected upgrade"),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }
        assert_eq!(server.registry.len(), 0);
    }

    #[test]
    fn malformed_frame_closes_only_the_offender() {
        let mut server = test_server(Duration::from_secs(30));
        let mut alice = connect_and_upgrade(&mut server, 1);
        let mut bob = connect_and_upgrade(&mut server, 2);
        expect_text(
            &mut server,
            &mut alice,
            "New participant joined the chat. Connected: 2",
        );

        // unmasked client frame: a protocol violation
        bob.write_all(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'])
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.registry.len() > 1 {
            assert!(Instant::now() < deadline, "offender was never removed");
            server.poll_once().unwrap();
        }

        let wire = framing::encode_client_frame(0x81, b"still here", [4, 3, 2, 1]);
        alice.write_all(&wire).unwrap();
        expect_text(&mut server, &mut alice, "still here");
    }

    #[test]
    fn disconnect_removes_peer_and_others_survive() {
        let mut server = test_server(Duration::from_secs(30));
        let mut alice = connect_and_upgrade(&mut server, 1);
        let bob = connect_and_upgrade(&mut server, 2);
        expect_text(
            &mut server,
            &mut alice,
            "New participant joined the chat. Connected: 2",
        );

        drop(bob);
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.registry.len() > 1 {
            assert!(Instant::now() < deadline, "disconnect was never observed");
            server.poll_once().unwrap();
        }

        let wire = framing::encode_client_frame(0x81, b"anyone there?", [7, 7, 7, 7]);
        alice.write_all(&wire).unwrap();
        expect_text(&mut server, &mut alice, "anyone there?");
    }

    #[test]
    fn heartbeat_pings_idle_connections() {
        let mut server = test_server(Duration::from_millis(50));
        let mut client = connect_and_upgrade(&mut server, 1);

        let mut ping = [0u8; 2];
        read_exact_pumping(&mut server, &mut client, &mut ping);
        assert_eq!(ping, [0x89, 0x00]);
    }
}
