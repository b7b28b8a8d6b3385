pub mod framing;
pub mod handshake;
pub mod tcp_opt;
