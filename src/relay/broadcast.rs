use log::{debug, warn};

use crate::net::framing;

use super::connection::Connection;
use super::registry::ConnectionRegistry;

/// Encodes `payload` as one text frame and queues it on a single
/// connection.
pub fn send_message(conn: &mut Connection, payload: &[u8]) {
    conn.queue(&framing::encode_text_frame(payload));
}

/// Encodes `payload` once and queues the identical bytes on every
/// registered connection, the author included. A connection that fails
/// mid-fanout is marked dead for the next sweep; the remaining
/// connections still receive the frame.
pub fn notify_all(registry: &mut ConnectionRegistry, payload: &[u8]) {
    let frame = framing::encode_text_frame(payload);
    let mut delivered = 0usize;
    registry.for_each_mut(|token, conn| {
        conn.queue(&frame);
        if conn.is_dead() {
            warn!("connection {:?} dropped during broadcast", token);
        } else {
            delivered += 1;
        }
    });
    debug!("broadcast {} bytes to {} connections", frame.len(), delivered);
}
