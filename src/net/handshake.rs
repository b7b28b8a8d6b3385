use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::digest;

use crate::error::ProtocolError;

/// Fixed GUID appended to the client key before hashing (RFC 6455).
const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const KEY_HEADER: &str = "sec-websocket-key";

/// Computes the `Sec-WebSocket-Accept` value for a client key:
/// `base64(SHA1(client_key + GUID))`. The key must itself be valid
/// base64; anything else aborts the upgrade.
pub fn accept_key(client_key: &str) -> Result<String, ProtocolError> {
    if client_key.is_empty() || BASE64.decode(client_key).is_err() {
        return Err(ProtocolError::MalformedHandshake(
            "client key is not valid base64",
        ));
    }

    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(client_key.as_bytes());
    ctx.update(HANDSHAKE_GUID.as_bytes());
    Ok(BASE64.encode(ctx.finish().as_ref()))
}

/// Formats the 101 Switching Protocols response, terminated by a blank
/// line. The header casing is part of the relay's wire contract.
pub fn upgrade_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101\r\nupgrade: websocket\r\nconnection: upgrade\r\nsec-webSocket-accept: {accept_key}\r\n\r\n"
    )
}

/// Returns the length of the request head including the terminating blank
/// line, once the buffer holds one.
pub fn head_complete(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Pulls the `Sec-WebSocket-Key` value out of a request head. Header
/// names are matched case-insensitively.
pub fn client_key(head: &str) -> Result<&str, ProtocolError> {
    for line in head.split("\r\n").skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case(KEY_HEADER) {
                return Ok(value.trim());
            }
        }
    }
    Err(ProtocolError::MalformedHandshake(
        "missing sec-websocket-key header",
    ))
}

/// Runs the whole negotiation for a complete request head: key
/// extraction, accept computation, response formatting.
pub fn negotiate(head: &str) -> Result<String, ProtocolError> {
    let key = client_key(head)?;
    let accept = accept_key(key)?;
    Ok(upgrade_response(&accept))
}
