//! Upgrade-handshake accept-key computation (RFC 6455 §4.2.2).
//!
//! When a client asks to switch an HTTP connection to the frame transport it
//! sends a random `Sec-WebSocket-Key`; the server proves it understood the
//! request by echoing back the SHA-1 of that key concatenated with a fixed
//! GUID, base64-encoded, in `Sec-WebSocket-Accept`.  Everything else about
//! the HTTP exchange is the caller's business.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};

/// The protocol-mandated GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a client's
/// `Sec-WebSocket-Key` header value.
///
/// Surrounding whitespace on the key is ignored; the key itself is treated
/// as an opaque token and not base64-validated, mirroring what servers do in
/// practice.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}
