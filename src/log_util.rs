//! Smol utilities for logging

use std::ascii;
use std::net::SocketAddr;

/// Make an Ascii-safe string
pub fn ascii_escape(s: &[u8]) -> String {
    s.iter()
        .flat_map(|&b| ascii::escape_default(b))
        .map(char::from)
        .collect()
}

/// How a connection is named in log lines
pub fn peer_label(peer: Option<&SocketAddr>) -> String {
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => String::from("-"),
    }
}

#[test]
fn escapes_control_bytes() {
    assert_eq!(ascii_escape(b"GET /\r\n"), "GET /\\r\\n");
    assert_eq!(ascii_escape(b"\xff"), "\\xff");
}
