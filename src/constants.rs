//! Constants used throughout the gateway
//!
//! This module centralizes magic numbers, protocol markers and canned
//! responses to improve maintainability and reduce duplication.

use std::time::Duration;

/// Protocol detection constants
pub mod detect {
    /// Number of bytes peeked from a multi-protocol connection
    pub const PEEK_SIZE: usize = 8;

    /// SSH connections open with their identification string
    pub const SSH_PREFIX: &[u8] = b"SSH-";

    /// TLS record type for a handshake record
    pub const TLS_HANDSHAKE: u8 = 0x16;

    /// First four bytes of every HTTP method the gateway recognizes
    pub const HTTP_METHODS: [&[u8; 4]; 9] = [
        b"GET ", b"POST", b"PUT ", b"HEAD", b"DELE", b"OPTI", b"PATC", b"CONN", b"TRAC",
    ];
}

/// Timeout constants
pub mod timeout {
    use super::Duration;

    /// Connect timeout for backend dials
    pub const BACKEND_DIAL: Duration = Duration::from_secs(5);

    /// How long a forwarded SSH channel request may wait for the
    /// backend's success/failure reply
    pub const REQUEST_REPLY: Duration = Duration::from_secs(10);
}

/// HTTP handling constants
pub mod http {
    /// Maximum accumulated size of a request's header section
    pub const MAX_HEADER_SIZE: usize = 16384;

    /// Response for requests without a Host header
    pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\nMissing Host header\r\n";

    /// Response when the header section exceeds the cap
    pub const HEADER_TOO_LARGE: &[u8] = b"HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n";

    /// Response when no backend matches
    pub const BAD_GATEWAY_NO_BACKEND: &[u8] =
        b"HTTP/1.1 502 Bad Gateway\r\n\r\nNo backend available\r\n";

    /// Response when the backend dial fails
    pub const BAD_GATEWAY_DIAL_FAILED: &[u8] =
        b"HTTP/1.1 502 Bad Gateway\r\n\r\nBackend connection failed\r\n";
}

/// Responses sent on the decrypted side of a terminated TLS connection.
/// These always carry no-cache headers so intermediaries never store them.
pub mod https {
    pub const HEADER_TOO_LARGE: &[u8] =
        b"HTTP/1.1 431 Request Header Fields Too Large\r\nCache-Control: no-store, no-cache, must-revalidate\r\nPragma: no-cache\r\n\r\n";

    pub const BAD_GATEWAY_NO_BACKEND: &[u8] =
        b"HTTP/1.1 502 Bad Gateway\r\nCache-Control: no-store, no-cache, must-revalidate\r\nPragma: no-cache\r\n\r\nNo backend available\r\n";

    pub const BAD_GATEWAY_DIAL_FAILED: &[u8] =
        b"HTTP/1.1 502 Bad Gateway\r\nCache-Control: no-store, no-cache, must-revalidate\r\nPragma: no-cache\r\n\r\nBackend connection failed\r\n";
}

/// TLS record/ClientHello constants
pub mod tls {
    /// Size of a TLS record header
    pub const RECORD_HEADER_SIZE: usize = 5;

    /// Largest record payload the inspector accepts
    pub const MAX_RECORD_SIZE: usize = 16384;

    /// Handshake message type for ClientHello
    pub const CLIENT_HELLO: u8 = 0x01;

    /// Extension type carrying the server name
    pub const SNI_EXTENSION: u16 = 0x0000;
}

/// Well-known ports and their internal aliases
pub mod ports {
    /// Backend sshd port inside tenant containers
    pub const BACKEND_SSH: u16 = 22;

    /// Alternate HTTP port normalized to 80
    pub const ALT_HTTP: u16 = 8080;

    /// Alternate HTTPS port normalized to 443
    pub const ALT_HTTPS: u16 = 8443;
}

/// Router cache constants
pub mod router {
    use super::Duration;

    /// Interval between database refreshes of the container snapshot
    pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

    /// Default number of recent route lookups kept in the LRU cache
    pub const DEFAULT_LRU_CAPACITY: usize = 512;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_prefixes() {
        assert_eq!(detect::SSH_PREFIX, b"SSH-");
        for m in detect::HTTP_METHODS {
            assert_eq!(m.len(), 4);
        }
    }

    #[test]
    fn test_caps() {
        const _: () = assert!(http::MAX_HEADER_SIZE == tls::MAX_RECORD_SIZE);
        const _: () = assert!(detect::PEEK_SIZE >= 4);
    }

    #[test]
    fn test_timeouts() {
        assert!(timeout::BACKEND_DIAL.as_secs() > 0);
        assert!(timeout::REQUEST_REPLY >= timeout::BACKEND_DIAL);
    }
}
