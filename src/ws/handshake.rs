use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use thiserror::Error;

const WS_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const KEY_HEADER: &str = "sec-websocket-key:";

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("request did not contain a complete header block")]
    Incomplete,

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
}

/// Extracts the trimmed `Sec-WebSocket-Key` value from a raw HTTP upgrade request. Header
/// name matching is case-insensitive, matching RFC 6455 and most intermediary proxies.
pub fn extract_key(request: &str) -> Result<&str, HandshakeError> {
    if !request.contains("\r\n\r\n") {
        return Err(HandshakeError::Incomplete);
    }

    for line in request.split("\r\n") {
        let lower = line.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix(KEY_HEADER) {
            let start = line.len() - rest.len();
            return Ok(line[start..].trim());
        }
    }

    Err(HandshakeError::MissingKey)
}

/// `base64(SHA1(key || magic_guid))`, per RFC 6455 section 1.3.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Builds the full `101 Switching Protocols` response for a given client key.
pub fn build_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc6455_example_key_produces_documented_accept() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn extracts_key_case_insensitively() {
        let req = "GET / HTTP/1.1\r\nSEC-WEBSOCKET-KEY: abc123==\r\n\r\n";
        assert_eq!(extract_key(req).unwrap(), "abc123==");
    }

    #[test]
    fn missing_key_is_an_error() {
        let req = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(matches!(extract_key(req), Err(HandshakeError::MissingKey)));
    }

    #[test]
    fn incomplete_request_is_an_error() {
        assert!(matches!(extract_key("GET / HTTP/1.1\r\n"), Err(HandshakeError::Incomplete)));
    }
}
