//! XLink Kai e-info protocol
//!
//! ASCII tag-and-semicolon framing over UDP. A datagram starts with a
//! semicolon-terminated tag; the `e;e;` tag is followed by a raw Ethernet
//! frame.

pub mod connection;

pub use connection::{ConnectionState, XLinkError, XLinkKaiConnection};

/// Default XLink Kai control/discovery port
pub const DEFAULT_PORT: u16 = 34523;

/// Ethernet frame tag, payload follows
pub const TAG_ETHERNET: &[u8] = b"e;e;";

/// Outgoing keepalive
pub const TAG_KEEPALIVE: &[u8] = b"e;keepalive;";

/// Chat message prefix, `e;chat;<msg>;`
pub const TAG_CHAT: &[u8] = b"e;chat;";

/// Orderly disconnect
pub const TAG_DISCONNECT: &[u8] = b"disconnect;disconnect;";

/// Incoming handshake completion, `connected;...;`
pub const TAG_CONNECTED: &[u8] = b"connected;";

/// Incoming bare keepalive probe
pub const TAG_KEEPALIVE_PROBE: &[u8] = b"keepalive;";

/// Incoming disconnect notification
pub const TAG_DISCONNECT_PREFIX: &[u8] = b"disconnect;";

/// The handshake datagram sent on open/discovery.
pub fn connect_message() -> Vec<u8> {
    format!(
        "connect;{};{};",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .into_bytes()
}

/// Parsed incoming datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XLinkMessage<'a> {
    /// Handshake completed
    Connected,
    /// Keepalive probe, answer in kind
    Keepalive,
    /// Downstream Ethernet frame
    Ethernet(&'a [u8]),
    /// Chat line
    Chat(&'a [u8]),
    /// Peer is going away
    Disconnect,
    /// Unrecognized tag
    Unknown(&'a [u8]),
}

/// Classify a received datagram by its leading tag.
pub fn parse_message(data: &[u8]) -> XLinkMessage<'_> {
    if let Some(payload) = data.strip_prefix(TAG_ETHERNET) {
        return XLinkMessage::Ethernet(payload);
    }
    if data.starts_with(TAG_CONNECTED) {
        return XLinkMessage::Connected;
    }
    if data.starts_with(TAG_KEEPALIVE_PROBE) || data.starts_with(TAG_KEEPALIVE) {
        return XLinkMessage::Keepalive;
    }
    if let Some(rest) = data.strip_prefix(TAG_CHAT) {
        let msg = rest.strip_suffix(b";").unwrap_or(rest);
        return XLinkMessage::Chat(msg);
    }
    if data.starts_with(TAG_DISCONNECT_PREFIX) {
        return XLinkMessage::Disconnect;
    }
    XLinkMessage::Unknown(data)
}

/// Wrap an Ethernet frame for the wire.
pub fn ethernet_message(frame: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(TAG_ETHERNET.len() + frame.len());
    message.extend_from_slice(TAG_ETHERNET);
    message.extend_from_slice(frame);
    message
}

/// Wrap a chat line for the wire.
pub fn chat_message(msg: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(TAG_CHAT.len() + msg.len() + 1);
    message.extend_from_slice(TAG_CHAT);
    message.extend_from_slice(msg.as_bytes());
    message.push(b';');
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        assert_eq!(
            parse_message(b"connected;kai;7.4.18;"),
            XLinkMessage::Connected
        );
        assert_eq!(parse_message(b"keepalive;"), XLinkMessage::Keepalive);
        assert_eq!(parse_message(b"e;keepalive;"), XLinkMessage::Keepalive);
        assert_eq!(
            parse_message(b"e;e;\x01\x02\x03"),
            XLinkMessage::Ethernet(&[1, 2, 3])
        );
        assert_eq!(
            parse_message(b"e;chat;hello there;"),
            XLinkMessage::Chat(b"hello there")
        );
        assert_eq!(
            parse_message(b"disconnect;bye;"),
            XLinkMessage::Disconnect
        );
        assert_eq!(
            parse_message(b"setting;foo;"),
            XLinkMessage::Unknown(b"setting;foo;")
        );
    }

    #[test]
    fn test_ethernet_payload_is_verbatim() {
        // Payload bytes that look like tags must not be re-interpreted
        let payload = b"connected;not-a-tag";
        let wire = ethernet_message(payload);
        assert_eq!(parse_message(&wire), XLinkMessage::Ethernet(&payload[..]));
    }

    #[test]
    fn test_connect_message_shape() {
        let msg = connect_message();
        let text = String::from_utf8(msg).unwrap();
        assert!(text.starts_with("connect;kaibridge;"));
        assert!(text.ends_with(';'));
        assert_eq!(text.matches(';').count(), 3);
    }

    #[test]
    fn test_chat_message_shape() {
        assert_eq!(chat_message("gg"), b"e;chat;gg;".to_vec());
    }
}
