//! Request framing
//!
//! Every request the flow engine sends is a bodiless `GET`. The frame is
//! built in one piece so it can be handed to the transport in a single write.

use super::{Endpoint, Headers, CRLF};

/// Build the raw request frame for one connection attempt
///
/// Produces `GET <target> HTTP/1.1\r\n<extra><cookie>Host: <host>\r\n\r\n`.
/// `cookie_header` is either empty or a complete `Cookie: ...\r\n` line as
/// rendered by the cookie store.
pub fn build_request(endpoint: &Endpoint, cookie_header: &str, extra_headers: &Headers) -> Vec<u8> {
    let mut buf = String::with_capacity(128);

    // Request line
    buf.push_str("GET ");
    buf.push_str(&endpoint.request_target());
    buf.push_str(" HTTP/1.1");
    buf.push_str(CRLF);

    buf.push_str(&extra_headers.to_wire());
    buf.push_str(cookie_header);

    buf.push_str("Host: ");
    buf.push_str(&endpoint.authority_host());
    buf.push_str(CRLF);

    // Empty line
    buf.push_str(CRLF);

    buf.into_bytes()
}
