//! HTTP/1.1 request serialization.

use std::fmt::Write;

use tracing::warn;

use crate::http::RequestDescriptor;

/// Serialize a request into its HTTP/1.1 wire form.
///
/// The output always carries exactly one `Host` header, placed first: the
/// caller's value when one was set, otherwise the URL authority. Entries that
/// would break message framing are skipped. No body is written.
pub fn serialize(request: &RequestDescriptor) -> Vec<u8> {
    let mut head = String::with_capacity(256);
    let _ = write!(
        head,
        "{} {} HTTP/1.1\r\n",
        request.method.as_str(),
        request.url.request_target()
    );

    let host = request
        .headers
        .get("host")
        .filter(|value| !value.trim().is_empty() && is_valid_value(value))
        .map(str::to_string)
        .unwrap_or_else(|| request.url.host_header());
    let _ = write!(head, "Host: {host}\r\n");

    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        if !is_valid_name(name) || !is_valid_value(value) {
            warn!(header = name, "skipping request header that would break framing");
            continue;
        }
        let _ = write!(head, "{name}: {value}\r\n");
    }

    head.push_str("\r\n");
    head.into_bytes()
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':')
}

fn is_valid_value(value: &str) -> bool {
    !value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0)
}
