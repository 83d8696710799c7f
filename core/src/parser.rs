//! Incremental HTTP/1.1 response parser.
//!
//! # Design
//! The parser never touches a socket. The transfer feeds it whatever bytes a
//! read returned (`feed`), tells it when the peer closed (`feed_eof`), and
//! pulls events (`next_event`) until it gets `None`, which means "need more
//! input" or "finished". This keeps framing logic testable byte-by-byte.
//!
//! State machine:
//!
//! ```text
//! StatusLine -> Headers -> Body(framing) -> Done
//!      \            \            \
//!       +------------+------------+--> Failed(kind)
//! ```
//!
//! Event contract:
//! - exactly one `Head` per final (non-interim) response;
//! - each step that consumes body bytes yields one `Frame(Chunk)`;
//! - reaching `Done` yields exactly one `Frame(End)`;
//! - entering `Failed` yields exactly one `Frame(Error)`; every later call
//!   returns `None` and further input is discarded.

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::config::TrailerPolicy;
use crate::error::ParseError;
use crate::http::{BodyFrame, Headers, HttpMethod, ResponseHead, Version};

/// Maximum size of a response head, status line and headers together (64 KiB).
pub const DEFAULT_MAX_HEAD_SIZE: usize = 64 * 1024;

/// Longest chunk-size line accepted, extensions included.
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// How the body of the current response is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body: HEAD responses, 1xx, 204 and 304.
    Empty,
    Chunked,
    Fixed(u64),
    /// Body runs until the peer closes the connection.
    UntilClose,
}

/// Output of [`ResponseParser::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    Head(ResponseHead),
    Frame(BodyFrame),
}

enum State {
    StatusLine,
    Headers(PartialHead),
    Body(BodyState),
    Done,
    Failed(ParseError),
}

struct PartialHead {
    version: Version,
    status: u16,
    reason: String,
    headers: Headers,
}

enum BodyState {
    Empty,
    Fixed { remaining: u64 },
    UntilClose,
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
}

enum Step {
    NeedMore,
    Continue,
    Event(ParserEvent),
    Fail(ParseError),
}

/// Sans-IO response parser for one response.
pub struct ResponseParser {
    state: State,
    buf: BytesMut,
    eof: bool,
    expects_body: bool,
    trailer_policy: TrailerPolicy,
    trailers: Headers,
    trailer_bytes: usize,
    framing: Option<Framing>,
    head_bytes: usize,
    max_head_size: usize,
}

impl ResponseParser {
    /// Parser for the response to a GET request.
    pub fn new() -> Self {
        Self::for_method(HttpMethod::Get)
    }

    /// Parser for the response to a request with `method`. Responses to HEAD
    /// never carry a body, whatever their headers say.
    pub fn for_method(method: HttpMethod) -> Self {
        Self {
            state: State::StatusLine,
            buf: BytesMut::with_capacity(8 * 1024),
            eof: false,
            expects_body: method != HttpMethod::Head,
            trailer_policy: TrailerPolicy::default(),
            trailers: Headers::new(),
            trailer_bytes: 0,
            framing: None,
            head_bytes: 0,
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
        }
    }

    #[must_use]
    pub fn trailer_policy(mut self, policy: TrailerPolicy) -> Self {
        self.trailer_policy = policy;
        self
    }

    #[must_use]
    pub fn max_head_size(mut self, size: usize) -> Self {
        self.max_head_size = size;
        self
    }

    /// Append bytes read from the connection. Ignored once the parser has
    /// finished or failed.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.is_finished() {
            trace!(len = bytes.len(), "discarding input after final frame");
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Signal that the peer closed the connection.
    pub fn feed_eof(&mut self) {
        self.eof = true;
    }

    /// True once `End` or `Error` has been produced.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Done | State::Failed(_))
    }

    /// The failure kind, if the parser has failed.
    pub fn failure(&self) -> Option<ParseError> {
        match self.state {
            State::Failed(kind) => Some(kind),
            _ => None,
        }
    }

    /// Body framing chosen for the final response, once its head is parsed.
    pub fn framing(&self) -> Option<Framing> {
        self.framing
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Trailers of a chunked body. Empty unless the policy is `Merge` and
    /// the body has ended.
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    pub fn take_trailers(&mut self) -> Headers {
        std::mem::take(&mut self.trailers)
    }

    /// Produce the next event, or `None` when more input is needed or the
    /// parser is finished.
    pub fn next_event(&mut self) -> Option<ParserEvent> {
        loop {
            let step = match self.state {
                State::Done | State::Failed(_) => return None,
                State::StatusLine => self.step_status_line(),
                State::Headers(_) => self.step_header_line(),
                State::Body(_) => self.step_body(),
            };
            match step {
                Step::NeedMore => return None,
                Step::Continue => continue,
                Step::Event(event) => return Some(event),
                Step::Fail(kind) => {
                    debug!(error = %kind, "response parse failed");
                    self.state = State::Failed(kind);
                    self.buf.clear();
                    self.trailers = Headers::new();
                    return Some(ParserEvent::Frame(BodyFrame::Error(kind)));
                }
            }
        }
    }

    /// Iterate over every event available from the input fed so far.
    pub fn events(&mut self) -> impl Iterator<Item = ParserEvent> + '_ {
        std::iter::from_fn(move || self.next_event())
    }

    fn take_head_line(&mut self) -> Result<Option<BytesMut>, ParseError> {
        match take_line(&mut self.buf) {
            Some((line, consumed)) => {
                self.head_bytes += consumed;
                if self.head_bytes > self.max_head_size {
                    return Err(ParseError::HeadersTooLarge);
                }
                Ok(Some(line))
            }
            None if self.head_bytes + self.buf.len() > self.max_head_size => {
                Err(ParseError::HeadersTooLarge)
            }
            None if self.eof => Err(ParseError::IncompleteHead),
            None => Ok(None),
        }
    }

    fn step_status_line(&mut self) -> Step {
        let line = match self.take_head_line() {
            Ok(Some(line)) => line,
            Ok(None) => return Step::NeedMore,
            Err(kind) => return Step::Fail(kind),
        };
        // Stray blank lines ahead of a status line are tolerated.
        if line.is_empty() {
            return Step::Continue;
        }
        match parse_status_line(&line) {
            Ok(partial) => {
                self.state = State::Headers(partial);
                Step::Continue
            }
            Err(kind) => Step::Fail(kind),
        }
    }

    fn step_header_line(&mut self) -> Step {
        let line = match self.take_head_line() {
            Ok(Some(line)) => line,
            Ok(None) => return Step::NeedMore,
            Err(kind) => return Step::Fail(kind),
        };
        if line.is_empty() {
            return self.finish_head();
        }
        let State::Headers(partial) = &mut self.state else {
            unreachable!("header line outside header state")
        };
        match parse_header_into(&mut partial.headers, &line) {
            Ok(()) => Step::Continue,
            Err(kind) => Step::Fail(kind),
        }
    }

    fn finish_head(&mut self) -> Step {
        let State::Headers(partial) = std::mem::replace(&mut self.state, State::StatusLine) else {
            unreachable!("head finished outside header state")
        };
        let head = ResponseHead {
            version: partial.version,
            status: partial.status,
            reason: partial.reason,
            headers: partial.headers,
        };

        if (100..200).contains(&head.status) && head.status != 101 {
            debug!(status = head.status, "skipping interim response");
            self.head_bytes = 0;
            return Step::Continue;
        }

        let framing = match self.select_framing(&head) {
            Ok(framing) => framing,
            Err(kind) => return Step::Fail(kind),
        };
        debug!(status = head.status, ?framing, "response head parsed");
        self.framing = Some(framing);
        self.state = State::Body(match framing {
            Framing::Empty => BodyState::Empty,
            Framing::Chunked => BodyState::ChunkSize,
            Framing::Fixed(remaining) => BodyState::Fixed { remaining },
            Framing::UntilClose => BodyState::UntilClose,
        });
        Step::Event(ParserEvent::Head(head))
    }

    fn select_framing(&self, head: &ResponseHead) -> Result<Framing, ParseError> {
        if !self.expects_body || matches!(head.status, 100..=199 | 204 | 304) {
            return Ok(Framing::Empty);
        }
        if head.headers.has_token("transfer-encoding", "chunked") {
            return Ok(Framing::Chunked);
        }
        if let Some(length) = content_length(&head.headers)? {
            return Ok(Framing::Fixed(length));
        }
        if head.version == Version::Http10 || head.headers.has_token("connection", "close") {
            return Ok(Framing::UntilClose);
        }
        Err(ParseError::AmbiguousFraming)
    }

    fn step_body(&mut self) -> Step {
        let State::Body(body) = &mut self.state else {
            unreachable!("body step outside body state")
        };
        match body {
            BodyState::Empty => self.finish(),

            BodyState::Fixed { remaining } => {
                if *remaining == 0 {
                    return self.finish();
                }
                if !self.buf.is_empty() {
                    let take = bounded(self.buf.len(), *remaining);
                    *remaining -= take as u64;
                    return chunk(self.buf.split_to(take));
                }
                if self.eof {
                    return Step::Fail(ParseError::TruncatedBody);
                }
                Step::NeedMore
            }

            BodyState::UntilClose => {
                if !self.buf.is_empty() {
                    return chunk(self.buf.split());
                }
                if self.eof {
                    return self.finish();
                }
                Step::NeedMore
            }

            BodyState::ChunkSize => {
                let Some((line, _)) = take_line(&mut self.buf) else {
                    if self.buf.len() > MAX_CHUNK_LINE {
                        return Step::Fail(ParseError::MalformedChunk);
                    }
                    if self.eof {
                        return Step::Fail(ParseError::TruncatedBody);
                    }
                    return Step::NeedMore;
                };
                match parse_chunk_size(&line) {
                    Some(0) => *body = BodyState::Trailers,
                    Some(size) => *body = BodyState::ChunkData { remaining: size },
                    None => return Step::Fail(ParseError::MalformedChunk),
                }
                Step::Continue
            }

            BodyState::ChunkData { remaining } => {
                if !self.buf.is_empty() {
                    let take = bounded(self.buf.len(), *remaining);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        *body = BodyState::ChunkDataEnd;
                    }
                    return chunk(self.buf.split_to(take));
                }
                if self.eof {
                    return Step::Fail(ParseError::TruncatedBody);
                }
                Step::NeedMore
            }

            BodyState::ChunkDataEnd => {
                if self.buf.starts_with(b"\r\n") {
                    self.buf.advance(2);
                } else if self.buf.starts_with(b"\n") {
                    self.buf.advance(1);
                } else if self.buf.is_empty() || self.buf[..] == b"\r"[..] {
                    if self.eof {
                        return Step::Fail(ParseError::TruncatedBody);
                    }
                    return Step::NeedMore;
                } else {
                    return Step::Fail(ParseError::MalformedChunk);
                }
                *body = BodyState::ChunkSize;
                Step::Continue
            }

            BodyState::Trailers => {
                let Some((line, consumed)) = take_line(&mut self.buf) else {
                    if self.trailer_bytes + self.buf.len() > self.max_head_size {
                        return Step::Fail(ParseError::HeadersTooLarge);
                    }
                    if self.eof {
                        return Step::Fail(ParseError::TruncatedBody);
                    }
                    return Step::NeedMore;
                };
                self.trailer_bytes += consumed;
                if self.trailer_bytes > self.max_head_size {
                    return Step::Fail(ParseError::HeadersTooLarge);
                }
                if line.is_empty() {
                    return self.finish();
                }
                // Discarded trailers are still validated; only the last one is
                // kept so a folded continuation has something to join.
                if self.trailer_policy == TrailerPolicy::Discard
                    && !matches!(line.first(), Some(b' ' | b'\t'))
                {
                    self.trailers = Headers::new();
                }
                match parse_header_into(&mut self.trailers, &line) {
                    Ok(()) => Step::Continue,
                    Err(kind) => Step::Fail(kind),
                }
            }
        }
    }

    fn finish(&mut self) -> Step {
        self.state = State::Done;
        if self.trailer_policy == TrailerPolicy::Discard {
            self.trailers = Headers::new();
        }
        Step::Event(ParserEvent::Frame(BodyFrame::End))
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn chunk(bytes: BytesMut) -> Step {
    trace!(len = bytes.len(), "body chunk");
    Step::Event(ParserEvent::Frame(BodyFrame::Chunk(bytes.freeze())))
}

fn bounded(available: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(available, |r| available.min(r))
}

/// Split one line off the front of `buf`. Lines end in CRLF or a bare LF;
/// the terminator is stripped. Returns the line and the bytes consumed.
fn take_line(buf: &mut BytesMut) -> Option<(BytesMut, usize)> {
    let newline = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(newline + 1);
    line.truncate(newline);
    if line.last() == Some(&b'\r') {
        line.truncate(newline - 1);
    }
    Some((line, newline + 1))
}

/// Parse `HTTP/1.x SP code [SP reason]`.
fn parse_status_line(line: &[u8]) -> Result<PartialHead, ParseError> {
    let rest = line
        .strip_prefix(b"HTTP/1.")
        .ok_or(ParseError::MalformedStatus)?;
    let (&minor, rest) = rest.split_first().ok_or(ParseError::MalformedStatus)?;
    let version = match minor {
        b'0' => Version::Http10,
        b'1'..=b'9' => Version::Http11,
        _ => return Err(ParseError::MalformedStatus),
    };
    let rest = rest.strip_prefix(b" ").ok_or(ParseError::MalformedStatus)?;
    let (code, reason) = match rest.iter().position(|&b| b == b' ') {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, &[][..]),
    };
    if code.len() != 3 || !code.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::MalformedStatus);
    }
    let status = code
        .iter()
        .fold(0u16, |acc, &d| acc * 10 + u16::from(d - b'0'));
    if !(100..=599).contains(&status) {
        return Err(ParseError::MalformedStatus);
    }
    Ok(PartialHead {
        version,
        status,
        reason: String::from_utf8_lossy(reason).trim().to_string(),
        headers: Headers::new(),
    })
}

/// Parse one header (or folded continuation) line into `headers`.
fn parse_header_into(headers: &mut Headers, line: &[u8]) -> Result<(), ParseError> {
    if matches!(line.first(), Some(b' ' | b'\t')) {
        let more = String::from_utf8_lossy(line);
        return if headers.fold_into_last(trim_ows(&more)) {
            Ok(())
        } else {
            Err(ParseError::MalformedHeader)
        };
    }
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::MalformedHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().copied().all(is_token_byte) {
        return Err(ParseError::MalformedHeader);
    }
    let name = std::str::from_utf8(name).map_err(|_| ParseError::MalformedHeader)?;
    let value = String::from_utf8_lossy(&line[colon + 1..]);
    headers.append(name, trim_ows(&value));
    Ok(())
}

fn trim_ows(value: &str) -> &str {
    value.trim_matches(|c| c == ' ' || c == '\t')
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_graphic() && !b"\"(),/:;<=>?@[\\]{}".contains(&b)
}

/// Parse a chunk-size line, ignoring any `;extension`.
fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let size = match line.iter().position(|&b| b == b';') {
        Some(i) => &line[..i],
        None => line,
    };
    let size = std::str::from_utf8(size).ok()?;
    let size = trim_ows(size);
    if size.is_empty() || size.len() > 16 || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(size, 16).ok()
}

/// Resolve `Content-Length`. Repeated values must agree; a value that is not
/// a plain decimal number is treated as absent.
fn content_length(headers: &Headers) -> Result<Option<u64>, ParseError> {
    let mut found = None;
    for raw in headers.get_all("content-length").flat_map(|v| v.split(',')) {
        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }
        let Ok(length) = raw.parse::<u64>() else {
            return Ok(None);
        };
        match found {
            Some(previous) if previous != length => return Err(ParseError::AmbiguousFraming),
            _ => found = Some(length),
        }
    }
    Ok(found)
}
