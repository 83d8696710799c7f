//! One request/response exchange over one connection.
//!
//! # Design
//! A transfer is split in two phases. `start` connects, writes the request
//! and reads until the response head is parsed; `stream_body` forwards the
//! remaining body frames to a sink. The engine uses the gap between them to
//! decide whether a redirect body should reach the sink at all. `run` chains
//! both phases for callers that do not care.
//!
//! All socket operations share one deadline derived from `totalTimeoutMs`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ClientConfig;
use tracing::{debug, info_span, trace, Span};
use uuid::Uuid;

use crate::config::{TrailerPolicy, TransferOptions};
use crate::connection::Connection;
use crate::error::{ConnectError, IoError, ParseError, TransferError};
use crate::http::{BodyFrame, Headers, RequestDescriptor, ResponseHead};
use crate::parser::{ParserEvent, ResponseParser};
use crate::sink::{ByteSink, SinkFlow};
use crate::target::TargetUrl;
use crate::writer::serialize;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Settings shared by every transfer of one fetch.
#[derive(Clone)]
pub struct TransferContext {
    /// Absolute deadline for the whole fetch.
    pub deadline: Option<Instant>,
    pub connect_timeout: Option<Duration>,
    pub tls: Arc<ClientConfig>,
    pub trailers: TrailerPolicy,
}

impl TransferContext {
    pub fn new(options: &TransferOptions, tls: Arc<ClientConfig>) -> Self {
        Self {
            deadline: options.total_timeout().map(|t| Instant::now() + t),
            connect_timeout: options.connect_timeout(),
            tls,
            trailers: options.trailers,
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Connect budget: the connect timeout, capped by the time left overall.
    fn connect_budget(&self) -> Result<Option<Duration>, TransferError> {
        let left = match self.deadline {
            None => return Ok(self.connect_timeout),
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        };
        if left.is_zero() {
            return Err(TransferError::Timeout);
        }
        Ok(Some(match self.connect_timeout {
            Some(connect) => connect.min(left),
            None => left,
        }))
    }

    /// Report a timeout caused by the overall deadline as `Timeout`.
    fn classify(&self, err: TransferError) -> TransferError {
        match err {
            TransferError::Io(IoError::Timeout) if self.deadline.is_some() => TransferError::Timeout,
            TransferError::Connect(ConnectError::Timeout) if self.deadline_passed() => {
                TransferError::Timeout
            }
            other => other,
        }
    }
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub transfer_id: Uuid,
    pub head: ResponseHead,
    /// Body bytes handed to the sink.
    pub bytes_delivered: u64,
    /// URL of the final request, after redirects.
    pub effective_url: TargetUrl,
    pub redirects: u32,
    /// Chunked trailers, kept only under `TrailerPolicy::Merge`.
    pub trailers: Headers,
    pub elapsed: Duration,
}

impl TransferResult {
    pub fn status(&self) -> u16 {
        self.head.status
    }
}

/// A transfer whose response head has been read.
pub struct Transfer {
    id: Uuid,
    url: TargetUrl,
    connection: Connection,
    parser: ResponseParser,
    head: ResponseHead,
    deadline: Option<Instant>,
    started: Instant,
    buf: Vec<u8>,
    span: Span,
}

impl Transfer {
    /// Perform `request` and stream its body to `sink`.
    pub fn run<S: ByteSink + ?Sized>(
        request: &RequestDescriptor,
        sink: &mut S,
        ctx: &TransferContext,
    ) -> Result<TransferResult, TransferError> {
        match Self::start(request, ctx) {
            Ok(transfer) => transfer.stream_body(sink),
            Err(err) => {
                deliver_failure(sink, &err);
                Err(err)
            }
        }
    }

    /// Connect, send `request`, and read up to the end of the response head.
    pub fn start(request: &RequestDescriptor, ctx: &TransferContext) -> Result<Self, TransferError> {
        let id = Uuid::new_v4();
        let span = info_span!("transfer", %id, url = %request.url);
        let started = Instant::now();
        let mut buf = vec![0u8; READ_BUF_SIZE];

        let (connection, parser, head) =
            span.in_scope(|| exchange_head(request, ctx, &mut buf).map_err(|e| ctx.classify(e)))?;

        Ok(Self {
            id,
            url: request.url.clone(),
            connection,
            parser,
            head,
            deadline: ctx.deadline,
            started,
            buf,
            span,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn url(&self) -> &TargetUrl {
        &self.url
    }

    /// Forward body frames to `sink` until `End` or `Error`.
    pub fn stream_body<S: ByteSink + ?Sized>(mut self, sink: &mut S) -> Result<TransferResult, TransferError> {
        let span = self.span.clone();
        let _entered = span.enter();
        let mut delivered = 0u64;

        loop {
            match self.parser.next_event() {
                Some(ParserEvent::Frame(frame)) => {
                    if let BodyFrame::Chunk(bytes) = &frame {
                        trace!(len = bytes.len(), "body chunk");
                        delivered += bytes.len() as u64;
                    }
                    let flow = sink.on_frame(&frame);
                    match frame {
                        BodyFrame::Chunk(_) => {
                            if flow == SinkFlow::Abort {
                                debug!(bytes = delivered, "sink aborted transfer");
                                self.connection.close();
                                return Err(TransferError::Aborted);
                            }
                        }
                        BodyFrame::End => {
                            self.connection.close();
                            debug!(bytes = delivered, "transfer complete");
                            return Ok(self.finish(delivered));
                        }
                        BodyFrame::Error(kind) => {
                            self.connection.close();
                            return Err(kind.into());
                        }
                    }
                }
                Some(ParserEvent::Head(_)) => {
                    unreachable!("response head after body started")
                }
                None => {
                    if self.deadline.is_some_and(|d| Instant::now() >= d) {
                        debug!(bytes = delivered, "deadline reached during body");
                        self.connection.close();
                        return Err(TransferError::Timeout);
                    }
                    let read = fill(&mut self.connection, &mut self.parser, &mut self.buf, self.deadline);
                    if let Err(err) = read {
                        self.connection.close();
                        let err = match err {
                            IoError::Timeout if self.deadline.is_some() => TransferError::Timeout,
                            other => TransferError::Io(other),
                        };
                        return Err(err);
                    }
                }
            }
        }
    }

    fn finish(mut self, bytes_delivered: u64) -> TransferResult {
        TransferResult {
            transfer_id: self.id,
            trailers: self.parser.take_trailers(),
            head: self.head,
            bytes_delivered,
            effective_url: self.url,
            redirects: 0,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Give a sink the terminal `Error` frame for a parse failure that happened
/// before any body frame could be delivered.
pub(crate) fn deliver_failure<S: ByteSink + ?Sized>(sink: &mut S, err: &TransferError) {
    if let TransferError::Parse(kind) = err {
        let _ = sink.on_frame(&BodyFrame::Error(*kind));
    }
}

fn exchange_head(
    request: &RequestDescriptor,
    ctx: &TransferContext,
    buf: &mut [u8],
) -> Result<(Connection, ResponseParser, ResponseHead), TransferError> {
    let url = &request.url;
    let budget = ctx.connect_budget()?;
    debug!(host = url.host(), port = url.port(), tls = url.uses_tls(), "connecting");

    let tls = url.uses_tls().then(|| Arc::clone(&ctx.tls));
    let mut connection = Connection::open(&url.connect_host(), url.port(), tls, budget)?;

    debug!(method = request.method.as_str(), target = %url.request_target(), "sending request");
    connection.write_all(&serialize(request), ctx.deadline)?;

    let mut parser = ResponseParser::for_method(request.method).trailer_policy(ctx.trailers);
    loop {
        match parser.next_event() {
            Some(ParserEvent::Head(head)) => {
                debug!(status = head.status, framing = ?parser.framing(), "response head");
                return Ok((connection, parser, head));
            }
            Some(ParserEvent::Frame(BodyFrame::Error(kind))) => return Err(kind.into()),
            Some(ParserEvent::Frame(frame)) => {
                unreachable!("body frame {frame:?} before response head")
            }
            None => {
                if parser.is_finished() {
                    return Err(ParseError::IncompleteHead.into());
                }
                fill(&mut connection, &mut parser, buf, ctx.deadline)?;
            }
        }
    }
}

/// Read once from `connection` into `parser`. End of stream is passed on as
/// `feed_eof`.
fn fill(
    connection: &mut Connection,
    parser: &mut ResponseParser,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<(), IoError> {
    let n = connection.read_some(buf, deadline)?;
    if n == 0 {
        trace!("peer closed connection");
        parser.feed_eof();
    } else {
        parser.feed(&buf[..n]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BodyCollector;
    use crate::tls::default_client_config;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(response: &'static [u8]) -> (String, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://127.0.0.1:{}/resource", listener.local_addr().unwrap().port());
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"\r\n\r\n") {
                let n = socket.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).unwrap();
            request
        });
        (url, handle)
    }

    fn context(options: &TransferOptions) -> TransferContext {
        TransferContext::new(options, default_client_config().unwrap())
    }

    #[test]
    fn run_streams_fixed_length_body() {
        let (url, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let request = RequestDescriptor::get(TargetUrl::parse(&url).unwrap());
        let mut sink = BodyCollector::new();

        let result = Transfer::run(&request, &mut sink, &context(&TransferOptions::default())).unwrap();

        assert_eq!(result.status(), 200);
        assert_eq!(result.bytes_delivered, 5);
        assert_eq!(sink.body, b"hello");
        assert!(sink.ended_cleanly());
        assert_eq!(sink.terminal_count, 1);

        let sent = String::from_utf8(server.join().unwrap()).unwrap();
        assert!(sent.starts_with("GET /resource HTTP/1.1\r\nHost: 127.0.0.1:"));
    }

    #[test]
    fn start_exposes_head_before_body() {
        let (url, server) = serve_once(b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 4\r\n\r\nmove");
        let request = RequestDescriptor::get(TargetUrl::parse(&url).unwrap());
        let transfer = Transfer::start(&request, &context(&TransferOptions::default())).unwrap();
        assert!(transfer.head().is_redirect());
        assert_eq!(transfer.head().location(), Some("/next"));
        drop(transfer);
        server.join().unwrap();
    }

    #[test]
    fn parse_failure_before_head_reaches_sink() {
        let (url, server) = serve_once(b"HTTP/1.1 abc OK\r\n\r\n");
        let request = RequestDescriptor::get(TargetUrl::parse(&url).unwrap());
        let mut sink = BodyCollector::new();

        let err = Transfer::run(&request, &mut sink, &context(&TransferOptions::default())).unwrap_err();

        assert!(matches!(err, TransferError::Parse(ParseError::MalformedStatus)));
        assert_eq!(sink.terminal, Some(BodyFrame::Error(ParseError::MalformedStatus)));
        assert_eq!(sink.terminal_count, 1);
        server.join().unwrap();
    }

    #[test]
    fn head_request_ignores_content_length() {
        let (url, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n");
        let request = RequestDescriptor::head(TargetUrl::parse(&url).unwrap());
        let mut sink = BodyCollector::new();

        let result = Transfer::run(&request, &mut sink, &context(&TransferOptions::default())).unwrap();

        assert_eq!(result.bytes_delivered, 0);
        assert!(sink.ended_cleanly());
        let sent = String::from_utf8(server.join().unwrap()).unwrap();
        assert!(sent.starts_with("HEAD /resource HTTP/1.1\r\n"));
    }

    #[test]
    fn merged_trailers_are_reported() {
        let (url, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Checksum: 42\r\n\r\n",
        );
        let options = TransferOptions {
            trailers: TrailerPolicy::Merge,
            ..TransferOptions::default()
        };
        let request = RequestDescriptor::get(TargetUrl::parse(&url).unwrap());
        let mut body: Vec<u8> = Vec::new();

        let result = Transfer::run(&request, &mut body, &context(&options)).unwrap();

        assert_eq!(body, b"abc");
        assert_eq!(result.trailers.get("x-checksum"), Some("42"));
        server.join().unwrap();
    }

    #[test]
    fn expired_deadline_fails_before_connecting() {
        let options = TransferOptions::default();
        let mut ctx = context(&options);
        ctx.deadline = Some(Instant::now() - Duration::from_millis(1));
        let request = RequestDescriptor::get(TargetUrl::parse("http://127.0.0.1:9/").unwrap());
        let err = Transfer::run(&request, &mut Vec::<u8>::new(), &ctx).unwrap_err();
        assert!(matches!(err, TransferError::Timeout));
    }

    #[test]
    fn connect_timeout_stays_a_connect_error_without_deadline() {
        let ctx = context(&TransferOptions::default());
        let err = ctx.classify(TransferError::Connect(ConnectError::Timeout));
        assert!(matches!(err, TransferError::Connect(ConnectError::Timeout)), "{err:?}");
    }

    #[test]
    fn connect_timeout_before_deadline_stays_a_connect_error() {
        let mut ctx = context(&TransferOptions::default());
        ctx.deadline = Some(Instant::now() + Duration::from_secs(60));

        let connect = ctx.classify(TransferError::Connect(ConnectError::Timeout));
        assert!(matches!(connect, TransferError::Connect(ConnectError::Timeout)), "{connect:?}");

        let io = ctx.classify(TransferError::Io(IoError::Timeout));
        assert!(matches!(io, TransferError::Timeout), "{io:?}");
    }

    #[test]
    fn connect_timeout_after_deadline_is_a_transfer_timeout() {
        let mut ctx = context(&TransferOptions::default());
        ctx.deadline = Some(Instant::now() - Duration::from_millis(1));
        let err = ctx.classify(TransferError::Connect(ConnectError::Timeout));
        assert!(matches!(err, TransferError::Timeout), "{err:?}");
    }

    #[test]
    fn connect_budget_is_capped_by_the_deadline() {
        let options = TransferOptions {
            connect_timeout_ms: 60_000,
            ..TransferOptions::default()
        };
        let mut ctx = context(&options);
        assert_eq!(ctx.connect_budget().unwrap(), Some(Duration::from_secs(60)));

        ctx.deadline = Some(Instant::now() + Duration::from_millis(500));
        let budget = ctx.connect_budget().unwrap().unwrap();
        assert!(budget <= Duration::from_millis(500));
    }
}
