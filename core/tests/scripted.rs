//! Transfers against hand-scripted raw TCP responses.
//!
//! These cover wire shapes a well-behaved server never produces: split
//! writes at awkward offsets, close-delimited bodies, truncation, malformed
//! heads, and stalls in the middle of a body.

mod common;

use std::time::{Duration, Instant};

use common::{init_test_logging, pause, send, serve_script, Step};
use transfer_core::{
    BodyCollector, BodyFrame, ParseError, TransferEngine, TransferError, TransferOptions,
};

fn fetch(url: &str, sink: &mut BodyCollector, options: &TransferOptions) -> Result<u64, TransferError> {
    init_test_logging();
    let engine = TransferEngine::new().unwrap();
    engine.fetch(url, sink, options).map(|r| r.bytes_delivered)
}

#[test]
fn wiki_pedia_split_across_writes() {
    let (url, server) = serve_script(vec![
        send(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWi"),
        pause(20),
        send(b"ki\r\n5\r"),
        pause(20),
        send(b"\npedia\r\n0\r\n\r\n"),
    ]);
    let mut sink = BodyCollector::new();

    let delivered = fetch(&url, &mut sink, &TransferOptions::default()).unwrap();

    assert_eq!(delivered, 9);
    assert_eq!(sink.body, b"Wikipedia");
    assert!(sink.ended_cleanly());
    server.join().unwrap();
}

#[test]
fn request_is_serialized_once_with_host() {
    let (url, server) = serve_script(vec![send(b"HTTP/1.1 204 No Content\r\n\r\n")]);
    let mut sink = BodyCollector::new();
    fetch(&url, &mut sink, &TransferOptions::default()).unwrap();

    let request = String::from_utf8(server.join().unwrap()).unwrap();
    assert!(request.starts_with("GET /scripted HTTP/1.1\r\n"));
    let hosts = request
        .split("\r\n")
        .filter(|l| l.to_ascii_lowercase().starts_with("host:"))
        .count();
    assert_eq!(hosts, 1);
    assert!(request.ends_with("\r\n\r\n"));
}

#[test]
fn http10_body_runs_until_close() {
    let (url, server) = serve_script(vec![
        send(b"HTTP/1.0 200 OK\r\n\r\nfirst "),
        pause(20),
        send(b"second"),
    ]);
    let mut sink = BodyCollector::new();

    fetch(&url, &mut sink, &TransferOptions::default()).unwrap();

    assert_eq!(sink.body, b"first second");
    assert!(sink.ended_cleanly());
    server.join().unwrap();
}

#[test]
fn connection_close_body_runs_until_close() {
    let (url, server) = serve_script(vec![send(
        b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nbody until eof",
    )]);
    let mut sink = BodyCollector::new();

    fetch(&url, &mut sink, &TransferOptions::default()).unwrap();

    assert_eq!(sink.body, b"body until eof");
    server.join().unwrap();
}

#[test]
fn truncated_fixed_body_is_an_error_frame() {
    let (url, server) = serve_script(vec![send(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nabc")]);
    let mut sink = BodyCollector::new();

    let err = fetch(&url, &mut sink, &TransferOptions::default()).unwrap_err();

    assert!(matches!(err, TransferError::Parse(ParseError::TruncatedBody)), "{err:?}");
    assert_eq!(sink.body, b"abc");
    assert_eq!(sink.terminal, Some(BodyFrame::Error(ParseError::TruncatedBody)));
    assert_eq!(sink.terminal_count, 1);
    server.join().unwrap();
}

#[test]
fn truncated_chunked_body_is_an_error_frame() {
    let (url, server) = serve_script(vec![send(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npe",
    )]);
    let mut sink = BodyCollector::new();

    let err = fetch(&url, &mut sink, &TransferOptions::default()).unwrap_err();

    assert!(matches!(err, TransferError::Parse(ParseError::TruncatedBody)), "{err:?}");
    assert_eq!(sink.terminal_count, 1);
    server.join().unwrap();
}

#[test]
fn malformed_status_is_reported_once() {
    let (url, server) = serve_script(vec![send(b"HTTP/1.1 abc OK\r\nContent-Length: 2\r\n\r\nhi")]);
    let mut sink = BodyCollector::new();

    let err = fetch(&url, &mut sink, &TransferOptions::default()).unwrap_err();

    assert!(matches!(err, TransferError::Parse(ParseError::MalformedStatus)));
    assert_eq!(sink.chunks, 0);
    assert_eq!(sink.terminal, Some(BodyFrame::Error(ParseError::MalformedStatus)));
    assert_eq!(sink.terminal_count, 1);
    server.join().unwrap();
}

#[test]
fn bad_chunk_size_is_malformed_chunk() {
    let (url, server) = serve_script(vec![send(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nWiki\r\n0\r\n\r\n",
    )]);
    let mut sink = BodyCollector::new();

    let err = fetch(&url, &mut sink, &TransferOptions::default()).unwrap_err();

    assert!(matches!(err, TransferError::Parse(ParseError::MalformedChunk)));
    server.join().unwrap();
}

#[test]
fn keep_alive_response_without_length_is_ambiguous() {
    let (url, server) = serve_script(vec![send(b"HTTP/1.1 200 OK\r\n\r\nwho knows")]);
    let mut sink = BodyCollector::new();

    let err = fetch(&url, &mut sink, &TransferOptions::default()).unwrap_err();

    assert!(matches!(err, TransferError::Parse(ParseError::AmbiguousFraming)));
    server.join().unwrap();
}

#[test]
fn empty_reply_is_incomplete_head() {
    let (url, server) = serve_script(vec![]);
    let mut sink = BodyCollector::new();

    let err = fetch(&url, &mut sink, &TransferOptions::default()).unwrap_err();

    assert!(matches!(err, TransferError::Parse(ParseError::IncompleteHead)), "{err:?}");
    server.join().unwrap();
}

#[test]
fn interim_continue_is_skipped() {
    let (url, server) = serve_script(vec![send(
        b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    )]);
    let mut sink = BodyCollector::new();

    fetch(&url, &mut sink, &TransferOptions::default()).unwrap();

    assert_eq!(sink.body, b"ok");
    server.join().unwrap();
}

#[test]
fn stall_mid_body_times_out_and_keeps_delivered_bytes() {
    let (url, server) = serve_script(vec![
        send(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello"),
        pause(1_500),
    ]);
    let options = TransferOptions {
        total_timeout_ms: 300,
        ..TransferOptions::default()
    };
    let mut sink = BodyCollector::new();
    let started = Instant::now();

    let err = fetch(&url, &mut sink, &options).unwrap_err();

    assert!(matches!(err, TransferError::Timeout), "{err:?}");
    assert!(started.elapsed() < Duration::from_millis(1_200));
    assert_eq!(sink.body, b"hello");
    assert!(sink.terminal.is_none());
    server.join().unwrap();
}

#[test]
fn slow_sink_counts_toward_deadline() {
    let (url, server) = serve_script(vec![
        send(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nabc"),
        pause(50),
        send(b"def"),
    ]);
    let options = TransferOptions {
        total_timeout_ms: 200,
        ..TransferOptions::default()
    };
    let engine = TransferEngine::new().unwrap();
    let mut sink = |frame: &BodyFrame| {
        if let BodyFrame::Chunk(_) = frame {
            std::thread::sleep(Duration::from_millis(300));
        }
        transfer_core::SinkFlow::Continue
    };

    let err = engine.fetch(&url, &mut sink, &options).unwrap_err();

    assert!(matches!(err, TransferError::Timeout), "{err:?}");
    server.join().unwrap();
}

#[test]
fn absolute_redirect_to_second_server() {
    let (target, target_server) = serve_script(vec![send(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nlanded")]);
    let redirect = format!("HTTP/1.1 301 Moved\r\nLocation: {target}\r\nContent-Length: 7\r\n\r\nignored");
    let (url, redirect_server) = serve_script(vec![Step::Send(redirect.into_bytes())]);
    let options = TransferOptions {
        follow_redirects: true,
        ..TransferOptions::default()
    };
    let mut sink = BodyCollector::new();

    fetch(&url, &mut sink, &options).unwrap();

    assert_eq!(sink.body, b"landed");
    redirect_server.join().unwrap();
    let request = String::from_utf8(target_server.join().unwrap()).unwrap();
    let port = target.trim_start_matches("http://127.0.0.1:").trim_end_matches("/scripted");
    assert!(request.contains(&format!("Host: 127.0.0.1:{port}\r\n")));
}
