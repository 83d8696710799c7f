//! Blocking HTTP/1.1 client transfer engine.
//!
//! # Overview
//! Fetches one URL over plain TCP or TLS, streams the response body to a
//! caller-supplied sink frame by frame, and returns a `TransferResult` or a
//! `TransferError`. Redirects are followed on request, up to a cap.
//!
//! # Design
//! - `writer::serialize` and `parser::ResponseParser` are sans-IO: the
//!   writer produces bytes, the parser consumes them and yields events. Both
//!   are deterministic and tested without sockets.
//! - `Connection` owns the socket; `Transfer` owns one connection and one
//!   parser for exactly one exchange. Nothing is pooled across calls.
//! - `TransferEngine` holds only an immutable TLS config, so concurrent
//!   fetches share no mutable state.
//! - Every timeout is a deadline checked before each socket operation.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod http;
pub mod parser;
pub mod sink;
pub mod target;
pub mod tls;
pub mod transfer;
pub mod writer;

pub use config::{TrailerPolicy, TransferOptions};
pub use engine::{fetch, TransferEngine};
pub use error::{ConnectError, IoError, ParseError, TransferError, UrlError};
pub use http::{BodyFrame, Headers, HttpMethod, RequestDescriptor, ResponseHead, Version};
pub use parser::{ParserEvent, ResponseParser};
pub use sink::{BodyCollector, ByteSink, SinkFlow};
pub use target::TargetUrl;
pub use transfer::{Transfer, TransferContext, TransferResult};
pub use writer::serialize;
