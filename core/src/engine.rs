//! Redirect-following entry point.

use std::collections::HashSet;
use std::sync::Arc;

use rustls::ClientConfig;
use tracing::{debug, warn};

use crate::config::TransferOptions;
use crate::error::TransferError;
use crate::http::RequestDescriptor;
use crate::sink::ByteSink;
use crate::target::TargetUrl;
use crate::tls;
use crate::transfer::{deliver_failure, Transfer, TransferContext, TransferResult};

/// Runs fetches. Holds only immutable configuration, so one engine can be
/// shared across threads.
#[derive(Clone)]
pub struct TransferEngine {
    tls: Arc<ClientConfig>,
}

impl TransferEngine {
    /// Engine using the process-wide default TLS configuration.
    pub fn new() -> Result<Self, TransferError> {
        Ok(Self::with_tls_config(tls::shared_client_config()?))
    }

    pub fn with_tls_config(tls: Arc<ClientConfig>) -> Self {
        Self { tls }
    }

    /// Fetch `url` and stream the final response body to `sink`.
    ///
    /// With `follow_redirects` set, 301/302/303/307/308 responses carrying a
    /// `Location` are followed relative to the current URL. Redirect bodies
    /// never reach the sink. At most `max_redirects` requests are issued for
    /// one chain, and revisiting a URL ends the chain early.
    pub fn fetch<S: ByteSink + ?Sized>(
        &self,
        url: &str,
        sink: &mut S,
        options: &TransferOptions,
    ) -> Result<TransferResult, TransferError> {
        let ctx = TransferContext::new(options, Arc::clone(&self.tls));
        let mut target = TargetUrl::parse(url)?;
        let mut visited = HashSet::from([target.without_fragment()]);
        let mut requests = 0u32;

        loop {
            let request = build_request(&target, options);
            requests += 1;

            let transfer = match Transfer::start(&request, &ctx) {
                Ok(transfer) => transfer,
                Err(err) => {
                    deliver_failure(sink, &err);
                    return Err(err);
                }
            };

            if options.follow_redirects && transfer.head().is_redirect() {
                if let Some(location) = transfer.head().location() {
                    if requests >= options.max_redirects {
                        warn!(requests, url = %target, "redirect limit reached");
                        return Err(TransferError::TooManyRedirects {
                            requests,
                            cycle: false,
                        });
                    }
                    let next = target.join(location)?;
                    if !visited.insert(next.without_fragment()) {
                        warn!(requests, url = %next, "redirect cycle detected");
                        return Err(TransferError::TooManyRedirects {
                            requests,
                            cycle: true,
                        });
                    }
                    debug!(
                        status = transfer.head().status,
                        from = %target,
                        to = %next,
                        "following redirect"
                    );
                    drop(transfer);
                    target = next;
                    continue;
                }
            }

            let mut result = transfer.stream_body(sink)?;
            result.redirects = requests - 1;
            return Ok(result);
        }
    }
}

/// Fetch with a default engine.
pub fn fetch<S: ByteSink + ?Sized>(
    url: &str,
    sink: &mut S,
    options: &TransferOptions,
) -> Result<TransferResult, TransferError> {
    TransferEngine::new()?.fetch(url, sink, options)
}

fn build_request(target: &TargetUrl, options: &TransferOptions) -> RequestDescriptor {
    let mut request = RequestDescriptor::get(target.clone()).header("Accept", "*/*");
    if let Some(agent) = &options.user_agent {
        request.headers.insert("User-Agent", agent.as_str());
    }
    for (name, value) in &options.headers {
        request.headers.insert(name.as_str(), value.as_str());
    }
    request
}
