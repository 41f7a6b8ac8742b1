//! Worker loop: drains the Handler Queue and the Continue Queue, performs
//! the HTTP round trip for each operation, and drives the redirect/verb
//! probe protocol described by [`crate::operation::RedirectAction`].
//!
//! The original spreads this across a fixed pool of OS threads, each
//! multiplexing many concurrent curl easy handles inside one curl multi
//! handle. Here concurrency instead comes from the worker *pool* size
//! (one tokio task per `CurlWorker` equivalent, each handling one
//! operation at a time); the fan-out is the same, the multiplexing
//! mechanism differs because the reactor already multiplexes the actual
//! sockets underneath each task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Method;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use crate::callout::{CalloutOutcome, HeaderPair};
use crate::error::{self, Error, ErrorKind};
use crate::header::HeaderParser;
use crate::operation::{
    HttpVerb, OpError, OperationCore, OperationOutcome, PendingOperation, QueuedOp, RedirectAction,
    RequestBody, StreamingOutcome,
};
use crate::runtime::Runtime;
use crate::verbcache::AllowedVerbs;

/// One entry in the fixed worker pool spawned by [`Runtime::start`].
pub struct Worker {
    id: usize,
    runtime: Arc<Runtime>,
}

impl Worker {
    pub fn new(id: usize, runtime: Arc<Runtime>) -> Self {
        Self { id, runtime }
    }

    pub async fn run(self) {
        let mut last_maintenance = Instant::now();

        loop {
            match self.runtime.queue.consume(Duration::from_secs(1)).await {
                Some(queued) => self.handle(queued).await,
                None => {
                    if self.runtime.queue.is_shutdown() {
                        break;
                    }
                }
            }

            if last_maintenance.elapsed() >= self.runtime.maintenance_period() {
                self.run_maintenance();
                last_maintenance = Instant::now();
            }

            if let Some(queued) = self.runtime.continue_queue.try_consume().await {
                self.handle(queued).await;
            }
        }

        tracing::debug!(worker_id = self.id, "worker exiting");
    }

    /// Placeholder for the original's per-tick `Expire()` sweep over
    /// in-flight handles. Stall/timeout expiry for an operation already
    /// in flight is enforced inline by the per-attempt timeout computed
    /// from `OperationCore::operation_expiry`; this hook exists for
    /// future queue-wide sweeps (e.g. expiring paused continuations that
    /// never resume) and is intentionally a no-op today.
    fn run_maintenance(&self) {
        tracing::trace!(worker_id = self.id, "maintenance tick");
    }

    async fn handle(&self, queued: QueuedOp) {
        match queued {
            QueuedOp::Buffered { pending, reply } => {
                let result = self.drive(pending).await;
                let _ = reply.send(result);
            }
            QueuedOp::Streaming { pending, reply } => {
                let result = self.drive_streaming(pending).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Runs the shared attempt loop (connection callout, `OPTIONS` probe,
    /// signed headers, redirect following) up through a final, non-redirect
    /// response, without reading the body. Shared by [`Worker::drive`]
    /// (which buffers the body itself) and [`Worker::drive_streaming`]
    /// (which hands the body off as a live stream).
    async fn drive_to_response(
        &self,
        pending: &mut PendingOperation,
    ) -> Result<(u16, HeaderParser, reqwest::Response), Error> {
        let verb = { pending.core.lock().await.verb() };
        self.runtime.record_started(verb);

        loop {
            let (url, needs_options) = {
                let core = pending.core.lock().await;
                (core.url.clone(), core.kind.requires_options())
            };

            if needs_options {
                let known = self.runtime.verb_cache.get(&url);
                if known.map(|v| v.is_unknown()).unwrap_or(true) {
                    self.probe_options(&url).await;
                }
            }

            let mut request_url = url.clone();
            if let Some(callout) = self.runtime.conn_callout.clone() {
                let (already_tried, expiry) = {
                    let core = pending.core.lock().await;
                    (core.tried_broker, core.operation_expiry())
                };
                if !already_tried {
                    let outcome = callout.begin(&url, expiry).await;
                    let mut core = pending.core.lock().await;
                    core.tried_broker = true;
                    match outcome {
                        CalloutOutcome::Failed(msg) => {
                            self.runtime.record_error(verb);
                            return Err(core.fail(Error::new(ErrorKind::ConnectionError, msg)));
                        }
                        CalloutOutcome::Resolved { host, port } => {
                            drop(core);
                            let _ = request_url.set_host(Some(&host));
                            let _ = request_url.set_port(Some(port));
                        }
                        CalloutOutcome::UseDefault => {}
                    }
                }
            }

            let existing: Vec<HeaderPair> = pending.request_headers.clone();
            let signed = self
                .runtime
                .header_callout
                .get_headers(verb.as_str(), &url, &existing);

            let timeout_dur = {
                let core = pending.core.lock().await;
                core.operation_expiry()
                    .saturating_duration_since(Instant::now())
            };

            let mut builder = self
                .runtime
                .client
                .request(to_method(verb), request_url.clone());
            if request_url.host_str() != url.host_str() {
                if let Some(host) = url.host_str() {
                    builder = builder.header(reqwest::header::HOST, host);
                }
            }
            for (name, value) in &signed {
                builder = builder.header(name, value);
            }
            builder = attach_body(
                builder,
                &mut pending.body,
                Arc::clone(&pending.core),
                Arc::clone(&self.runtime),
            );

            let sent = tokio::time::timeout(timeout_dur, builder.send()).await;
            let response = match sent {
                Err(_) => {
                    self.runtime.record_timeout(verb);
                    let mut core = pending.core.lock().await;
                    return Err(core.fail(Error::new(
                        ErrorKind::ReqTimedOut,
                        "no response within operation timeout",
                    )));
                }
                Ok(Err(e)) => {
                    self.runtime.record_error(verb);
                    let mut core = pending.core.lock().await;
                    let mut kind = error::from_transport(&e);
                    if matches!(core.error, OpError::TransferStall | OpError::TransferClientStall) {
                        kind = ErrorKind::TimerExpired;
                    }
                    return Err(core.fail(Error::new(kind, e.to_string())));
                }
                Ok(Ok(r)) => r,
            };

            let status = response.status().as_u16();
            let headers = parse_response_headers(&response);

            if headers.is_redirect() {
                let requires_options = {
                    let core = pending.core.lock().await;
                    core.kind.requires_options()
                };
                let verb_known_at_target = if requires_options {
                    match resolve_redirect(&url, headers.location()) {
                        Ok(target) => self
                            .runtime
                            .verb_cache
                            .get(&target)
                            .map(|v| !v.is_unknown())
                            .unwrap_or(false),
                        Err(_) => false,
                    }
                } else {
                    true
                };
                let action = {
                    let mut core = pending.core.lock().await;
                    core.headers = headers;
                    core.redirect(verb_known_at_target)
                };
                match action {
                    RedirectAction::Fail => {
                        self.runtime.record_error(verb);
                        let mut core = pending.core.lock().await;
                        return Err(core.fail(crate::operation::redirect_limit_error()));
                    }
                    RedirectAction::Reinvoke(location) => {
                        let next = resolve_redirect(&url, &location)?;
                        let mut core = pending.core.lock().await;
                        core.url = next;
                        core.headers.reset_for_redirect();
                        continue;
                    }
                    RedirectAction::ReinvokeAfterAllow(location) => {
                        let next = resolve_redirect(&url, &location)?;
                        self.probe_options(&next).await;
                        let mut core = pending.core.lock().await;
                        core.url = next;
                        core.headers.reset_for_redirect();
                        continue;
                    }
                }
            }

            if status == 206 && !headers.is_multipart_byterange() {
                let expected_start = {
                    let core = pending.core.lock().await;
                    match &core.kind {
                        crate::operation::OperationKind::Get { range_start, .. } => Some(*range_start),
                        _ => None,
                    }
                };
                if let (Some(expected), Some(actual)) = (expected_start, headers.offset()) {
                    if actual != expected as i64 {
                        self.runtime.record_error(verb);
                        let mut core = pending.core.lock().await;
                        return Err(core.fail(Error::new(
                            ErrorKind::InvalidResponse,
                            format!("206 response offset {actual} does not match requested offset {expected}"),
                        )));
                    }
                }
            }

            return Ok((status, headers, response));
        }
    }

    /// Drives one operation to completion, fully buffering the response
    /// body once it arrives.
    async fn drive(&self, mut pending: PendingOperation) -> Result<OperationOutcome, Error> {
        let verb = { pending.core.lock().await.verb() };
        let (status, headers, response) = self.drive_to_response(&mut pending).await?;

        let stall_timeout = self.runtime.stall_timeout();
        let body = match tokio::time::timeout(stall_timeout, response.bytes()).await {
            Err(_) => {
                self.runtime.record_timeout(verb);
                let mut core = pending.core.lock().await;
                return Err(core.fail(Error::new(ErrorKind::TimerExpired, "response body stalled")));
            }
            Ok(Err(e)) => {
                self.runtime.record_error(verb);
                let mut core = pending.core.lock().await;
                let kind = error::from_transport(&e);
                return Err(core.fail(Error::new(kind, e.to_string())));
            }
            Ok(Ok(b)) => b,
        };

        if !(200..300).contains(&status) {
            self.runtime.record_error(verb);
            let mut core = pending.core.lock().await;
            let kind = error::from_status(status);
            let message = headers.status_message().to_string();
            return Err(core.fail(Error::with_body(kind, message, &body)));
        }

        {
            let mut core = pending.core.lock().await;
            core.headers = headers.clone();
            core.update_bytes(body.len() as u64);
            core.mark_done();
        }
        self.runtime.record_finished(verb, body.len() as u64);

        Ok(OperationOutcome {
            status,
            headers,
            body,
        })
    }

    /// Drives a full-download `Open` to the point the response is final,
    /// then hands the body off as a live stream instead of buffering it,
    /// so `File::read` can start serving bytes as soon as they arrive.
    async fn drive_streaming(&self, mut pending: PendingOperation) -> Result<StreamingOutcome, Error> {
        let verb = { pending.core.lock().await.verb() };
        let (status, headers, response) = self.drive_to_response(&mut pending).await?;

        if !(200..300).contains(&status) {
            self.runtime.record_error(verb);
            let body = response.bytes().await.unwrap_or_default();
            let mut core = pending.core.lock().await;
            let kind = error::from_status(status);
            let message = headers.status_message().to_string();
            return Err(core.fail(Error::with_body(kind, message, &body)));
        }

        let url = { pending.core.lock().await.url.clone() };
        let (tx, body_rx) = mpsc::channel::<Bytes>(8);
        let core_handle = Arc::clone(&pending.core);
        let runtime = Arc::clone(&self.runtime);
        let mut upstream = response.bytes_stream();
        tokio::spawn(async move {
            let mut total = 0u64;
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(bytes) => {
                        total += bytes.len() as u64;
                        {
                            let mut core = core_handle.lock().await;
                            core.update_bytes(bytes.len() as u64);
                        }
                        if tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "full-download body stream ended with an error");
                        break;
                    }
                }
            }
            {
                let mut core = core_handle.lock().await;
                core.mark_done();
            }
            runtime.record_finished(verb, total);
        });

        Ok(StreamingOutcome {
            status,
            headers,
            url,
            body_rx,
        })
    }

    /// Issues an `OPTIONS` probe against `url`'s origin and records the
    /// resulting allowed verbs in the Verb Cache, marking the origin
    /// `Unknown` if the probe itself fails (mirrors `CurlOptionsOp::Fail`
    /// setting the cache entry on a 405 rather than leaving it unset).
    async fn probe_options(&self, url: &Url) {
        let sent = self
            .runtime
            .client
            .request(Method::OPTIONS, url.clone())
            .send()
            .await;

        let verbs = match sent {
            Ok(response) if response.status().is_success() => {
                let headers = parse_response_headers(&response);
                headers.allowed_verbs()
            }
            _ => AllowedVerbs::unknown(),
        };

        self.runtime.verb_cache.put(url, verbs);
    }
}

fn to_method(verb: HttpVerb) -> Method {
    match verb {
        HttpVerb::Copy => Method::from_bytes(b"COPY").expect("valid method token"),
        HttpVerb::Delete => Method::DELETE,
        HttpVerb::Get => Method::GET,
        HttpVerb::Head => Method::HEAD,
        HttpVerb::Mkcol => Method::from_bytes(b"MKCOL").expect("valid method token"),
        HttpVerb::Options => Method::OPTIONS,
        HttpVerb::Propfind => Method::from_bytes(b"PROPFIND").expect("valid method token"),
        HttpVerb::Put => Method::PUT,
    }
}

/// Attaches a request body, wrapping a streamed PUT body with stall
/// detection: if no chunk arrives within `runtime.stall_timeout()`, the
/// stream yields an error that aborts the send, and `core.error` records
/// which kind of stall it was so `drive_to_response`'s error branch can
/// surface `ErrorKind::TimerExpired` instead of a generic transport error.
fn attach_body(
    builder: reqwest::RequestBuilder,
    body: &mut RequestBody,
    core: Arc<Mutex<OperationCore>>,
    runtime: Arc<Runtime>,
) -> reqwest::RequestBuilder {
    match std::mem::replace(body, RequestBody::None) {
        RequestBody::None => builder,
        RequestBody::Buffered(bytes) => builder.body(bytes),
        RequestBody::Streamed(rx) => {
            let start = Instant::now();
            let state = (rx, core, runtime, start, 0u64);
            let stream = futures_util::stream::unfold(state, |(mut rx, core, runtime, start, mut sent)| async move {
                let stall = runtime.stall_timeout();
                match tokio::time::timeout(stall, rx.recv()).await {
                    Ok(Some(chunk)) => {
                        sent += chunk.len() as u64;
                        let elapsed = start.elapsed().as_secs_f64();
                        let mut c = core.lock().await;
                        c.update_bytes(chunk.len() as u64);
                        if elapsed > 0.0 && (sent as f64 / elapsed) < c.minimum_rate as f64 {
                            c.error = OpError::TransferSlow;
                        }
                        drop(c);
                        Some((Ok::<_, std::io::Error>(chunk), (rx, core, runtime, start, sent)))
                    }
                    Ok(None) => None,
                    Err(_) => {
                        let now = Instant::now();
                        let mut c = core.lock().await;
                        let genuinely_stalled = c.transfer_stalled(0, now);
                        tracing::debug!(
                            stalled = genuinely_stalled,
                            "PUT body stream exceeded stall timeout"
                        );
                        c.error = if c.is_paused() {
                            OpError::TransferClientStall
                        } else {
                            OpError::TransferStall
                        };
                        drop(c);
                        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "transfer stalled");
                        Some((Err(err), (rx, core, runtime, start, sent)))
                    }
                }
            });
            builder.body(reqwest::Body::wrap_stream(stream))
        }
    }
}

/// Re-parses a `reqwest::Response`'s status line and headers through
/// [`HeaderParser`], the same line-oriented contract the original fed
/// from libcurl's header callback.
fn parse_response_headers(response: &reqwest::Response) -> HeaderParser {
    let mut parser = HeaderParser::new();
    let status = response.status();
    parser.parse(&format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    ));
    for (name, value) in response.headers() {
        let value_str = value.to_str().unwrap_or("");
        parser.parse(&format!("{}: {}\r\n", name.as_str(), value_str));
    }
    parser.parse("\r\n");
    parser
}

/// Resolves a `Location` header value against the request URL it
/// redirected from, accepting both absolute and relative targets.
fn resolve_redirect(base: &Url, location: &str) -> Result<Url, Error> {
    base.join(location).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationCore, OperationKind};
    use std::time::Duration;

    #[test]
    fn to_method_maps_webdav_verbs() {
        assert_eq!(to_method(HttpVerb::Propfind).as_str(), "PROPFIND");
        assert_eq!(to_method(HttpVerb::Mkcol).as_str(), "MKCOL");
        assert_eq!(to_method(HttpVerb::Copy).as_str(), "COPY");
        assert_eq!(to_method(HttpVerb::Get), Method::GET);
    }

    #[test]
    fn resolve_redirect_handles_relative_and_absolute() {
        let base = Url::parse("https://example.com/a/b").unwrap();
        let rel = resolve_redirect(&base, "/c/d").unwrap();
        assert_eq!(rel.as_str(), "https://example.com/c/d");
        let abs = resolve_redirect(&base, "https://other.example.com/x").unwrap();
        assert_eq!(abs.as_str(), "https://other.example.com/x");
    }

    #[tokio::test]
    async fn drive_surfaces_transport_error_as_failed_core() {
        let runtime = Runtime::new(crate::runtime::RuntimeConfig::default()).unwrap();
        let worker = Worker::new(0, runtime);
        let core = OperationCore::new(
            Url::parse("https://127.0.0.1:1").unwrap(),
            OperationKind::Head,
            Duration::from_millis(200),
        );
        let pending = PendingOperation::new(core, Vec::new());
        let result = worker.drive(pending).await;
        assert!(result.is_err());
    }
}
