//! The `Operation`: one in-flight HTTP request plus the bookkeeping the
//! worker needs to drive it to completion (timing, stall detection, pause
//! state for host-paced PUT bodies, and the post-response routing decision).
//!
//! Each HTTP verb carries its own payload in [`OperationKind`]; shared
//! timing/stats/flags live on [`OperationCore`]. This mirrors a single base
//! class with per-verb overrides, but as a tagged enum plus a shared struct
//! rather than virtual dispatch, since nothing here needs open extension by
//! a downstream crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use url::Url;

use crate::error::{Error, ErrorKind};
use crate::header::HeaderParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Copy,
    Delete,
    Get,
    Head,
    Mkcol,
    Options,
    Propfind,
    Put,
}

impl HttpVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVerb::Copy => "COPY",
            HttpVerb::Delete => "DELETE",
            HttpVerb::Get => "GET",
            HttpVerb::Head => "HEAD",
            HttpVerb::Mkcol => "MKCOL",
            HttpVerb::Options => "OPTIONS",
            HttpVerb::Propfind => "PROPFIND",
            HttpVerb::Put => "PUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpError {
    None,
    HeaderTimeout,
    Callback,
    OperationTimeout,
    TransferClientStall,
    TransferStall,
    TransferSlow,
}

/// What the worker should do after inspecting a response for a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectAction {
    /// `Fail()` has already been invoked; drop the operation.
    Fail,
    /// Re-issue the request against `target` immediately.
    Reinvoke(String),
    /// Re-issue against `target` once the Verb Cache has resolved the
    /// allowed verbs for that origin (an `OPTIONS` probe is in flight).
    ReinvokeAfterAllow(String),
}

/// Per-verb payload. Shared fields (timing, headers, flags) live on
/// [`OperationCore`]; this only carries what differs between verbs.
#[derive(Debug, Clone)]
pub enum OperationKind {
    Get {
        range_start: u64,
        range_len: Option<u64>,
    },
    Put {
        content_length: Option<u64>,
        content_type: Option<String>,
    },
    Head,
    Delete,
    Mkcol,
    Propfind {
        depth: u32,
    },
    Options,
    Copy {
        destination: Url,
    },
}

impl OperationKind {
    pub fn verb(&self) -> HttpVerb {
        match self {
            OperationKind::Get { .. } => HttpVerb::Get,
            OperationKind::Put { .. } => HttpVerb::Put,
            OperationKind::Head => HttpVerb::Head,
            OperationKind::Delete => HttpVerb::Delete,
            OperationKind::Mkcol => HttpVerb::Mkcol,
            OperationKind::Propfind { .. } => HttpVerb::Propfind,
            OperationKind::Options => HttpVerb::Options,
            OperationKind::Copy { .. } => HttpVerb::Copy,
        }
    }

    /// Whether a Verb Cache `OPTIONS` probe must resolve before this
    /// operation can be sent (PROPFIND against an origin of unknown
    /// capability).
    pub fn requires_options(&self) -> bool {
        matches!(self, OperationKind::Propfind { .. })
    }
}

pub const DEFAULT_STALL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MINIMUM_RATE_BYTES_SEC: u64 = 256 * 1024;

/// Shared operation state: URL, timing deadlines, transfer stats, and the
/// atomic flags a worker and a paused host call both need to observe
/// without taking a lock.
#[derive(Debug)]
pub struct OperationCore {
    pub url: Url,
    pub kind: OperationKind,
    pub headers: HeaderParser,
    pub created_at: Instant,
    pub header_expiry: Instant,
    pub operation_expiry: Instant,
    pub stall_interval: Duration,
    pub minimum_rate: u64,
    pub last_xfer: Option<Instant>,
    pub bytes_transferred: u64,
    pub error: OpError,
    pub has_failed: AtomicBool,
    pub is_paused: AtomicBool,
    pub done: AtomicBool,
    pub tried_broker: bool,
    pub redirect_count: u32,
}

impl OperationCore {
    pub fn new(url: Url, kind: OperationKind, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            url,
            kind,
            headers: HeaderParser::new(),
            created_at: now,
            header_expiry: now + timeout,
            operation_expiry: now + timeout,
            stall_interval: DEFAULT_STALL_INTERVAL,
            minimum_rate: DEFAULT_MINIMUM_RATE_BYTES_SEC,
            last_xfer: None,
            bytes_transferred: 0,
            error: OpError::None,
            has_failed: AtomicBool::new(false),
            is_paused: AtomicBool::new(false),
            done: AtomicBool::new(false),
            tried_broker: false,
            redirect_count: 0,
        }
    }

    pub fn verb(&self) -> HttpVerb {
        self.kind.verb()
    }

    /// The deadline by which this operation must be picked up by a worker
    /// or dropped from the Handler Queue: the header deadline once no bytes
    /// have transferred yet, otherwise `last_xfer + stall_interval`.
    pub fn operation_expiry(&self) -> Instant {
        match self.last_xfer {
            None => self.header_expiry,
            Some(t) => t + self.stall_interval,
        }
    }

    pub fn update_bytes(&mut self, bytes: u64) {
        self.bytes_transferred += bytes;
        self.last_xfer = Some(Instant::now());
    }

    pub fn header_timeout_expired(&self, now: Instant) -> bool {
        self.headers.status_code() == 0 && now > self.header_expiry
    }

    pub fn transfer_stalled(&self, xfer_bytes: u64, now: Instant) -> bool {
        if xfer_bytes > 0 {
            return false;
        }
        match self.last_xfer {
            Some(t) => now.duration_since(t) > self.stall_interval,
            None => now.duration_since(self.created_at) > self.stall_interval,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn has_failed(&self) -> bool {
        self.has_failed.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.is_paused.store(paused, Ordering::Release);
    }

    pub fn is_redirect(&self) -> bool {
        self.headers.is_redirect()
    }

    /// Marks the operation failed and records the error kind/message. Once
    /// failed, an operation is never retried in place; the caller (worker
    /// or file state machine) is responsible for surfacing the error to the
    /// host.
    pub fn fail(&mut self, err: Error) -> Error {
        self.has_failed.store(true, Ordering::Release);
        self.mark_done();
        err
    }

    /// Decide what to do given a parsed response that turned out to be a
    /// redirect (300-399 status with a `Location` header).
    pub fn redirect(&mut self, verb_known_at_origin: bool) -> RedirectAction {
        if !self.headers.is_redirect() {
            return RedirectAction::Fail;
        }
        let location = self.headers.location().to_string();
        if location.is_empty() {
            return RedirectAction::Fail;
        }
        self.redirect_count += 1;
        if self.redirect_count > MAX_REDIRECTS {
            return RedirectAction::Fail;
        }
        if self.kind.requires_options() && !verb_known_at_origin {
            RedirectAction::ReinvokeAfterAllow(location)
        } else {
            RedirectAction::Reinvoke(location)
        }
    }
}

pub const MAX_REDIRECTS: u32 = 10;

pub fn redirect_limit_error() -> Error {
    Error::new(ErrorKind::RedirectLimit, "too many redirects")
}

/// Body a worker should attach to an outgoing request: either fully
/// buffered up front, or fed incrementally by a serialized write queue
/// (the host's sequential `Write()` calls land here one chunk at a time).
pub enum RequestBody {
    None,
    Buffered(Bytes),
    Streamed(mpsc::Receiver<Bytes>),
}

/// Everything a worker needs to perform one HTTP request: the shared
/// [`OperationCore`] (for timing/flags/redirect bookkeeping), the headers
/// the caller wants attached before any [`crate::callout::HeaderCallout`]
/// runs, and the request body.
pub struct PendingOperation {
    pub core: Arc<Mutex<OperationCore>>,
    pub request_headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl PendingOperation {
    pub fn new(core: OperationCore, request_headers: Vec<(String, String)>) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            request_headers,
            body: RequestBody::None,
        }
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }
}

/// The result a worker hands back once an operation reaches a terminal
/// state (success, failure, or redirect exhaustion).
pub struct OperationOutcome {
    pub status: u16,
    pub headers: HeaderParser,
    pub body: Bytes,
}

/// The result a worker hands back for a streamed Open: the response is
/// final (status/headers resolved, redirects exhausted) but the body is
/// still arriving on `body_rx` rather than fully buffered.
pub struct StreamingOutcome {
    pub status: u16,
    pub headers: HeaderParser,
    pub url: Url,
    pub body_rx: mpsc::Receiver<Bytes>,
}

/// One entry in the Handler Queue: a request to perform, plus the
/// one-shot channel the submitter is waiting on for the result. `Streaming`
/// is used by a full-download `Open`, which wants to start serving `Read`s
/// as soon as headers resolve rather than waiting for the whole body.
pub enum QueuedOp {
    Buffered {
        pending: PendingOperation,
        reply: oneshot::Sender<Result<OperationOutcome, Error>>,
    },
    Streaming {
        pending: PendingOperation,
        reply: oneshot::Sender<Result<StreamingOutcome, Error>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(kind: OperationKind) -> OperationCore {
        OperationCore::new(
            Url::parse("https://example.com/foo").unwrap(),
            kind,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn verb_matches_kind() {
        let c = core(OperationKind::Get {
            range_start: 0,
            range_len: None,
        });
        assert_eq!(c.verb(), HttpVerb::Get);
    }

    #[test]
    fn propfind_requires_options() {
        let c = core(OperationKind::Propfind { depth: 1 });
        assert!(c.kind.requires_options());
        let g = core(OperationKind::Get {
            range_start: 0,
            range_len: None,
        });
        assert!(!g.kind.requires_options());
    }

    #[test]
    fn fail_sets_flags() {
        let mut c = core(OperationKind::Head);
        assert!(!c.has_failed());
        c.fail(Error::new(ErrorKind::NotFound, "missing"));
        assert!(c.has_failed());
        assert!(c.is_done());
    }

    #[test]
    fn transfer_stalled_without_bytes() {
        let mut c = core(OperationKind::Head);
        c.stall_interval = Duration::from_millis(1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(c.transfer_stalled(0, Instant::now()));
        assert!(!c.transfer_stalled(10, Instant::now()));
    }

    #[test]
    fn redirect_without_location_fails() {
        let mut c = core(OperationKind::Get {
            range_start: 0,
            range_len: None,
        });
        c.headers.parse("HTTP/1.1 302 Found\r\n");
        assert_eq!(c.redirect(true), RedirectAction::Fail);
    }
}
