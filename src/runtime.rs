//! Process-wide runtime: builds the shared `reqwest::Client`, owns the
//! Handler Queue and Verb Cache, and spawns/shuts down the fixed worker
//! pool. One [`Runtime`] is created per process and handed to every
//! [`crate::file::File`]/[`crate::filesystem::Filesystem`] constructed
//! after it.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::callout::{ConnectionCallout, HeaderCallout, NoopHeaderCallout};
use crate::error::{Error, ErrorKind};
use crate::operation::{
    HttpVerb, OperationCore, OperationOutcome, PendingOperation, QueuedOp, StreamingOutcome,
};
use crate::queue::HandlerQueue;
use crate::verbcache::VerbCache;
use crate::worker::Worker;

const DEFAULT_WORKER_COUNT: usize = 8;
const DEFAULT_MAX_PENDING_OPS: usize = 20;
const DEFAULT_MAINTENANCE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunable process-wide settings, with an `try_from_env` fallback mirroring
/// the teacher's `Credentials`/`Region` environment-variable loading.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_count: usize,
    pub max_pending_ops: usize,
    pub maintenance_period: Duration,
    pub header_timeout: Duration,
    pub stall_timeout: Duration,
    pub minimum_rate_bytes_sec: u64,
    pub allow_insecure_tls: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            max_pending_ops: DEFAULT_MAX_PENDING_OPS,
            maintenance_period: DEFAULT_MAINTENANCE_PERIOD,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            stall_timeout: crate::operation::DEFAULT_STALL_INTERVAL,
            minimum_rate_bytes_sec: crate::operation::DEFAULT_MINIMUM_RATE_BYTES_SEC,
            allow_insecure_tls: false,
        }
    }
}

impl RuntimeConfig {
    /// Loads overrides from the environment, falling back to defaults for
    /// anything unset or unparseable. Mirrors the teacher's
    /// `S3_DANGER_ALLOW_INSECURE` env-gated TLS relaxation.
    pub fn try_from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("HTTPFS_WORKER_COUNT") {
            if let Ok(n) = v.parse() {
                cfg.worker_count = n;
            }
        }
        if let Ok(v) = env::var("HTTPFS_MAX_PENDING_OPS") {
            if let Ok(n) = v.parse() {
                cfg.max_pending_ops = n;
            }
        }
        if let Ok(v) = env::var("HTTPFS_STALL_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                cfg.stall_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(v) = env::var("HTTPFS_MINIMUM_RATE_BYTES_SEC") {
            if let Ok(n) = v.parse() {
                cfg.minimum_rate_bytes_sec = n;
            }
        }
        if env::var("HTTPFS_DANGER_ALLOW_INSECURE").as_deref() == Ok("true") {
            cfg.allow_insecure_tls = true;
        }
        cfg
    }

    /// The effective header-receipt timeout for an operation, given the
    /// caller's requested operation timeout (mirrors
    /// `Factory::GetHeaderTimeoutWithDefault`: never let the header timeout
    /// exceed the whole-operation timeout).
    pub fn header_timeout_with_default(&self, operation_timeout: Option<Duration>) -> Duration {
        match operation_timeout {
            Some(t) if t < self.header_timeout => t,
            _ => self.header_timeout,
        }
    }
}

#[derive(Default)]
struct VerbStats {
    started: AtomicU64,
    finished: AtomicU64,
    error: AtomicU64,
    timeout: AtomicU64,
    bytes: AtomicU64,
}

impl VerbStats {
    fn to_json(&self) -> String {
        format!(
            "{{\"started\":{},\"finished\":{},\"error\":{},\"timeout\":{},\"bytes\":{}}}",
            self.started.load(Ordering::Relaxed),
            self.finished.load(Ordering::Relaxed),
            self.error.load(Ordering::Relaxed),
            self.timeout.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

/// Per-verb request counters, the Rust-side counterpart of the original's
/// `CurlWorker::OpStats`. Status-bucket granularity collapses into just
/// `finished`/`error`/`timeout`, since the closed `ErrorKind` set already
/// buckets failure causes more precisely than an HTTP status bucket would.
#[derive(Default)]
struct OpStats {
    copy: VerbStats,
    delete: VerbStats,
    get: VerbStats,
    head: VerbStats,
    mkcol: VerbStats,
    options: VerbStats,
    propfind: VerbStats,
    put: VerbStats,
}

impl OpStats {
    fn for_verb(&self, verb: HttpVerb) -> &VerbStats {
        match verb {
            HttpVerb::Copy => &self.copy,
            HttpVerb::Delete => &self.delete,
            HttpVerb::Get => &self.get,
            HttpVerb::Head => &self.head,
            HttpVerb::Mkcol => &self.mkcol,
            HttpVerb::Options => &self.options,
            HttpVerb::Propfind => &self.propfind,
            HttpVerb::Put => &self.put,
        }
    }

    fn to_json(&self) -> String {
        format!(
            "{{\"COPY\":{},\"DELETE\":{},\"GET\":{},\"HEAD\":{},\"MKCOL\":{},\"OPTIONS\":{},\"PROPFIND\":{},\"PUT\":{}}}",
            self.copy.to_json(),
            self.delete.to_json(),
            self.get.to_json(),
            self.head.to_json(),
            self.mkcol.to_json(),
            self.options.to_json(),
            self.propfind.to_json(),
            self.put.to_json(),
        )
    }
}

/// The shared process runtime: client, queues, worker pool.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub client: reqwest::Client,
    pub queue: Arc<HandlerQueue<QueuedOp>>,
    pub continue_queue: Arc<HandlerQueue<QueuedOp>>,
    pub verb_cache: Arc<VerbCache>,
    pub header_callout: Arc<dyn HeaderCallout>,
    pub conn_callout: Option<Arc<dyn ConnectionCallout>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    op_stats: OpStats,
    /// Process-wide override for `config.maintenance_period`, set via
    /// `File::set_property("XrdClCurlMaintenancePeriod", ...)`. Zero means
    /// unset. Mirrors `CurlWorker::SetMaintenancePeriod` being a static
    /// setter in the original rather than a per-file knob.
    maintenance_period_override: AtomicU64,
    /// Process-wide override for `config.stall_timeout`, set via
    /// `File::set_property("XrdClCurlStallTimeout", ...)`. Zero means
    /// unset. Mirrors `CurlOperation::SetStallTimeout`.
    stall_timeout_override: AtomicU64,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>, Error> {
        Self::with_callouts(config, Arc::new(NoopHeaderCallout), None)
    }

    pub fn with_callouts(
        config: RuntimeConfig,
        header_callout: Arc<dyn HeaderCallout>,
        conn_callout: Option<Arc<dyn ConnectionCallout>>,
    ) -> Result<Arc<Self>, Error> {
        let mut builder = reqwest::Client::builder()
            .brotli(true)
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(600))
            .redirect(reqwest::redirect::Policy::none());
        if config.allow_insecure_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| Error::new(ErrorKind::InternalError, e.to_string()))?;

        let queue = HandlerQueue::new(config.max_pending_ops);
        let continue_queue = HandlerQueue::new(config.max_pending_ops);
        let verb_cache = Arc::new(VerbCache::new());

        Ok(Arc::new(Self {
            config,
            client,
            queue,
            continue_queue,
            verb_cache,
            header_callout,
            conn_callout,
            workers: tokio::sync::Mutex::new(Vec::new()),
            op_stats: OpStats::default(),
            maintenance_period_override: AtomicU64::new(0),
            stall_timeout_override: AtomicU64::new(0),
        }))
    }

    /// Effective maintenance period: the process-wide override set via
    /// `XrdClCurlMaintenancePeriod`, if any, else `config.maintenance_period`.
    pub fn maintenance_period(&self) -> Duration {
        let secs = self.maintenance_period_override.load(Ordering::Relaxed);
        if secs > 0 {
            Duration::from_secs(secs)
        } else {
            self.config.maintenance_period
        }
    }

    pub fn set_maintenance_period(&self, period: Duration) {
        self.maintenance_period_override
            .store(period.as_secs().max(1), Ordering::Relaxed);
    }

    /// Effective stall timeout: the process-wide override set via
    /// `XrdClCurlStallTimeout`, if any, else `config.stall_timeout`.
    pub fn stall_timeout(&self) -> Duration {
        let millis = self.stall_timeout_override.load(Ordering::Relaxed);
        if millis > 0 {
            Duration::from_millis(millis)
        } else {
            self.config.stall_timeout
        }
    }

    pub fn set_stall_timeout(&self, timeout: Duration) {
        self.stall_timeout_override
            .store(timeout.as_millis().max(1) as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_started(&self, verb: HttpVerb) {
        self.op_stats.for_verb(verb).started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finished(&self, verb: HttpVerb, bytes: u64) {
        let stats = self.op_stats.for_verb(verb);
        stats.finished.fetch_add(1, Ordering::Relaxed);
        stats.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, verb: HttpVerb) {
        self.op_stats.for_verb(verb).error.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self, verb: HttpVerb) {
        self.op_stats.for_verb(verb).timeout.fetch_add(1, Ordering::Relaxed);
    }

    /// Spawns the fixed worker pool. Idempotent only in the sense that
    /// calling it twice spawns a second pool sharing the same queues; the
    /// host is expected to call this once per process.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        for id in 0..self.config.worker_count {
            let worker = Worker::new(id, Arc::clone(self));
            workers.push(tokio::spawn(worker.run()));
        }
    }

    /// Signals all workers to stop after their current operation and waits
    /// for them to exit.
    pub async fn shutdown(&self) {
        self.queue.shutdown();
        self.continue_queue.shutdown();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }

    /// Queue-level counts plus per-verb started/finished/error/timeout/bytes
    /// counters, the JSON counterpart of the original's `GetMonitoringJson`.
    pub fn metrics_json(&self) -> String {
        format!(
            "{{\"queue\":{},\"verbs\":{}}}",
            self.queue.monitoring_json(),
            self.op_stats.to_json()
        )
    }

    /// Enqueues an already-built operation and returns the shared core
    /// handle (so the caller can read back the post-redirect URL and
    /// flags) plus the one-shot receiver for its result, without waiting
    /// on it — callers feeding a streamed PUT body need to keep writing
    /// chunks while the request is in flight.
    pub async fn enqueue(
        &self,
        pending: PendingOperation,
    ) -> Result<
        (
            Arc<tokio::sync::Mutex<OperationCore>>,
            oneshot::Receiver<Result<OperationOutcome, Error>>,
        ),
        Error,
    > {
        let expiry = { pending.core.lock().await.operation_expiry() };
        let core_handle = Arc::clone(&pending.core);
        let (tx, rx) = oneshot::channel();
        self.queue
            .produce(QueuedOp::Buffered { pending, reply: tx }, expiry)
            .await?;
        Ok((core_handle, rx))
    }

    /// Enqueues an operation and waits for its result, for request shapes
    /// that don't need a streamed body (everything but PUT).
    pub async fn submit(
        &self,
        pending: PendingOperation,
    ) -> Result<(Arc<tokio::sync::Mutex<OperationCore>>, OperationOutcome), Error> {
        let (core, rx) = self.enqueue(pending).await?;
        let outcome = rx
            .await
            .map_err(|_| Error::new(ErrorKind::InternalError, "worker dropped reply channel"))??;
        Ok((core, outcome))
    }

    /// Enqueues an operation whose body should be handed back as a live
    /// byte stream rather than fully buffered, used by a full-download
    /// `Open` so `Read` can start serving bytes as soon as headers resolve.
    pub async fn submit_streaming(
        &self,
        pending: PendingOperation,
    ) -> Result<(Arc<tokio::sync::Mutex<OperationCore>>, StreamingOutcome), Error> {
        let expiry = { pending.core.lock().await.operation_expiry() };
        let core_handle = Arc::clone(&pending.core);
        let (tx, rx) = oneshot::channel();
        self.queue
            .produce(QueuedOp::Streaming { pending, reply: tx }, expiry)
            .await?;
        let outcome = rx
            .await
            .map_err(|_| Error::new(ErrorKind::InternalError, "worker dropped reply channel"))??;
        Ok((core_handle, outcome))
    }
}
