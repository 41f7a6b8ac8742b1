//! Pluggable extension points: a connection broker (`ConnectionCallout`)
//! and a request signer/header injector (`HeaderCallout`).
//!
//! The original plugin discovers these by reading a hex-encoded function
//! pointer out of the host's property map. Here they are ordinary
//! capability objects (`Arc<dyn Trait>`) supplied to [`crate::file::File`]
//! and [`crate::filesystem::Filesystem`] at construction time; the
//! property-map keys are retained as inert strings on the wire-compat
//! property surface, not used to look anything up.

use std::time::Instant;

use url::Url;

/// A single `(name, value)` header pair, matching the original's
/// `HeaderList` shape.
pub type HeaderPair = (String, String);

/// Result of attempting to broker a connection out-of-band (e.g. via a
/// third-party socket-signing service) instead of letting the transport
/// dial the origin directly.
pub enum CalloutOutcome {
    /// No callout needed; use the default connection path.
    UseDefault,
    /// A socket is ready to use; returning a descriptor is not meaningful
    /// in the Rust transport (reqwest owns its own connector), so this
    /// variant instead carries a resolved connect target override.
    Resolved { host: String, port: u16 },
    Failed(String),
}

/// Supplies an out-of-band connection for a request instead of the
/// default resolver/dialer.
///
/// The original splits this into `BeginCallout` (kick off the external
/// request, hand back a pollable descriptor) and `FinishCallout` (called
/// once that descriptor is readable, returning the connected socket).
/// That split exists to let a synchronous event loop multiplex the wait
/// alongside its other fds; here the wait collapses into the single
/// `.await` point below, so one async call covers both steps. The worker
/// calls this at most once per operation, before the first send attempt,
/// tracked via `OperationCore::tried_broker` so a redirect that re-enters
/// the send loop doesn't consult the broker a second time.
#[async_trait::async_trait]
pub trait ConnectionCallout: Send + Sync {
    async fn begin(&self, url: &Url, expiration: Instant) -> CalloutOutcome;
}

/// Supplies or rewrites request headers before a request is sent, the seam
/// an S3 request signer plugs into (see [`crate::signature`]).
pub trait HeaderCallout: Send + Sync {
    fn get_headers(&self, verb: &str, url: &Url, existing: &[HeaderPair]) -> Vec<HeaderPair>;
}

/// A `HeaderCallout` that adds nothing, used when no signer/injector is
/// configured.
pub struct NoopHeaderCallout;

impl HeaderCallout for NoopHeaderCallout {
    fn get_headers(&self, _verb: &str, _url: &Url, existing: &[HeaderPair]) -> Vec<HeaderPair> {
        existing.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_callout_passes_through() {
        let callout = NoopHeaderCallout;
        let url = Url::parse("https://example.com/x").unwrap();
        let existing = vec![("X-Foo".to_string(), "bar".to_string())];
        let out = callout.get_headers("GET", &url, &existing);
        assert_eq!(out, existing);
    }
}
