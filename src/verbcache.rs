//! Cache of which HTTP verbs an origin is known to support, learned from an
//! `OPTIONS` request's `Allow` header so later operations can skip a
//! redundant `PROPFIND`-capability probe.

use std::collections::HashMap;
use std::sync::RwLock;

use url::Url;

/// Bitset of HTTP verbs an origin has advertised via `Allow`.
///
/// `Unknown` is a sentinel distinct from "no bits set": it marks an origin
/// whose `OPTIONS` probe itself failed (e.g. 405), so we should not retry
/// the probe but also should not assume any verb beyond the baseline ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllowedVerbs {
    bits: u32,
}

const BIT_PROPFIND: u32 = 1 << 0;
const BIT_UNKNOWN: u32 = 1 << 31;

impl AllowedVerbs {
    pub fn unknown() -> Self {
        Self { bits: BIT_UNKNOWN }
    }

    pub fn insert_propfind(&mut self) {
        self.bits |= BIT_PROPFIND;
        self.bits &= !BIT_UNKNOWN;
    }

    pub fn has_propfind(&self) -> bool {
        self.bits & BIT_PROPFIND != 0
    }

    pub fn is_unknown(&self) -> bool {
        self.bits & BIT_UNKNOWN != 0
    }
}

/// Origin-scoped key: scheme, host, port, and the first path segment, since
/// some origins vary supported verbs by path prefix (e.g. a WebDAV
/// sub-mount next to a plain static-file mount).
fn url_key(url: &Url) -> String {
    let scheme = url.scheme();
    let host = url.host_str().unwrap_or("");
    let port = url.port_or_known_default().unwrap_or(0);
    let first_segment = url
        .path_segments()
        .and_then(|mut segs| segs.next())
        .unwrap_or("");
    format!("{scheme}://{host}:{port}/{first_segment}")
}

/// Process-wide cache mapping an origin key to its last-known allowed verbs.
#[derive(Debug, Default)]
pub struct VerbCache {
    entries: RwLock<HashMap<String, AllowedVerbs>>,
}

impl VerbCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &Url) -> Option<AllowedVerbs> {
        let key = url_key(url);
        self.entries.read().ok()?.get(&key).copied()
    }

    pub fn put(&self, url: &Url, verbs: AllowedVerbs) {
        let key = url_key(url);
        if let Ok(mut map) = self.entries.write() {
            map.insert(key, verbs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_key_groups_by_first_segment() {
        let a = Url::parse("https://example.com/dav/foo.txt").unwrap();
        let b = Url::parse("https://example.com/dav/bar.txt").unwrap();
        let c = Url::parse("https://example.com/static/bar.txt").unwrap();
        assert_eq!(url_key(&a), url_key(&b));
        assert_ne!(url_key(&a), url_key(&c));
    }

    #[test]
    fn cache_hit_after_put() {
        let cache = VerbCache::new();
        let url = Url::parse("https://example.com/dav/foo.txt").unwrap();
        assert!(cache.get(&url).is_none());
        let mut verbs = AllowedVerbs::default();
        verbs.insert_propfind();
        cache.put(&url, verbs);
        assert!(cache.get(&url).unwrap().has_propfind());
    }

    #[test]
    fn unknown_marker_distinct_from_default() {
        let verbs = AllowedVerbs::unknown();
        assert!(verbs.is_unknown());
        assert!(!verbs.has_propfind());
        assert_ne!(verbs, AllowedVerbs::default());
    }

    #[test]
    fn insert_propfind_clears_unknown() {
        let mut verbs = AllowedVerbs::unknown();
        verbs.insert_propfind();
        assert!(!verbs.is_unknown());
        assert!(verbs.has_propfind());
    }
}
