//! Origin-keyed connection cache.
//!
//! Every live transport (an HTTP/1 pool or an HTTP/2 session) is registered
//! here under a protocol tag and one or more origin names. Besides the origin
//! it was established for, a TLS connection is reachable under every subject
//! alternative name its certificate carries, including wildcard names, which
//! are matched dynamically and memoized on first hit.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::origin::{cache_key, Origin, ProtocolTag};

/// A certificate name pattern with exactly one `*` label component.
///
/// The wildcard matches one or more characters within a single label: it
/// never spans a dot, and an empty expansion is rejected. Patterns with more
/// than one `*` are invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WildcardPattern {
    prefix: String,
    suffix: String,
}

impl WildcardPattern {
    pub(crate) fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.to_ascii_lowercase();
        let star = pattern.find('*')?;
        if pattern[star + 1..].contains('*') {
            return None;
        }
        Some(Self {
            prefix: pattern[..star].to_string(),
            suffix: pattern[star + 1..].to_string(),
        })
    }

    pub(crate) fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if host.len() <= self.prefix.len() + self.suffix.len() {
            return false;
        }
        if !host.starts_with(&self.prefix) || !host.ends_with(&self.suffix) {
            return false;
        }
        let expansion = &host[self.prefix.len()..host.len() - self.suffix.len()];
        !expansion.contains('.')
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

struct Entry<H> {
    handle: H,
    origin: Origin,
    tag: ProtocolTag,
    /// Keys registered at insert time: the first origin plus literal alt
    /// names.
    static_keys: Vec<String>,
    /// Keys added by wildcard matches after the fact.
    memoized_keys: Vec<String>,
    matchers: Vec<WildcardPattern>,
    cleanup: Option<Cleanup>,
}

#[derive(Default)]
struct Inner<H> {
    keys: HashMap<String, u64>,
    entries: HashMap<u64, Entry<H>>,
    next_id: u64,
}

/// Shared cache of live transports, keyed by `"<tag>:<origin>"`.
pub(crate) struct OriginCache<H> {
    inner: Mutex<Inner<H>>,
}

impl<H> std::fmt::Debug for OriginCache<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OriginCache")
            .field("keys", &inner.keys.len())
            .field("entries", &inner.entries.len())
            .finish()
    }
}

impl<H> Default for OriginCache<H> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                keys: HashMap::new(),
                entries: HashMap::new(),
                next_id: 0,
            }),
        }
    }
}

impl<H: Clone + PartialEq> OriginCache<H> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Look up a transport for `origin` under `tag`.
    ///
    /// A static-key miss falls through to scanning the wildcard matchers of
    /// same-tag entries; a match is memoized so the scan happens once per
    /// name.
    pub(crate) fn get(&self, tag: ProtocolTag, origin: &Origin) -> Option<H> {
        let key = cache_key(tag, origin);
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.keys.get(&key) {
            return inner.entries.get(&id).map(|e| e.handle.clone());
        }

        let matched = inner.entries.iter().find_map(|(&id, entry)| {
            if entry.tag != tag || entry.origin.port() != origin.port() {
                return None;
            }
            entry
                .matchers
                .iter()
                .any(|m| m.matches(origin.host()))
                .then_some(id)
        })?;

        debug!(key, "memoizing wildcard match");
        inner.keys.insert(key.clone(), matched);
        let entry = inner.entries.get_mut(&matched)?;
        entry.memoized_keys.push(key);
        Some(entry.handle.clone())
    }

    /// Register `handle` under its first origin and every valid alt name.
    ///
    /// Literal alt names become static keys for the same tag and port;
    /// wildcard names become dynamic matchers. Invalid patterns are skipped.
    pub(crate) fn insert(
        &self,
        origin: &Origin,
        tag: ProtocolTag,
        handle: H,
        alt_names: &[String],
        cleanup: impl FnOnce() + Send + 'static,
    ) {
        let mut static_keys = vec![cache_key(tag, origin)];
        let mut matchers = Vec::new();
        for name in alt_names {
            if name.contains('*') {
                if let Some(pattern) = WildcardPattern::parse(name) {
                    matchers.push(pattern);
                } else {
                    debug!(name, "skipping invalid wildcard alt name");
                }
            } else if !name.eq_ignore_ascii_case(origin.host()) {
                static_keys.push(cache_key(tag, &origin.with_host(name)));
            }
        }

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        for key in &static_keys {
            inner.keys.insert(key.clone(), id);
        }
        inner.entries.insert(
            id,
            Entry {
                handle,
                origin: origin.clone(),
                tag,
                static_keys,
                memoized_keys: Vec::new(),
                matchers,
                cleanup: Some(Box::new(cleanup)),
            },
        );
    }

    /// Remove the entry holding `handle` and every key pointing at it.
    ///
    /// Does not run the entry's cleanup; the caller owns the teardown when it
    /// removes by handle. Returns false when no entry matches (idempotent).
    pub(crate) fn remove(&self, handle: &H) -> bool {
        let mut inner = self.inner.lock();
        let Some(id) = inner
            .entries
            .iter()
            .find_map(|(&id, e)| (e.handle == *handle).then_some(id))
        else {
            return false;
        };
        let entry = match inner.entries.remove(&id) {
            Some(entry) => entry,
            None => return false,
        };
        for key in entry.static_keys.iter().chain(&entry.memoized_keys) {
            inner.keys.remove(key);
        }
        true
    }

    /// Tear down everything reachable for `origin`, under every tag.
    pub(crate) fn disconnect(&self, origin: &Origin) {
        let mut cleanups = Vec::new();
        {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = [
                ProtocolTag::Http1,
                ProtocolTag::Http2,
                ProtocolTag::Https1,
                ProtocolTag::Https2,
            ]
            .into_iter()
            .filter_map(|tag| {
                let key = cache_key(tag, origin);
                if let Some(&id) = inner.keys.get(&key) {
                    return Some(id);
                }
                inner.entries.iter().find_map(|(&id, entry)| {
                    (entry.tag == tag
                        && entry.origin.port() == origin.port()
                        && entry.matchers.iter().any(|m| m.matches(origin.host())))
                    .then_some(id)
                })
            })
            .collect();

            for id in ids {
                if let Some(mut entry) = inner.entries.remove(&id) {
                    for key in entry.static_keys.iter().chain(&entry.memoized_keys) {
                        inner.keys.remove(key);
                    }
                    cleanups.extend(entry.cleanup.take());
                }
            }
        }
        for cleanup in cleanups {
            cleanup();
        }
    }

    /// Tear down every entry and clear both maps.
    pub(crate) fn disconnect_all(&self) {
        let entries: Vec<Entry<H>> = {
            let mut inner = self.inner.lock();
            inner.keys.clear();
            inner.entries.drain().map(|(_, e)| e).collect()
        };
        for mut entry in entries {
            if let Some(cleanup) = entry.cleanup.take() {
                cleanup();
            }
        }
    }

    /// Number of live cache entries.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
