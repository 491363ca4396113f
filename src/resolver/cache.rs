//! TTL-bounded memoization of single-question address lookups.
//!
//! Only requests with exactly one A/AAAA/ANY question are cached; all
//! others bypass the store. Expiry is fixed at insert time from the first
//! answer's TTL, and expired entries are garbage-collected lazily via a
//! min-heap on access.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dns::packet::DnsPacket;
use crate::error::ResolveError;
use crate::resolver::{Resolver, SharedResolver};

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct CacheKey {
    qtype: u16,
    name: String,
}

#[derive(Clone)]
struct CacheEntry {
    expire: Instant,
    reply: DnsPacket,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<CacheKey, CacheEntry>,
    heap: BinaryHeap<Reverse<(Instant, CacheKey)>>,
}

/// The storage half of the cache resolver. The CN resolver owns its own
/// instance, so the store is separate from the resolver wrapper.
#[derive(Default)]
pub struct CacheStore {
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cacheable means a single address-type question.
    pub fn should_cache(req: &DnsPacket) -> bool {
        req.questions.len() == 1 && req.questions[0].qtype.is_address_query()
    }

    fn key_of(req: &DnsPacket) -> Option<CacheKey> {
        if !Self::should_cache(req) {
            return None;
        }
        let q = &req.questions[0];
        Some(CacheKey {
            qtype: q.qtype.to_u16(),
            name: q.name.to_ascii_lowercase(),
        })
    }

    /// Look up a reply. On a hit the stored reply is cloned, its ID
    /// replaced with the request's and every answer TTL rewritten to the
    /// remaining whole seconds.
    pub fn get(&self, req: &DnsPacket) -> Option<DnsPacket> {
        let key = Self::key_of(req)?;
        let now = Instant::now();

        let mut inner = self.inner.lock();

        // Lazy GC: pop overdue heap items. An overwrite may have refreshed
        // the map entry, so only drop it when it is itself expired.
        while let Some(Reverse((expire, _))) = inner.heap.peek() {
            if *expire > now {
                break;
            }
            let Reverse((_, stale_key)) = inner.heap.pop().unwrap();
            if inner.map.get(&stale_key).is_some_and(|e| e.expire <= now) {
                inner.map.remove(&stale_key);
            }
        }

        let entry = match inner.map.get(&key) {
            Some(e) if e.expire > now => e.clone(),
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        drop(inner);

        let remaining = entry.expire.duration_since(now).as_secs() as u32;
        let mut reply = entry.reply;
        reply.set_id(req.id());
        if let Err(e) = reply.set_answer_ttls(remaining) {
            warn!("cached reply TTL rewrite failed: {}", e);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "cache hit: {} {} (remaining TTL: {}s)",
            req.questions[0].name,
            req.questions[0].qtype.name(),
            remaining
        );
        Some(reply)
    }

    /// Store a reply. Empty replies and zero-TTL replies are not worth
    /// caching. The first answer's TTL decides the entry lifetime.
    pub fn set(&self, req: &DnsPacket, res: &DnsPacket) {
        let Some(key) = Self::key_of(req) else { return };
        let ttl = match res.answers.first() {
            Some(a) if a.ttl > 0 => a.ttl,
            _ => return,
        };

        let expire = Instant::now() + Duration::from_secs(ttl as u64);
        let mut inner = self.inner.lock();
        inner.map.insert(key.clone(), CacheEntry { expire, reply: res.clone() });
        inner.heap.push(Reverse((expire, key)));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

pub struct CacheResolver {
    name: String,
    child: SharedResolver,
    store: CacheStore,
}

impl CacheResolver {
    pub fn new(name: &str, child: SharedResolver) -> Self {
        Self {
            name: name.to_string(),
            child,
            store: CacheStore::new(),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }
}

#[async_trait]
impl Resolver for CacheResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, req: &DnsPacket, deadline: Instant) -> Result<DnsPacket, ResolveError> {
        if !CacheStore::should_cache(req) {
            return self.child.resolve(req, deadline).await;
        }

        if let Some(hit) = self.store.get(req) {
            return Ok(hit);
        }

        // Lock is not held while the child resolves; two concurrent misses
        // on one key may both reach the child, last store wins.
        let res = self.child.resolve(req, deadline).await?;
        self.store.set(req, &res);
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::types::RecordType;
    use crate::resolver::testutil::{query, MockResolver};
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test(start_paused = true)]
    async fn hit_counts_down_ttl_without_a_child_call() {
        let child = MockResolver::replies_with("leaf", Duration::ZERO, "1.2.3.4", 60);
        let cache = CacheResolver::new("cache", child.clone());

        let req = query("cached.example");
        let first = cache.resolve(&req, deadline()).await.unwrap();
        assert_eq!(first.answers[0].ipv4(), Some("1.2.3.4".parse().unwrap()));
        assert_eq!(first.answers[0].ttl, 60);

        tokio::time::advance(Duration::from_secs(5)).await;

        let second = cache.resolve(&req, deadline()).await.unwrap();
        assert_eq!(second.answers[0].ipv4(), Some("1.2.3.4".parse().unwrap()));
        assert_eq!(second.answers[0].ttl, 55);
        assert_eq!(child.calls(), 1);
        assert_eq!(cache.store().hits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_id_matches_each_request() {
        let child = MockResolver::replies_with("leaf", Duration::ZERO, "5.6.7.8", 120);
        let cache = CacheResolver::new("cache", child);

        let mut req = query("id.example");
        req.set_id(0x0101);
        cache.resolve(&req, deadline()).await.unwrap();

        req.set_id(0x0202);
        let hit = cache.resolve(&req, deadline()).await.unwrap();
        assert_eq!(hit.id(), 0x0202);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_goes_back_to_the_child() {
        let child = MockResolver::replies_with("leaf", Duration::ZERO, "1.2.3.4", 60);
        let cache = CacheResolver::new("cache", child.clone());

        let req = query("expiring.example");
        cache.resolve(&req, deadline()).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        cache.resolve(&req, deadline()).await.unwrap();
        assert_eq!(child.calls(), 2);
        // The lazy GC dropped the stale entry before re-inserting.
        assert_eq!(cache.store().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_address_questions_bypass_the_cache() {
        let child = MockResolver::replies_with("leaf", Duration::ZERO, "9.9.9.9", 60);
        let cache = CacheResolver::new("cache", child.clone());

        let req = DnsPacket::build_query(1, "txt.example", RecordType::TXT, true).unwrap();
        cache.resolve(&req, deadline()).await.unwrap();
        cache.resolve(&req, deadline()).await.unwrap();
        assert_eq!(child.calls(), 2);
        assert!(cache.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_and_zero_ttl_replies_are_not_cached() {
        let empty_child = MockResolver::empty_after("leaf", Duration::ZERO);
        let cache = CacheResolver::new("cache", empty_child.clone());
        let req = query("empty.example");
        cache.resolve(&req, deadline()).await.unwrap();
        cache.resolve(&req, deadline()).await.unwrap();
        assert_eq!(empty_child.calls(), 2);

        let zero_child = MockResolver::replies_with("leaf", Duration::ZERO, "1.1.1.1", 0);
        let cache = CacheResolver::new("cache", zero_child.clone());
        let req = query("zero.example");
        cache.resolve(&req, deadline()).await.unwrap();
        cache.resolve(&req, deadline()).await.unwrap();
        assert_eq!(zero_child.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn child_errors_are_propagated() {
        let child = MockResolver::fails_after("leaf", Duration::ZERO);
        let cache = CacheResolver::new("cache", child);
        let req = query("error.example");
        let res = cache.resolve(&req, deadline()).await;
        assert!(matches!(res, Err(ResolveError::NoResult)));
    }
}
