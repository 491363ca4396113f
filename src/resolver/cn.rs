//! Censorship-aware selection between a China-trusted and an abroad
//! group of children.
//!
//! Both groups are queried in parallel. Every reply is classified by the
//! answering group and by where its first IPv4 answer geolocates; the
//! candidate with the best (server, result) rank wins. A reply carrying a
//! blackhole-listed address eliminates that child and flags the whole
//! request, which stops us from waiting on the rest of its group.
//! Children keep running on their own timeout after the client has been
//! answered so that late, better replies still land in the cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::cn_ip::{self, BlackIpSet};
use crate::dns::packet::DnsPacket;
use crate::dns::types::RecordType;
use crate::error::ResolveError;
use crate::resolver::cache::CacheStore;
use crate::resolver::{Resolver, SharedResolver};

// server class
const S_CN: u32 = 1 << 4;
const S_AB: u32 = 2 << 4;
// result class
const R_CN: u32 = 1;
const R_AB: u32 = 2;
const R_OT: u32 = 3;

/// Lower is better. Unknown combinations never win.
fn rank(class: u32) -> u32 {
    match (class & 0xF0, class & 0x0F) {
        (S_CN, R_CN) => 1,
        (S_AB, R_CN) => 2,
        (S_AB, R_AB) => 3,
        (S_CN, R_AB) => 4,
        (S_AB, R_OT) => 5,
        (S_CN, R_OT) => 6,
        _ => u32::MAX,
    }
}

enum Slot {
    Pending,
    Ready(DnsPacket),
    Failed(ResolveError),
}

struct CnState {
    slots: Vec<Slot>,
    gfw_hit: bool,
    timed_out: bool,
    /// Index of the reply handed to the client, once chosen.
    answered: Option<usize>,
    /// Index of the reply last written to the cache.
    cached: Option<usize>,
}

/// Per-request shared context: child slots plus the decision state,
/// everything under one lock. The update pass runs entirely under it.
struct CnContext {
    req: DnsPacket,
    cn_len: usize,
    child_names: Vec<String>,
    black: Arc<BlackIpSet>,
    cache: Arc<CacheStore>,
    state: Mutex<CnState>,
    answer: Notify,
}

impl CnContext {
    /// Re-rank all completed children and decide whether to answer now.
    /// Called with the state lock held, each time a child completes and
    /// once more if the timeout fires.
    fn update(&self, state: &mut CnState) {
        let n = state.slots.len();

        // Classify completed children. A blackhole hit turns the slot
        // into a failure and flags the context.
        let mut class: Vec<Option<u32>> = vec![None; n];
        for idx in 0..n {
            let Slot::Ready(msg) = &state.slots[idx] else { continue };

            let mut res_class = R_OT;
            let mut polluted = false;
            for ans in &msg.answers {
                if !matches!(ans.rtype, RecordType::A | RecordType::ANY) {
                    continue;
                }
                let Some(ip) = ans.ipv4() else { continue };
                if self.black.contains_v4(ip) {
                    debug!("gfw hit by [name:{}][ip:{}]", self.child_names[idx], ip);
                    polluted = true;
                    break;
                }
                // The first IPv4 answer decides the result class.
                if res_class == R_OT {
                    res_class = if cn_ip::is_cn_ipv4(ip) { R_CN } else { R_AB };
                }
            }

            if polluted {
                state.slots[idx] = Slot::Failed(ResolveError::MaybePolluted);
                state.gfw_hit = true;
                continue;
            }

            let server = if idx < self.cn_len { S_CN } else { S_AB };
            class[idx] = Some(server | res_class);
        }

        // Current winner: lowest rank, ties broken by child index.
        let mut winner: Option<(usize, u32)> = None;
        for (idx, cls) in class.iter().enumerate() {
            let Some(cls) = *cls else { continue };
            if winner.map_or(true, |(_, best)| rank(cls) < rank(best)) {
                winner = Some((idx, cls));
            }
        }
        let Some((win_idx, win_cls)) = winner else {
            return; // no candidates, nothing to do
        };

        // Keep the cache on the best reply seen so far, also after the
        // client was answered.
        if state.cached != Some(win_idx) {
            if let Slot::Ready(msg) = &state.slots[win_idx] {
                self.cache.set(&self.req, msg);
            }
            state.cached = Some(win_idx);
        }

        // Should we keep waiting for a group? Only while it has pending
        // children and no success yet.
        let need_more = |slots: &[Slot], range: std::ops::Range<usize>| {
            let mut pending = false;
            for slot in &slots[range] {
                match slot {
                    Slot::Ready(_) => return false,
                    Slot::Pending => pending = true,
                    Slot::Failed(_) => {}
                }
            }
            pending
        };
        let need_cn = need_more(&state.slots, 0..self.cn_len);
        let need_ab = need_more(&state.slots, self.cn_len..n);

        let cn_hit = win_cls & 0x0F == R_CN;
        let no_need_more = (state.gfw_hit || !need_cn) && !need_ab;
        let should_answer =
            state.answered.is_none() && (cn_hit || no_need_more || state.timed_out);
        if should_answer {
            state.answered = Some(win_idx);
            self.answer.notify_one();
        }

        debug!(
            "[win:{}][win_cls:{:#x}] [cn_hit:{}][no_need_more:{}][timeout:{}][should_ans:{}]",
            self.child_names[win_idx], win_cls, cn_hit, no_need_more, state.timed_out, should_answer
        );
    }
}

pub struct CnResolver {
    name: String,
    cn_list: Vec<SharedResolver>,
    ab_list: Vec<SharedResolver>,
    timeout: Duration,
    max_ttl: u32,
    black: Arc<BlackIpSet>,
    cache: Arc<CacheStore>,
}

impl CnResolver {
    pub fn new(
        name: &str,
        cn_list: Vec<SharedResolver>,
        ab_list: Vec<SharedResolver>,
        timeout: Duration,
        max_ttl: u32,
        black: Arc<BlackIpSet>,
    ) -> Self {
        Self {
            name: name.to_string(),
            cn_list,
            ab_list,
            timeout,
            max_ttl,
            black,
            cache: Arc::new(CacheStore::new()),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    fn clamp(&self, reply: &mut DnsPacket) -> Result<(), ResolveError> {
        reply
            .clamp_answer_ttls(self.max_ttl)
            .map_err(|e| ResolveError::Pack(e.to_string()))
    }
}

#[async_trait]
impl Resolver for CnResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, req: &DnsPacket, deadline: Instant) -> Result<DnsPacket, ResolveError> {
        if CacheStore::should_cache(req) {
            if let Some(mut hit) = self.cache.get(req) {
                self.clamp(&mut hit)?;
                return Ok(hit);
            }
        }

        let n = self.cn_list.len() + self.ab_list.len();
        let children: Vec<SharedResolver> =
            self.cn_list.iter().chain(self.ab_list.iter()).cloned().collect();

        let ctx = Arc::new(CnContext {
            req: req.clone(),
            cn_len: self.cn_list.len(),
            child_names: children.iter().map(|c| c.name().to_string()).collect(),
            black: self.black.clone(),
            cache: self.cache.clone(),
            state: Mutex::new(CnState {
                slots: (0..n).map(|_| Slot::Pending).collect(),
                gfw_hit: false,
                timed_out: false,
                answered: None,
                cached: None,
            }),
            answer: Notify::new(),
        });

        // Children run against the full configured timeout, not the
        // caller's remaining deadline, so stragglers can still refresh
        // the cache after we have answered.
        let child_deadline = Instant::now() + self.timeout;
        for (idx, child) in children.into_iter().enumerate() {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let result = child.resolve(&ctx.req, child_deadline).await;
                let mut state = ctx.state.lock();
                state.slots[idx] = match result {
                    Ok(reply) => Slot::Ready(reply),
                    Err(e) => Slot::Failed(e),
                };
                ctx.update(&mut state);
            });
        }

        // Wait for a decision, bounded by both the caller's deadline and
        // our own timeout. The timer forces a decision over whatever has
        // arrived.
        let overall = deadline.min(child_deadline);
        tokio::select! {
            _ = ctx.answer.notified() => {}
            _ = tokio::time::sleep_until(overall) => {
                let mut state = ctx.state.lock();
                state.timed_out = true;
                ctx.update(&mut state);
            }
        }

        let state = ctx.state.lock();
        let reply = match state.answered {
            Some(idx) => match &state.slots[idx] {
                Slot::Ready(msg) => msg.clone(),
                _ => return Err(ResolveError::NoResult),
            },
            None => return Err(ResolveError::NoResult),
        };
        drop(state);

        let mut reply = reply;
        self.clamp(&mut reply)?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testutil::{query, MockResolver};

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    fn black(list: &[&str]) -> Arc<BlackIpSet> {
        Arc::new(BlackIpSet::from_list(
            &list.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        ))
    }

    fn cn_resolver(
        cn: Vec<SharedResolver>,
        ab: Vec<SharedResolver>,
        blackhole: &[&str],
        max_ttl: u32,
    ) -> CnResolver {
        CnResolver::new("cn", cn, ab, Duration::from_secs(2), max_ttl, black(blackhole))
    }

    #[tokio::test(start_paused = true)]
    async fn cn_server_with_cn_ip_beats_faster_abroad_reply() {
        let cn = MockResolver::replies_with("cn", Duration::from_millis(30), "114.114.114.114", 60);
        let ab = MockResolver::replies_with("ab", Duration::from_millis(10), "8.8.8.8", 60);
        let resolver = cn_resolver(vec![cn as SharedResolver], vec![ab as SharedResolver], &[], 0);

        let reply = resolver.resolve(&query("cn-pref.example"), deadline()).await.unwrap();
        assert_eq!(reply.answers[0].ipv4(), Some("114.114.114.114".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn blackhole_reply_is_eliminated_and_abroad_wins() {
        let cn = MockResolver::replies_with("cn", Duration::from_millis(10), "243.185.187.39", 60);
        let ab = MockResolver::replies_with("ab", Duration::from_millis(30), "8.8.8.8", 60);
        let resolver = cn_resolver(
            vec![cn as SharedResolver],
            vec![ab as SharedResolver],
            &["243.185.187.39"],
            0,
        );

        let start = Instant::now();
        let reply = resolver.resolve(&query("poisoned.example"), deadline()).await.unwrap();
        assert_eq!(reply.answers[0].ipv4(), Some("8.8.8.8".parse().unwrap()));
        // Answered as soon as the abroad group was done, well before the
        // 2s internal timeout.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn cn_ip_from_abroad_server_outranks_foreign_ip() {
        // The CN group stays silent past the timeout; two abroad children
        // disagree. The CN-geolocated answer must win.
        let silent = MockResolver::replies_with("silent", Duration::from_secs(60), "1.2.3.4", 60);
        let ab1 = MockResolver::replies_with("ab1", Duration::from_millis(10), "8.8.8.8", 60);
        let ab2 = MockResolver::replies_with("ab2", Duration::from_millis(20), "223.5.5.5", 60);
        let resolver = cn_resolver(
            vec![silent as SharedResolver],
            vec![ab1 as SharedResolver, ab2],
            &[],
            0,
        );

        let reply = resolver.resolve(&query("rank.example"), deadline()).await.unwrap();
        assert_eq!(reply.answers[0].ipv4(), Some("223.5.5.5".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_forces_a_decision_over_what_arrived() {
        let silent = MockResolver::replies_with("silent", Duration::from_secs(60), "1.2.3.4", 60);
        let empty = MockResolver::empty_after("empty", Duration::from_millis(10));
        let resolver =
            cn_resolver(vec![silent as SharedResolver], vec![empty as SharedResolver], &[], 0);

        let start = Instant::now();
        let reply = resolver.resolve(&query("timeout.example"), deadline()).await.unwrap();
        assert!(reply.answers.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_time_out_to_no_result() {
        let a = MockResolver::fails_after("a", Duration::from_millis(10));
        let b = MockResolver::fails_after("b", Duration::from_millis(10));
        let resolver = cn_resolver(vec![a as SharedResolver], vec![b as SharedResolver], &[], 0);

        let res = resolver.resolve(&query("dead.example"), deadline()).await;
        assert!(matches!(res, Err(ResolveError::NoResult)));
    }

    #[tokio::test(start_paused = true)]
    async fn max_ttl_clamps_fresh_and_cached_replies() {
        let cn = MockResolver::replies_with("cn", Duration::from_millis(10), "114.114.114.114", 600);
        let resolver = cn_resolver(vec![cn as SharedResolver], vec![], &[], 300);

        let req = query("clamp.example");
        let fresh = resolver.resolve(&req, deadline()).await.unwrap();
        assert_eq!(fresh.answers[0].ttl, 300);

        let cached = resolver.resolve(&req, deadline()).await.unwrap();
        assert!(cached.answers[0].ttl <= 300);
    }

    #[tokio::test(start_paused = true)]
    async fn late_better_reply_still_updates_the_cache() {
        // The abroad child answers first with a CN-geolocated IP (rank 2)
        // and is handed to the client; the CN child arrives much later
        // with rank 1 and must overwrite the cache without changing the
        // already-returned reply.
        let cn = MockResolver::replies_with("cn", Duration::from_millis(200), "223.5.5.5", 60);
        let ab = MockResolver::replies_with("ab", Duration::from_millis(10), "114.114.114.114", 60);
        let resolver = cn_resolver(vec![cn as SharedResolver], vec![ab as SharedResolver], &[], 0);

        let req = query("warming.example");
        let reply = resolver.resolve(&req, deadline()).await.unwrap();
        assert_eq!(reply.answers[0].ipv4(), Some("114.114.114.114".parse().unwrap()));

        // Let the straggler finish and run its update.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let warmed = resolver.cache().get(&req).expect("cache entry");
        assert_eq!(warmed.answers[0].ipv4(), Some("223.5.5.5".parse().unwrap()));
    }
}
