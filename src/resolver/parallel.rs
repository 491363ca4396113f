//! Concurrent race over an unordered set of children.
//!
//! The first child to produce a reply with at least one answer wins
//! outright; a later reply can never supplant it. When nothing non-empty
//! arrives, the first empty success observed is returned after every
//! child has finished. Losing children are not cancelled; they keep
//! running against the shared deadline.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::dns::packet::DnsPacket;
use crate::error::ResolveError;
use crate::resolver::{Resolver, SharedResolver};

pub struct ParallelResolver {
    name: String,
    children: Vec<SharedResolver>,
}

impl ParallelResolver {
    pub fn new(name: &str, children: Vec<SharedResolver>) -> Self {
        Self { name: name.to_string(), children }
    }
}

#[async_trait]
impl Resolver for ParallelResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, req: &DnsPacket, deadline: Instant) -> Result<DnsPacket, ResolveError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        for child in &self.children {
            let tx = tx.clone();
            let child = child.clone();
            let req = req.clone();
            tokio::spawn(async move {
                let result = child.resolve(&req, deadline).await;
                let _ = tx.send((child.name().to_string(), result));
            });
        }
        drop(tx);

        let mut empty_fallback: Option<DnsPacket> = None;
        while let Some((child_name, result)) = rx.recv().await {
            match result {
                Ok(reply) if !reply.answers.is_empty() => {
                    debug!("[parallel:{}] picked {}", self.name, child_name);
                    return Ok(reply);
                }
                Ok(reply) => {
                    debug!("[parallel:{}] empty reply from {}", self.name, child_name);
                    if empty_fallback.is_none() {
                        empty_fallback = Some(reply);
                    }
                }
                Err(e) => {
                    info!("[parallel:{}] child {} error: {}", self.name, child_name, e);
                }
            }
        }

        match empty_fallback {
            Some(reply) => Ok(reply),
            None => {
                debug!("[parallel:{}] no result", self.name);
                Err(ResolveError::NoResult)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testutil::{query, MockResolver};
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test(start_paused = true)]
    async fn first_non_empty_reply_wins() {
        let a = MockResolver::empty_after("a", Duration::from_millis(10));
        let b = MockResolver::replies_with("b", Duration::from_millis(50), "5.6.7.8", 60);
        let c = MockResolver::replies_with("c", Duration::from_millis(100), "9.10.11.12", 60);
        let parallel =
            ParallelResolver::new("race", vec![a as SharedResolver, b, c]);

        let reply = parallel.resolve(&query("race.example"), deadline()).await.unwrap();
        assert_eq!(reply.answers[0].ipv4(), Some("5.6.7.8".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_failure_does_not_block_the_winner() {
        let slow = MockResolver::fails_after("slow", Duration::from_secs(3));
        let fast = MockResolver::replies_with("fast", Duration::from_millis(5), "1.2.3.4", 60);
        let parallel = ParallelResolver::new("race", vec![slow as SharedResolver, fast]);

        let start = Instant::now();
        let reply = parallel.resolve(&query("fast.example"), deadline()).await.unwrap();
        assert_eq!(reply.answers[0].ipv4(), Some("1.2.3.4".parse().unwrap()));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_success_is_returned_when_nothing_better_arrives() {
        let a = MockResolver::fails_after("a", Duration::from_millis(10));
        let b = MockResolver::empty_after("b", Duration::from_millis(20));
        let parallel = ParallelResolver::new("race", vec![a as SharedResolver, b]);

        let reply = parallel.resolve(&query("empty.example"), deadline()).await.unwrap();
        assert!(reply.answers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_become_no_result() {
        let a = MockResolver::fails_after("a", Duration::from_millis(10));
        let b = MockResolver::fails_after("b", Duration::from_millis(20));
        let parallel = ParallelResolver::new("race", vec![a as SharedResolver, b]);

        let res = parallel.resolve(&query("dead.example"), deadline()).await;
        assert!(matches!(res, Err(ResolveError::NoResult)));
    }
}
