//! Pollution filter for untrusted paths.
//!
//! Censor-injected replies observed in the wild carry a single spoofed
//! answer, so only single-answer replies are inspected: a blackhole-listed
//! address, an IPv6 body, or an IPv4 outside the China table fails the
//! reply. Empty replies fail too. Replies with two or more answers pass
//! untouched.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::cn_ip::{self, BlackIpSet};
use crate::dns::packet::DnsPacket;
use crate::error::ResolveError;
use crate::resolver::{Resolver, SharedResolver};

pub struct GfwFilterResolver {
    name: String,
    child: SharedResolver,
    black: Arc<BlackIpSet>,
}

impl GfwFilterResolver {
    pub fn new(name: &str, child: SharedResolver, black: Arc<BlackIpSet>) -> Self {
        Self { name: name.to_string(), child, black }
    }

    fn looks_polluted(&self, reply: &DnsPacket) -> bool {
        if reply.answers.is_empty() {
            return true;
        }
        if reply.answers.len() != 1 {
            return false;
        }
        match reply.answers[0].ip() {
            Some(IpAddr::V6(_)) => true, // no v6 geolocation data, treat as suspect
            Some(IpAddr::V4(v4)) => self.black.contains_v4(v4) || !cn_ip::is_cn_ipv4(v4),
            None => false, // non-address rdata
        }
    }
}

#[async_trait]
impl Resolver for GfwFilterResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, req: &DnsPacket, deadline: Instant) -> Result<DnsPacket, ResolveError> {
        let reply = self.child.resolve(req, deadline).await?;
        if self.looks_polluted(&reply) {
            debug!("[{}] rejecting suspect reply: {}", self.name, reply);
            return Err(ResolveError::MaybePolluted);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::packet::{AnswerRecord, DnsPacket};
    use crate::dns::types::{DnsClass, RecordType};
    use crate::resolver::testutil::{query, MockResolver};
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn filter_with(child: SharedResolver, black: &[&str]) -> GfwFilterResolver {
        let black = BlackIpSet::from_list(&black.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        GfwFilterResolver::new("gfw", child, Arc::new(black))
    }

    #[tokio::test(start_paused = true)]
    async fn single_cn_answer_passes() {
        let child = MockResolver::replies_with("leaf", Duration::ZERO, "114.114.114.114", 60);
        let filter = filter_with(child, &[]);
        let reply = filter.resolve(&query("ok.example"), deadline()).await.unwrap();
        assert_eq!(reply.answers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_foreign_answer_is_rejected() {
        let child = MockResolver::replies_with("leaf", Duration::ZERO, "8.8.8.8", 60);
        let filter = filter_with(child, &[]);
        let res = filter.resolve(&query("foreign.example"), deadline()).await;
        assert!(matches!(res, Err(ResolveError::MaybePolluted)));
    }

    #[tokio::test(start_paused = true)]
    async fn blackhole_answer_is_rejected() {
        let child = MockResolver::replies_with("leaf", Duration::ZERO, "114.114.114.114", 60);
        let filter = filter_with(child, &["114.114.114.114"]);
        let res = filter.resolve(&query("black.example"), deadline()).await;
        assert!(matches!(res, Err(ResolveError::MaybePolluted)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_is_rejected() {
        let child = MockResolver::empty_after("leaf", Duration::ZERO);
        let filter = filter_with(child, &[]);
        let res = filter.resolve(&query("empty.example"), deadline()).await;
        assert!(matches!(res, Err(ResolveError::MaybePolluted)));
    }

    #[tokio::test(start_paused = true)]
    async fn multi_answer_reply_passes_untouched() {
        let child = MockResolver::with("leaf", Duration::ZERO, |req| {
            let q = req.first_question().unwrap();
            let answers = vec![
                AnswerRecord {
                    name: q.name.clone(),
                    rtype: RecordType::A,
                    class: DnsClass::IN,
                    ttl: 60,
                    rdata: vec![8, 8, 8, 8],
                },
                AnswerRecord {
                    name: q.name.clone(),
                    rtype: RecordType::A,
                    class: DnsClass::IN,
                    ttl: 60,
                    rdata: vec![8, 8, 4, 4],
                },
            ];
            Ok(DnsPacket::build_reply(req, &answers).unwrap())
        });
        let filter = filter_with(child, &[]);
        let reply = filter.resolve(&query("multi.example"), deadline()).await.unwrap();
        assert_eq!(reply.answers.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_ipv6_answer_is_rejected() {
        let child = MockResolver::with("leaf", Duration::ZERO, |req| {
            let q = req.first_question().unwrap();
            let answers = vec![AnswerRecord {
                name: q.name.clone(),
                rtype: RecordType::AAAA,
                class: DnsClass::IN,
                ttl: 60,
                rdata: "2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap().octets().to_vec(),
            }];
            Ok(DnsPacket::build_reply(req, &answers).unwrap())
        });
        let filter = filter_with(child, &[]);
        let res = filter.resolve(&query("v6.example"), deadline()).await;
        assert!(matches!(res, Err(ResolveError::MaybePolluted)));
    }

    #[tokio::test(start_paused = true)]
    async fn child_errors_propagate() {
        let child = MockResolver::fails_after("leaf", Duration::ZERO);
        let filter = filter_with(child, &[]);
        let res = filter.resolve(&query("err.example"), deadline()).await;
        assert!(matches!(res, Err(ResolveError::NoResult)));
    }
}
