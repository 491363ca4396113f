//! Synchronous lookup against the OS hosts file.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use crate::dns::packet::{AnswerRecord, DnsPacket};
use crate::dns::types::RecordType;
use crate::error::ResolveError;
use crate::hosts::{HostsFile, CACHE_MAX_AGE};
use crate::resolver::Resolver;

pub struct HostsResolver {
    name: String,
    hosts: Arc<HostsFile>,
}

impl HostsResolver {
    pub fn new(name: &str) -> Self {
        Self::with_hosts(name, Arc::new(HostsFile::system()))
    }

    pub fn with_hosts(name: &str, hosts: Arc<HostsFile>) -> Self {
        Self { name: name.to_string(), hosts }
    }
}

#[async_trait]
impl Resolver for HostsResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, req: &DnsPacket, _deadline: Instant) -> Result<DnsPacket, ResolveError> {
        let mut answers = Vec::new();
        for q in &req.questions {
            if !q.qtype.is_address_query() {
                continue;
            }
            for ip in self.hosts.lookup(&q.name) {
                let (rtype, rdata) = match ip {
                    IpAddr::V4(v4) => (RecordType::A, v4.octets().to_vec()),
                    IpAddr::V6(v6) => (RecordType::AAAA, v6.octets().to_vec()),
                };
                if q.qtype != RecordType::ANY && q.qtype != rtype {
                    continue;
                }
                info!("[hosts] hit {} -> {}", q.name, ip);
                answers.push(AnswerRecord {
                    name: q.name.clone(),
                    rtype,
                    class: q.qclass,
                    ttl: CACHE_MAX_AGE.as_secs() as u32,
                    rdata,
                });
            }
        }

        if answers.is_empty() {
            return Err(ResolveError::NoResult);
        }
        DnsPacket::build_reply(req, &answers).map_err(|e| ResolveError::Pack(e.to_string()))
    }
}
