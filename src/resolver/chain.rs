//! Ordered fallback: try children one at a time, first clean reply wins.

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::dns::packet::DnsPacket;
use crate::error::ResolveError;
use crate::resolver::{Resolver, SharedResolver};

pub struct ChainResolver {
    name: String,
    children: Vec<SharedResolver>,
}

impl ChainResolver {
    pub fn new(name: &str, children: Vec<SharedResolver>) -> Self {
        Self { name: name.to_string(), children }
    }
}

#[async_trait]
impl Resolver for ChainResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, req: &DnsPacket, deadline: Instant) -> Result<DnsPacket, ResolveError> {
        for child in &self.children {
            match child.resolve(req, deadline).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    debug!("[chain:{}] child {} error: {}", self.name, child.name(), e);
                }
            }
        }
        Err(ResolveError::NoResult)
    }
}
