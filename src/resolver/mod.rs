//! The resolver graph: every node takes a parsed request and a deadline
//! and produces a reply or a [`ResolveError`]. Composite nodes apply
//! their own ordering and timeout policy on top of the caller's deadline.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::dns::packet::DnsPacket;
use crate::error::ResolveError;

pub mod cache;
pub mod chain;
pub mod cn;
pub mod dynamic;
pub mod gfw;
pub mod hosts;
pub mod parallel;
pub mod upstream;

#[async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve `req` before `deadline`. Implementations must not hold a
    /// reply back once they have chosen it; see the per-resolver ordering
    /// guarantees.
    async fn resolve(&self, req: &DnsPacket, deadline: Instant) -> Result<DnsPacket, ResolveError>;
}

pub type SharedResolver = Arc<dyn Resolver>;

impl std::fmt::Debug for dyn Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").field("name", &self.name()).finish()
    }
}
