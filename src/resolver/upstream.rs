//! Shared-socket UDP upstream exchange.
//!
//! All leaf resolvers send through one bound UDP socket. Outgoing
//! requests get a fresh 16-bit transaction ID from an atomic counter; a
//! background reader demultiplexes replies back to the waiting caller by
//! that ID. The caller's original ID is restored before the reply is
//! returned.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::dns::packet::DnsPacket;
use crate::error::ResolveError;
use crate::resolver::Resolver;

pub struct UdpExchanger {
    socket: Arc<UdpSocket>,
    pending: DashMap<u16, oneshot::Sender<DnsPacket>>,
    next_id: AtomicU32,
    quit: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpExchanger {
    /// Bind the shared upstream socket (ephemeral local address), seed the
    /// transaction-ID counter and spawn the reader task.
    pub async fn start() -> Result<Arc<Self>, ResolveError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(ResolveError::Bind)?;

        let exchanger = Arc::new(Self {
            socket: Arc::new(socket),
            pending: DashMap::new(),
            next_id: AtomicU32::new(OsRng.gen()),
            quit: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::reader_loop(exchanger.clone()));
        *exchanger.reader.lock() = Some(handle);
        Ok(exchanger)
    }

    async fn reader_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    if self.quit.load(Ordering::Relaxed) {
                        break;
                    }
                    error!("upstream reader: {}", ResolveError::Receive(e));
                    continue;
                }
            };

            let msg = match DnsPacket::parse(&buf[..n]) {
                Ok(m) => m,
                Err(e) => {
                    warn!("upstream reader from {}: {}", from, ResolveError::Unpack(e.to_string()));
                    continue;
                }
            };

            // The only place duplicate or unsolicited upstream packets are
            // discarded: no registered waiter, no delivery.
            match self.pending.remove(&msg.id()) {
                Some((txid, tx)) => {
                    debug!("reply from {} for txid {}: {}", from, txid, msg);
                    if tx.send(msg).is_err() {
                        debug!("waiter for txid {} already gone", txid);
                    }
                }
                None => {
                    warn!("unknown txid {} from {}, dropping", msg.id(), from);
                }
            }
        }
    }

    /// Send `req` to `remote` and wait for the matching reply or the
    /// deadline. The pending slot is removed on every exit path.
    pub async fn exchange(
        &self,
        remote: SocketAddr,
        req: &DnsPacket,
        deadline: Instant,
    ) -> Result<DnsPacket, ResolveError> {
        let txid = self.next_id.fetch_add(1, Ordering::Relaxed) as u16;
        let origin_id = req.id();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(txid, tx);

        let mut wire = req.clone();
        wire.set_id(txid);
        if let Err(e) = self.socket.send_to(wire.wire(), remote).await {
            self.pending.remove(&txid);
            return Err(ResolveError::Send(e));
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(mut reply)) => {
                self.pending.remove(&txid);
                reply.set_id(origin_id);
                Ok(reply)
            }
            // Sender dropped without a reply: the exchanger was stopped.
            Ok(Err(_)) => {
                self.pending.remove(&txid);
                Err(ResolveError::Deadline)
            }
            Err(_) => {
                debug!("txid {} abandoned at deadline", txid);
                self.pending.remove(&txid);
                Err(ResolveError::Deadline)
            }
        }
    }

    /// Number of outstanding upstream calls.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Stop the reader and cancel every outstanding call. Waiters observe
    /// the cancellation as a deadline error.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.pending.clear();
    }
}

/// Leaf resolver: the exchanger bound to one fixed upstream address.
pub struct UdpResolver {
    name: String,
    remote: SocketAddr,
    exchanger: Arc<UdpExchanger>,
}

impl UdpResolver {
    pub fn new(name: &str, remote: SocketAddr, exchanger: Arc<UdpExchanger>) -> Self {
        Self { name: name.to_string(), remote, exchanger }
    }
}

#[async_trait]
impl Resolver for UdpResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, req: &DnsPacket, deadline: Instant) -> Result<DnsPacket, ResolveError> {
        debug!("[{}] query {} -> {}", self.name, req, self.remote);
        self.exchanger.exchange(self.remote, req, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dns::packet::{AnswerRecord, DnsPacket};
    use crate::dns::types::{DnsClass, RecordType};

    /// Fake upstream: collects `batch` queries, then answers them in
    /// reverse arrival order, echoing each query's wire transaction ID.
    async fn reverse_replying_upstream(batch: usize) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            let mut received = Vec::new();
            while received.len() < batch {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                received.push((buf[..n].to_vec(), from));
            }
            for (data, from) in received.into_iter().rev() {
                let req = DnsPacket::parse(&data).unwrap();
                let q = req.first_question().unwrap();
                // Derive a distinct answer from the queried name.
                let last_octet = q.name.len() as u8;
                let answers = vec![AnswerRecord {
                    name: q.name.clone(),
                    rtype: RecordType::A,
                    class: DnsClass::IN,
                    ttl: 60,
                    rdata: vec![10, 0, 0, last_octet],
                }];
                let reply = DnsPacket::build_reply(&req, &answers).unwrap();
                socket.send_to(reply.wire(), from).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn concurrent_callers_get_their_own_replies() {
        let upstream = reverse_replying_upstream(2).await;
        let exchanger = UdpExchanger::start().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let req_short = DnsPacket::build_query(0x1111, "ab.test", RecordType::A, true).unwrap();
        let req_long =
            DnsPacket::build_query(0x2222, "longer-name.test", RecordType::A, true).unwrap();

        let (ex1, ex2) = (exchanger.clone(), exchanger.clone());
        let (r1, r2) = (req_short.clone(), req_long.clone());
        let a = tokio::spawn(async move { ex1.exchange(upstream, &r1, deadline).await });
        let b = tokio::spawn(async move { ex2.exchange(upstream, &r2, deadline).await });

        let reply_short = a.await.unwrap().unwrap();
        let reply_long = b.await.unwrap().unwrap();

        // Original IDs restored despite on-wire rewriting.
        assert_eq!(reply_short.id(), 0x1111);
        assert_eq!(reply_long.id(), 0x2222);
        // Each caller got the reply derived from its own question, even
        // though the upstream answered in reverse order.
        assert_eq!(
            reply_short.answers[0].ipv4().unwrap().octets()[3] as usize,
            "ab.test".len()
        );
        assert_eq!(
            reply_long.answers[0].ipv4().unwrap().octets()[3] as usize,
            "longer-name.test".len()
        );
        // No leaked pending slots.
        assert_eq!(exchanger.pending_calls(), 0);
    }

    #[tokio::test]
    async fn deadline_releases_the_slot() {
        // An upstream that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = silent.local_addr().unwrap();

        let exchanger = UdpExchanger::start().await.unwrap();
        let req = DnsPacket::build_query(7, "slow.test", RecordType::A, true).unwrap();
        let res = exchanger
            .exchange(remote, &req, Instant::now() + Duration::from_millis(50))
            .await;
        assert!(matches!(res, Err(ResolveError::Deadline)));
        assert_eq!(exchanger.pending_calls(), 0);
    }

    #[tokio::test]
    async fn stop_cancels_pending_callers() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = silent.local_addr().unwrap();

        let exchanger = UdpExchanger::start().await.unwrap();
        let req = DnsPacket::build_query(9, "stopped.test", RecordType::A, true).unwrap();

        let ex = exchanger.clone();
        let waiter = tokio::spawn(async move {
            ex.exchange(remote, &req, Instant::now() + Duration::from_secs(10)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        exchanger.stop();

        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(ResolveError::Deadline)));
        assert_eq!(exchanger.pending_calls(), 0);
    }
}
