//! Client-facing front end: DNS over UDP and over TCP, both feeding the
//! root of the resolver graph. Resolution failures never go unanswered;
//! the client gets an NXDOMAIN reply with its own ID and question.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dns::packet::DnsPacket;
use crate::dns::types::ResponseCode;
use crate::error::ResolveError;
use crate::resolver::SharedResolver;
use crate::stats::Stats;

pub struct Frontend {
    root: SharedResolver,
    timeout: Duration,
    stats: Arc<Stats>,
    session: AtomicU64,
}

impl Frontend {
    pub fn new(root: SharedResolver, timeout: Duration, stats: Arc<Stats>) -> Self {
        Self {
            root,
            timeout,
            stats,
            session: AtomicU64::new(0),
        }
    }

    /// Resolve one raw query and produce the raw reply, or `None` when
    /// the query cannot even be parsed.
    async fn handle_packet(&self, data: &[u8], proto: &str) -> Option<Vec<u8>> {
        let session = self.session.fetch_add(1, Ordering::Relaxed) + 1;

        let req = match DnsPacket::parse(data) {
            Ok(m) => m,
            Err(e) => {
                self.stats.unparseable.fetch_add(1, Ordering::Relaxed);
                warn!("[{}][session:{}] {}", proto, session, ResolveError::Unpack(e.to_string()));
                return None;
            }
        };
        info!("[{}][session:{}] req: {}", proto, session, req);

        let deadline = Instant::now() + self.timeout;
        match self.root.resolve(&req, deadline).await {
            Ok(reply) => {
                info!("[{}][session:{}] res: {}", proto, session, reply);
                self.stats.replies_ok.fetch_add(1, Ordering::Relaxed);
                Some(reply.wire().to_vec())
            }
            Err(e) => {
                warn!("[{}][session:{}] resolve: {}", proto, session, e);
                self.stats.replies_failed.fetch_add(1, Ordering::Relaxed);
                match DnsPacket::build_error_reply(&req, ResponseCode::NameError) {
                    Ok(reply) => Some(reply.wire().to_vec()),
                    Err(e) => {
                        error!("[{}][session:{}] error reply: {}", proto, session, e);
                        None
                    }
                }
            }
        }
    }

    /// One task per datagram; 64 KiB receive buffer.
    pub async fn run_udp(self: Arc<Self>, socket: UdpSocket) -> anyhow::Result<()> {
        let socket = Arc::new(socket);
        info!("udp server listening on {}", socket.local_addr()?);

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    error!("udp recv: {}", e);
                    continue;
                }
            };
            self.stats.udp_queries.fetch_add(1, Ordering::Relaxed);

            let data = buf[..n].to_vec();
            let this = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let Some(reply) = this.handle_packet(&data, "udp").await else { return };
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!("udp send to {}: {}", peer, e);
                }
            });
        }
    }

    /// Persistent connections carrying length-prefixed messages.
    pub async fn run_tcp(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("tcp server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.serve_tcp_client(stream).await {
                            debug!("tcp client {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("tcp accept: {}", e),
            }
        }
    }

    async fn serve_tcp_client(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        loop {
            // 2-byte big-endian length prefix, then one DNS message.
            let mut len_buf = [0u8; 2];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let msg_len = u16::from_be_bytes(len_buf) as usize;
            if msg_len == 0 {
                break;
            }

            let mut msg = vec![0u8; msg_len];
            stream.read_exact(&mut msg).await?;
            self.stats.tcp_queries.fetch_add(1, Ordering::Relaxed);

            let Some(reply) = self.handle_packet(&msg, "tcp").await else { break };
            stream.write_all(&(reply.len() as u16).to_be_bytes()).await?;
            stream.write_all(&reply).await?;
        }
        Ok(())
    }
}
