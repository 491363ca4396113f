//! User-maintained dynamic records.
//!
//! An in-memory table backed by a JSON file DB. Lookups reload the DB at
//! most every five seconds; updates (from the HTTP API) rewrite the
//! table and persist atomically via write-to-temp-then-rename.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::dns::packet::{AnswerRecord, DnsPacket};
use crate::dns::types::RecordType;
use crate::error::ResolveError;
use crate::resolver::Resolver;

const RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// One record in the DB and in the HTTP update body. Field names are
/// capitalized on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Addr")]
    pub addr: String,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    /// Last update time in microseconds since the epoch.
    #[serde(rename = "Updated", default)]
    pub updated: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DynDb {
    #[serde(rename = "Items", default)]
    items: Vec<DynItem>,
}

#[derive(Default)]
struct DynState {
    loaded_at: Option<Instant>,
    name2ip4: HashMap<String, Ipv4Addr>,
    name2ip6: HashMap<String, Ipv6Addr>,
    name2ttl: HashMap<String, u32>,
    db: DynDb,
}

/// Lowercase a domain name and validate its labels. Returns `None` for
/// anything that is not a plausible hostname.
pub fn normalize_domain(s: &str) -> Option<String> {
    let s = s.strip_suffix('.').unwrap_or(s);
    if s.is_empty() || s.len() > 253 {
        return None;
    }
    for label in s.split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
        let mut chars = label.chars();
        let first = chars.next()?;
        if !(first.is_ascii_alphanumeric() || first == '_') {
            return None;
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return None;
        }
    }
    Some(s.to_ascii_lowercase())
}

pub struct DynResolver {
    name: String,
    db_path: PathBuf,
    suffixes: Vec<String>,
    state: Mutex<DynState>,
}

impl DynResolver {
    pub fn new(name: &str, db_path: impl AsRef<Path>, suffixes: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            db_path: db_path.as_ref().to_path_buf(),
            suffixes: suffixes
                .into_iter()
                .map(|s| s.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            state: Mutex::new(DynState::default()),
        }
    }

    /// Whether the HTTP API may touch this name. An empty suffix list
    /// allows everything.
    pub fn allows_update(&self, name: &str) -> bool {
        if self.suffixes.is_empty() {
            return true;
        }
        self.suffixes
            .iter()
            .any(|s| name == s || name.ends_with(&format!(".{}", s)))
    }

    /// Re-read the DB file, at most once per [`RELOAD_INTERVAL`]. A
    /// missing file counts as an empty DB.
    fn reload_db(&self) -> anyhow::Result<()> {
        {
            let state = self.state.lock();
            if let Some(t) = state.loaded_at {
                if t.elapsed() < RELOAD_INTERVAL {
                    return Ok(());
                }
            }
        }

        let data = match std::fs::read(&self.db_path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut db: DynDb = if data.is_empty() {
            DynDb::default()
        } else {
            serde_json::from_slice(&data)?
        };

        let mut v4 = HashMap::new();
        let mut v6 = HashMap::new();
        let mut ttl = HashMap::new();
        for item in &mut db.items {
            let Some(name) = normalize_domain(&item.name) else {
                error!("[dyn:{}] bad name in db: {:?}", self.name, item.name);
                continue;
            };
            let Ok(ip) = item.addr.parse::<IpAddr>() else {
                error!("[dyn:{}] bad ip in db: {:?}", self.name, item.addr);
                continue;
            };
            match ip {
                IpAddr::V4(a) => {
                    v4.insert(name.clone(), a);
                }
                IpAddr::V6(a) => {
                    v6.insert(name.clone(), a);
                }
            }
            ttl.insert(name.clone(), item.ttl);
            item.name = name;
        }

        let mut state = self.state.lock();
        state.name2ip4 = v4;
        state.name2ip6 = v6;
        state.name2ttl = ttl;
        state.db = db;
        state.loaded_at = Some(Instant::now());
        Ok(())
    }

    /// Apply one update: table plus DB file, the latter written to a
    /// temp file and renamed into place.
    pub fn update(&self, name: &str, ip: IpAddr, ttl: u32) -> anyhow::Result<()> {
        info!("[dyn:{}] update {} -> {} (ttl {})", self.name, name, ip, ttl);
        if let Err(e) = self.reload_db() {
            error!("[dyn:{}] reload before update: {}", self.name, e);
        }

        let mut state = self.state.lock();
        match ip {
            IpAddr::V4(a) => {
                state.name2ip4.insert(name.to_string(), a);
            }
            IpAddr::V6(a) => {
                state.name2ip6.insert(name.to_string(), a);
            }
        }
        state.name2ttl.insert(name.to_string(), ttl);

        // Replace the item for this name and address family, or append.
        let slot = state.db.items.iter().position(|it| {
            it.name == name
                && it
                    .addr
                    .parse::<IpAddr>()
                    .map_or(false, |prev| prev.is_ipv4() == ip.is_ipv4())
        });
        let updated = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let item = DynItem {
            name: name.to_string(),
            addr: ip.to_string(),
            ttl,
            updated,
        };
        match slot {
            Some(i) => state.db.items[i] = item,
            None => state.db.items.push(item),
        }

        let tmp_path =
            PathBuf::from(format!("{}.tmp.pid.{}", self.db_path.display(), std::process::id()));
        let data = serde_json::to_vec_pretty(&state.db)?;
        std::fs::write(&tmp_path, &data)?;
        if let Err(e) = std::fs::rename(&tmp_path, &self.db_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Resolver for DynResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, req: &DnsPacket, _deadline: tokio::time::Instant) -> Result<DnsPacket, ResolveError> {
        if let Err(e) = self.reload_db() {
            error!("[dyn:{}] reload: {}", self.name, e);
        }

        let mut answers = Vec::new();
        for q in &req.questions {
            if !q.qtype.is_address_query() {
                continue;
            }
            let Some(qname) = normalize_domain(&q.name) else { continue };

            let (ip4, ip6, ttl) = {
                let state = self.state.lock();
                (
                    state.name2ip4.get(&qname).copied(),
                    state.name2ip6.get(&qname).copied(),
                    state.name2ttl.get(&qname).copied().unwrap_or(0),
                )
            };

            let candidates = [ip4.map(IpAddr::V4), ip6.map(IpAddr::V6)];
            for ip in candidates.into_iter().flatten() {
                let (rtype, rdata) = match ip {
                    IpAddr::V4(a) => (RecordType::A, a.octets().to_vec()),
                    IpAddr::V6(a) => (RecordType::AAAA, a.octets().to_vec()),
                };
                if q.qtype != RecordType::ANY && q.qtype != rtype {
                    continue;
                }
                info!("[dyn:{}] hit {} -> {}", self.name, qname, ip);
                answers.push(AnswerRecord {
                    name: q.name.clone(),
                    rtype,
                    class: q.qclass,
                    ttl,
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
