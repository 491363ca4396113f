//! OS hosts file lookup with a short-lived parse cache.
//!
//! The file is re-read at most every five seconds, and only when its
//! mtime or size changed. Names are lowercased; trailing dots stripped.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::debug;

#[cfg(not(windows))]
const HOSTS_PATH: &str = "/etc/hosts";
#[cfg(windows)]
const HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";

/// TTL used for answers synthesized from the hosts file, matching the
/// parse-cache lifetime.
pub const CACHE_MAX_AGE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct HostsState {
    by_name: HashMap<String, Vec<IpAddr>>,
    expire: Option<Instant>,
    mtime: Option<SystemTime>,
    size: u64,
}

pub struct HostsFile {
    path: PathBuf,
    state: Mutex<HostsState>,
}

fn normalize(name: &str) -> String {
    let name = name.strip_suffix('.').unwrap_or(name);
    name.to_ascii_lowercase()
}

impl HostsFile {
    pub fn system() -> Self {
        Self::with_path(HOSTS_PATH)
    }

    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(HostsState::default()),
        }
    }

    /// Addresses the hosts file maps `host` to; empty when unknown.
    pub fn lookup(&self, host: &str) -> Vec<IpAddr> {
        let mut state = self.state.lock();
        self.reload_if_stale(&mut state);
        state
            .by_name
            .get(&normalize(host))
            .cloned()
            .unwrap_or_default()
    }

    fn reload_if_stale(&self, state: &mut HostsState) {
        let now = Instant::now();
        if let Some(expire) = state.expire {
            if now < expire && !state.by_name.is_empty() {
                return;
            }
        }

        let meta = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return, // missing file: keep whatever we had
        };
        let mtime = meta.modified().ok();
        if state.mtime.is_some() && state.mtime == mtime && state.size == meta.len() {
            state.expire = Some(now + CACHE_MAX_AGE);
            return;
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return,
        };

        let mut by_name: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next() else { continue };
            let Ok(ip) = addr.parse::<IpAddr>() else { continue };
            for name in fields {
                by_name.entry(normalize(name)).or_default().push(ip);
            }
        }

        debug!("hosts file reloaded: {} names from {}", by_name.len(), self.path.display());
        state.by_name = by_name;
        state.expire = Some(now + CACHE_MAX_AGE);
        state.mtime = mtime;
        state.size = meta.len();
    }
}
