//! JSON configuration and the resolver graph loader.
//!
//! The graph is built depth-first from the node named `root`; a
//! "currently constructing" set catches circular references.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::error;

use crate::cn_ip::BlackIpSet;
use crate::resolver::cache::CacheResolver;
use crate::resolver::chain::ChainResolver;
use crate::resolver::cn::CnResolver;
use crate::resolver::dynamic::DynResolver;
use crate::resolver::gfw::GfwFilterResolver;
use crate::resolver::hosts::HostsResolver;
use crate::resolver::parallel::ParallelResolver;
use crate::resolver::upstream::{UdpExchanger, UdpResolver};
use crate::resolver::SharedResolver;
use crate::web;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// host:port the client-facing servers bind.
    pub listen: String,
    /// Per-query deadline, also the CN resolver's internal timeout.
    pub timeout_ms: u64,
    #[serde(default)]
    pub gfw_ip_list: Vec<String>,
    #[serde(default)]
    pub resolvers: Vec<ResolverDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    // leaf
    #[serde(default)]
    pub addr: Option<String>,
    // gfw-filter, cache
    #[serde(default)]
    pub child: Option<String>,
    // parallel, chain
    #[serde(default)]
    pub children: Vec<String>,
    // cn
    #[serde(default)]
    pub cn_list: Vec<String>,
    #[serde(default)]
    pub ab_list: Vec<String>,
    #[serde(default)]
    pub max_ttl: u32,
    // dyn
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub suffixes: Vec<String>,
    #[serde(default)]
    pub http_addr: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {:?}", path))?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("circular reference for resolver {0:?}")]
    CircularRef(String),
    #[error("resolver {0:?} expected")]
    MissingResolver(String),
    #[error("unknown resolver type {kind:?} for {name:?}")]
    UnknownType { name: String, kind: String },
    #[error("bad address {addr:?} for resolver {name:?}")]
    BadAddress { name: String, addr: String },
    #[error("resolver {name:?} missing field {field:?}")]
    MissingField { name: String, field: &'static str },
    #[error("duplicate resolver name {0:?}")]
    DuplicateName(String),
}

/// Build the graph and return its root. Every configured node is
/// constructed at most once; nodes reachable from `root` share instances.
pub fn build_graph(cfg: &Config, exchanger: Arc<UdpExchanger>) -> Result<SharedResolver, ConfigError> {
    let mut seen = HashSet::new();
    for def in &cfg.resolvers {
        if !seen.insert(def.name.as_str()) {
            return Err(ConfigError::DuplicateName(def.name.clone()));
        }
    }

    let mut builder = Builder {
        cfg,
        exchanger,
        black: Arc::new(BlackIpSet::from_list(&cfg.gfw_ip_list)),
        built: HashMap::new(),
        building: HashSet::new(),
    };
    builder.load("root")
}

struct Builder<'a> {
    cfg: &'a Config,
    exchanger: Arc<UdpExchanger>,
    black: Arc<BlackIpSet>,
    built: HashMap<String, SharedResolver>,
    building: HashSet<String>,
}

impl Builder<'_> {
    fn load(&mut self, name: &str) -> Result<SharedResolver, ConfigError> {
        if let Some(resolver) = self.built.get(name) {
            return Ok(resolver.clone());
        }
        if self.building.contains(name) {
            return Err(ConfigError::CircularRef(name.to_string()));
        }

        let def = self
            .cfg
            .resolvers
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ConfigError::MissingResolver(name.to_string()))?
            .clone();

        self.building.insert(name.to_string());
        let resolver = self.build(&def)?;
        self.building.remove(name);

        self.built.insert(name.to_string(), resolver.clone());
        Ok(resolver)
    }

    fn build(&mut self, def: &ResolverDef) -> Result<SharedResolver, ConfigError> {
        let name = def.name.as_str();
        let resolver: SharedResolver = match def.kind.as_str() {
            "hosts" => Arc::new(HostsResolver::new(name)),
            "leaf" => {
                let addr = self.required(def, def.addr.as_deref(), "addr")?;
                let remote: SocketAddr = addr.parse().map_err(|_| ConfigError::BadAddress {
                    name: name.to_string(),
                    addr: addr.to_string(),
                })?;
                Arc::new(UdpResolver::new(name, remote, self.exchanger.clone()))
            }
            "gfw-filter" => {
                let child = self.required(def, def.child.as_deref(), "child")?;
                let child = self.load(&child.to_string())?;
                Arc::new(GfwFilterResolver::new(name, child, self.black.clone()))
            }
            "cache" => {
                let child = self.required(def, def.child.as_deref(), "child")?;
                let child = self.load(&child.to_string())?;
                Arc::new(CacheResolver::new(name, child))
            }
            "parallel" => Arc::new(ParallelResolver::new(name, self.load_children(&def.children)?)),
            "chain" => Arc::new(ChainResolver::new(name, self.load_children(&def.children)?)),
            "cn" => {
                let cn_list = self.load_children(&def.cn_list)?;
                let ab_list = self.load_children(&def.ab_list)?;
                Arc::new(CnResolver::new(
                    name,
                    cn_list,
                    ab_list,
                    self.cfg.timeout(),
                    def.max_ttl,
                    self.black.clone(),
                ))
            }
            "dyn" => {
                let db_path = self.required(def, def.db_path.as_deref(), "db_path")?;
                let resolver = Arc::new(DynResolver::new(name, db_path, def.suffixes.clone()));
                if let Some(http_addr) = def.http_addr.clone() {
                    let resolver = resolver.clone();
                    tokio::spawn(async move {
                        if let Err(e) = web::server::run_dyn_update(http_addr, resolver).await {
                            error!("dyn update API: {}", e);
                        }
                    });
                }
                resolver
            }
            _ => {
                return Err(ConfigError::UnknownType {
                    name: name.to_string(),
                    kind: def.kind.clone(),
                })
            }
        };
        Ok(resolver)
    }

    fn load_children(&mut self, names: &[String]) -> Result<Vec<SharedResolver>, ConfigError> {
        names.iter().map(|n| self.load(n)).collect()
    }

    fn required<'d>(
        &self,
        def: &ResolverDef,
        value: Option<&'d str>,
        field: &'static str,
    ) -> Result<&'d str, ConfigError> {
        value.ok_or_else(|| ConfigError::MissingField {
            name: def.name.clone(),
            field,
        })
    }
}
