use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    /// 缓存参数，仅在启动时生效 / Cache parameters, applied at startup only.
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub blocklist: BlocklistConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// 上游DNS。
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// 上游超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// Seconds between expired-entry sweeps; 0 disables the sweep.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
    /// Seconds between cache statistics log lines; 0 disables them.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            purge_interval_secs: default_purge_interval_secs(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CacheSettings {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Hard cap on cached answers.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Record TTLs above this are clamped.
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,
    /// Answers whose TTL is below this are not cached.
    #[serde(default)]
    pub min_ttl: u32,
    /// TTL for SERVFAIL/REFUSED answers; 0 disables caching them.
    #[serde(default = "default_temp_failure_ttl")]
    pub temp_failure_ttl: u32,
    /// Grace window for serving expired answers while the upstream is failing.
    #[serde(default = "default_stale_ttl")]
    pub stale_ttl: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_max_entries(),
            max_ttl: default_max_ttl(),
            min_ttl: 0,
            temp_failure_ttl: default_temp_failure_ttl(),
            stale_ttl: default_stale_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BlocklistConfig {
    /// Answer used for entries without their own action.
    #[serde(default)]
    pub action: BlockAction,
    #[serde(default)]
    pub domains: Vec<BlockEntry>,
    /// 每行一个域名，支持 hosts 格式 / One domain per line, hosts format accepted.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BlockEntry {
    Domain(String),
    WithAction {
        domain: String,
        action: BlockAction,
    },
}

impl BlockEntry {
    pub fn domain(&self) -> &str {
        match self {
            BlockEntry::Domain(domain) => domain,
            BlockEntry::WithAction { domain, .. } => domain,
        }
    }

    pub fn action(&self, default: BlockAction) -> BlockAction {
        match self {
            BlockEntry::Domain(_) => default,
            BlockEntry::WithAction { action, .. } => *action,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockAction {
    #[default]
    Refused,
    #[serde(alias = "nx_domain")]
    Nxdomain,
}

pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ProxyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    if cfg.cache.enabled && cfg.cache.max_entries == 0 {
        anyhow::bail!("cache.max_entries must be positive when the cache is enabled");
    }
    if cfg.cache.min_ttl > cfg.cache.max_ttl {
        anyhow::bail!(
            "cache.min_ttl ({}) exceeds cache.max_ttl ({})",
            cfg.cache.min_ttl,
            cfg.cache.max_ttl
        );
    }
    for entry in &cfg.blocklist.domains {
        if entry.domain().trim().is_empty() {
            anyhow::bail!("blocklist domain entry empty");
        }
    }

    Ok(cfg)
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_upstream() -> String {
    "1.1.1.1:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_purge_interval_secs() -> u64 {
    60
}

fn default_stats_interval_secs() -> u64 {
    300
}

fn default_cache_enabled() -> bool {
    true
}

fn default_max_entries() -> usize {
    10_000
}

fn default_max_ttl() -> u32 {
    86400
}

fn default_temp_failure_ttl() -> u32 {
    60
}

fn default_stale_ttl() -> u32 {
    60
}
