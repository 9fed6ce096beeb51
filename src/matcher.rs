use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::Name;

use crate::config::{self, BlockAction, ProxyConfig};
use crate::suffix_tree::SuffixMatchTree;

/// Hot-swappable part of the configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub settings: config::GlobalSettings,
    pub cache: config::CacheSettings,
    pub blocklist: SuffixMatchTree<BlockAction>,
}

impl RuntimeConfig {
    pub fn from_config(cfg: ProxyConfig) -> anyhow::Result<Self> {
        let mut blocklist = SuffixMatchTree::new();
        let default_action = cfg.blocklist.action;

        for entry in &cfg.blocklist.domains {
            let name = parse_domain(entry.domain())?;
            blocklist.add(&name, entry.action(default_action));
        }

        for path in &cfg.blocklist.files {
            for domain in read_block_file(path)? {
                let name = parse_domain(&domain)
                    .with_context(|| format!("blocklist file {}", path.display()))?;
                blocklist.add(&name, default_action);
            }
        }

        tracing::debug!(target = "config", blocked = blocklist.len(), "blocklist compiled");

        Ok(Self {
            settings: cfg.settings,
            cache: cfg.cache,
            blocklist,
        })
    }

    #[inline]
    pub fn blocked(&self, qname: &Name) -> Option<BlockAction> {
        self.blocklist.lookup(qname).copied()
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.upstream_timeout_ms)
    }
}

impl BlockAction {
    pub fn rcode(self) -> ResponseCode {
        match self {
            BlockAction::Refused => ResponseCode::Refused,
            BlockAction::Nxdomain => ResponseCode::NXDomain,
        }
    }
}

fn parse_domain(domain: &str) -> anyhow::Result<Name> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Ok(Name::root());
    }
    Name::from_ascii(format!("{trimmed}."))
        .with_context(|| format!("invalid blocklist domain: {domain}"))
}

fn read_block_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read blocklist file: {}", path.display()))?;
    Ok(parse_block_lines(&raw))
}

/// Plain domains and hosts-format lines (`0.0.0.0 ads.example`); `#`/`!` comments.
fn parse_block_lines(content: &str) -> Vec<String> {
    let mut domains = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with('!') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let first = fields.next().unwrap_or("");
        let domain = match fields.next() {
            // hosts format: address first
            Some(second) if first.parse::<std::net::IpAddr>().is_ok() => second,
            Some(_) => continue,
            None => first,
        };
        if matches!(domain, "localhost" | "localhost.localdomain" | "broadcasthost" | "local") {
            continue;
        }
        domains.push(domain.to_ascii_lowercase());
    }
    domains
}
