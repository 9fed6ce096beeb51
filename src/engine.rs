use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{DnsQuestion, PacketCache};
use crate::config::BlockAction;
use crate::matcher::RuntimeConfig;
use crate::proto_utils::{
    QuickQuery, build_local_response, is_truncated, names_equal, parse_question, response_code,
};
use crate::suffix_tree::SuffixMatchTree;

// 上游 UDP 应答可达 EDNS 上限，按最大报文接收 / large enough for any UDP datagram
const UPSTREAM_UDP_BUFFER_LEN: usize = 65535;

#[inline]
fn question_of<'a>(q: &'a QuickQuery, packet: &'a [u8], tcp: bool) -> DnsQuestion<'a> {
    DnsQuestion {
        qname: &q.qname,
        qtype: q.qtype,
        qclass: q.qclass,
        tcp,
        packet,
        consumed: q.consumed,
    }
}

/// 快速路径未命中，待转发上游的查询 / A query the fast path could not answer.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    query: QuickQuery,
    tcp: bool,
    /// `None` when the packet cannot be keyed; such queries bypass the cache.
    key: Option<u32>,
}

impl PendingQuery {
    pub fn key(&self) -> Option<u32> {
        self.key
    }
}

pub enum FastPath {
    Answered(Bytes),
    Forward(PendingQuery),
}

impl FastPath {
    pub fn answer(self) -> Option<Bytes> {
        match self {
            FastPath::Answered(resp) => Some(resp),
            FastPath::Forward(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    runtime: Arc<ArcSwap<RuntimeConfig>>,
    cache: Option<Arc<PacketCache>>,
    // 运行时指标 / Runtime metrics
    pub metrics_total_requests: Arc<AtomicU64>,
    pub metrics_blocked: Arc<AtomicU64>,
    pub metrics_upstream_calls: Arc<AtomicU64>,
    pub metrics_upstream_failures: Arc<AtomicU64>,
    pub metrics_stale_served: Arc<AtomicU64>,
}

impl Engine {
    /// The cache is sized from `runtime.cache` once; later reloads keep it.
    pub fn new(runtime: RuntimeConfig) -> Self {
        let cache = runtime
            .cache
            .enabled
            .then(|| Arc::new(PacketCache::from_settings(&runtime.cache)));
        Self {
            runtime: Arc::new(ArcSwap::from_pointee(runtime)),
            cache,
            metrics_total_requests: Arc::new(AtomicU64::new(0)),
            metrics_blocked: Arc::new(AtomicU64::new(0)),
            metrics_upstream_calls: Arc::new(AtomicU64::new(0)),
            metrics_upstream_failures: Arc::new(AtomicU64::new(0)),
            metrics_stale_served: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cache(&self) -> Option<&Arc<PacketCache>> {
        self.cache.as_ref()
    }

    pub fn runtime(&self) -> Arc<RuntimeConfig> {
        self.runtime.load_full()
    }

    pub fn metrics_snapshot(&self) -> String {
        let total = self.metrics_total_requests.load(Ordering::Relaxed);
        let blocked = self.metrics_blocked.load(Ordering::Relaxed);
        let upstream = self.metrics_upstream_calls.load(Ordering::Relaxed);
        let failures = self.metrics_upstream_failures.load(Ordering::Relaxed);
        let stale = self.metrics_stale_served.load(Ordering::Relaxed);
        format!(
            "total={} blocked={} upstream_calls={} upstream_failures={} stale_served={}",
            total, blocked, upstream, failures, stale
        )
    }

    /// 快速路径：同步处理拦截与缓存命中 / Fast path: block-list and cache hits, no I/O.
    ///
    /// A miss yields the parsed query and its cache key for [`Engine::resolve`]; `Err`
    /// means the packet is not a usable query and should be dropped.
    pub fn handle_packet_fast(&self, packet: &[u8], tcp: bool) -> anyhow::Result<FastPath> {
        let q = parse_question(packet).context("unparseable query")?;
        self.metrics_total_requests.fetch_add(1, Ordering::Relaxed);

        let runtime = self.runtime.load();
        if let Some(action) = runtime.blocked(&q.qname) {
            self.metrics_blocked.fetch_add(1, Ordering::Relaxed);
            debug!(event = "blocked", qname = %q.qname, action = ?action);
            let resp = build_local_response(packet, q.consumed, action.rcode())
                .context("build blocked response")?;
            return Ok(FastPath::Answered(Bytes::from(resp)));
        }

        let key = self.cache.as_ref().and_then(|_| {
            PacketCache::key_for(&question_of(&q, packet, tcp))
                .map_err(|err| debug!(event = "cache_key_error", qname = %q.qname, error = %err))
                .ok()
        });
        let pending = PendingQuery { query: q, tcp, key };
        if let Some(resp) = self.lookup_cache(packet, &pending, 0) {
            return Ok(FastPath::Answered(resp));
        }
        Ok(FastPath::Forward(pending))
    }

    /// Forward to the upstream and cache the answer; serve stale or SERVFAIL on failure.
    pub async fn resolve(&self, packet: &[u8], pending: PendingQuery) -> anyhow::Result<Bytes> {
        let q = &pending.query;
        let runtime = self.runtime.load_full();
        let upstream: SocketAddr = runtime
            .settings
            .upstream
            .parse()
            .context("parse upstream addr")?;

        self.metrics_upstream_calls.fetch_add(1, Ordering::Relaxed);
        let start = std::time::Instant::now();
        let res = if pending.tcp {
            timeout(runtime.upstream_timeout(), exchange_tcp(packet, q, upstream))
                .await
                .context("upstream tcp timeout")
                .and_then(|r| r)
        } else {
            timeout(runtime.upstream_timeout(), exchange_udp(packet, q, upstream))
                .await
                .context("upstream udp timeout")
                .and_then(|r| r)
        };

        match res {
            Ok(resp) => {
                debug!(upstream = %upstream, upstream_ns = start.elapsed().as_nanos() as u64, "upstream call latency");
                if is_truncated(&resp) {
                    debug!(event = "upstream_truncated", qname = %q.qname, "relaying truncated answer");
                }
                self.store(&pending, &resp);
                Ok(resp)
            }
            Err(err) => {
                self.metrics_upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!(upstream = %upstream, qname = %q.qname, error = %err, "upstream call failed");
                if let Some(stale) = self.serve_stale(packet, &pending) {
                    self.metrics_stale_served.fetch_add(1, Ordering::Relaxed);
                    return Ok(stale);
                }
                let resp = build_local_response(packet, q.consumed, ResponseCode::ServFail)
                    .context("build servfail response")?;
                Ok(Bytes::from(resp))
            }
        }
    }

    pub async fn handle_packet(&self, packet: &[u8], tcp: bool) -> anyhow::Result<Bytes> {
        match self.handle_packet_fast(packet, tcp)? {
            FastPath::Answered(resp) => Ok(resp),
            FastPath::Forward(pending) => self.resolve(packet, pending).await,
        }
    }

    fn lookup_cache(&self, packet: &[u8], pending: &PendingQuery, allow_expired: u32) -> Option<Bytes> {
        let cache = self.cache.as_ref()?;
        let key = pending.key?;
        let q = &pending.query;
        let question = question_of(q, packet, pending.tcp);
        let (answer, _) = cache.get_with_key_owned(key, &question, q.tx_id, allow_expired, false)?;
        Some(Bytes::from(answer))
    }

    fn serve_stale(&self, packet: &[u8], pending: &PendingQuery) -> Option<Bytes> {
        let allow = self.cache.as_ref()?.stale_ttl();
        if allow == 0 {
            return None;
        }
        let resp = self.lookup_cache(packet, pending, allow)?;
        info!(event = "stale_served", qname = %pending.query.qname, "serving stale answer");
        Some(resp)
    }

    fn store(&self, pending: &PendingQuery, resp: &[u8]) {
        let (Some(cache), Some(key)) = (self.cache.as_ref(), pending.key) else {
            return;
        };
        let q = &pending.query;
        let rcode = response_code(resp).unwrap_or(ResponseCode::ServFail);
        cache.insert(key, &q.qname, q.qtype, q.qclass, resp, pending.tcp, rcode);
    }

    /// Swap in a reloaded configuration and drop cached answers under newly blocked zones.
    pub fn reload(&self, next: RuntimeConfig) -> usize {
        let previous = self.runtime.load_full();
        if previous.cache != next.cache {
            warn!(target = "config", "cache settings changed; they take effect after restart");
        }
        let removed = self.invalidate_new_blocks(&previous.blocklist, &next.blocklist);
        self.runtime.store(Arc::new(next));
        removed
    }

    fn invalidate_new_blocks(
        &self,
        previous: &SuffixMatchTree<BlockAction>,
        next: &SuffixMatchTree<BlockAction>,
    ) -> usize {
        let Some(cache) = self.cache.as_ref() else {
            return 0;
        };
        // 先汇总新增拦截域，再对缓存做一次遍历 / one cache sweep for all new zones
        let mut fresh = SuffixMatchTree::new();
        next.visit(|labels, _| {
            if previous.lookup_labels(labels).is_none() {
                fresh.add_labels(labels, ());
            }
        });
        let removed = cache.expunge_matching(&fresh, RecordType::ANY);
        if removed > 0 {
            info!(event = "cache_invalidated", zones = fresh.len(), removed, "dropped cached answers for newly blocked zones");
        }
        removed
    }

    /// Periodic expired-entry sweep and statistics logging.
    pub fn spawn_maintenance(&self) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let settings = self.runtime.load().settings.clone();

        if settings.purge_interval_secs > 0 {
            let cache = Arc::clone(&cache);
            let every = Duration::from_secs(settings.purge_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    cache.purge_expired(0);
                }
            });
        }

        if settings.stats_interval_secs > 0 {
            let engine = self.clone();
            let every = Duration::from_secs(settings.stats_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let stats = cache.stats();
                    info!(
                        event = "cache_stats",
                        cache = %cache,
                        hits = stats.hits,
                        misses = stats.misses,
                        insert_collisions = stats.insert_collisions,
                        lookup_collisions = stats.lookup_collisions,
                        ttl_too_shorts = stats.ttl_too_shorts,
                        engine = %engine.metrics_snapshot(),
                        "cache statistics"
                    );
                }
            });
        }
    }
}

/// An upstream answer must echo our ID and question.
fn response_matches(resp: &[u8], q: &QuickQuery) -> bool {
    if resp.get(2).is_none_or(|flags| flags & 0x80 == 0) {
        return false;
    }
    match parse_question(resp) {
        Some(r) => r.tx_id == q.tx_id && r.qtype == q.qtype && r.qclass == q.qclass && names_equal(&r.qname, &q.qname),
        None => false,
    }
}

async fn exchange_udp(packet: &[u8], q: &QuickQuery, upstream: SocketAddr) -> anyhow::Result<Bytes> {
    let bind: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await.context("bind upstream socket")?;
    socket.connect(upstream).await.context("connect upstream")?;
    socket.send(packet).await.context("send upstream")?;

    let mut buf = vec![0u8; UPSTREAM_UDP_BUFFER_LEN];
    loop {
        let len = socket.recv(&mut buf).await.context("recv upstream")?;
        let resp = &buf[..len];
        if response_matches(resp, q) {
            return Ok(Bytes::copy_from_slice(resp));
        }
        debug!(event = "upstream_mismatch", upstream = %upstream, "ignoring unrelated upstream datagram");
    }
}

async fn exchange_tcp(packet: &[u8], q: &QuickQuery, upstream: SocketAddr) -> anyhow::Result<Bytes> {
    let mut stream = TcpStream::connect(upstream)
        .await
        .context("connect upstream")?;
    let len = u16::try_from(packet.len()).context("query too large for tcp")?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(packet).await?;

    loop {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;
        if response_matches(&buf, q) {
            return Ok(Bytes::from(buf));
        }
    }
}
