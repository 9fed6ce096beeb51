use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use rustc_hash::{FxBuildHasher, FxHasher};
use tracing::{debug, trace};

use crate::config::CacheSettings;
use crate::error::CacheError;
use crate::proto_utils::{self, HEADER_LEN, is_part_of, name_to_wire, names_equal};
use crate::suffix_tree::SuffixMatchTree;

const KEY_SEED: u32 = 0x6b69_7864;

/// The query side of a cache lookup.
#[derive(Debug, Clone, Copy)]
pub struct DnsQuestion<'a> {
    /// Question name; its exact bytes in `packet` are spliced into answers.
    pub qname: &'a Name,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    pub tcp: bool,
    /// The raw query, header first.
    pub packet: &'a [u8],
    /// Wire length of the question name following the header.
    pub consumed: usize,
}

#[derive(Debug, Clone)]
pub struct CacheValue {
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    pub tcp: bool,
    pub response: Bytes,
    /// Unix seconds.
    pub added: u64,
    /// Unix seconds after which the entry is expired.
    pub validity: u64,
}

impl CacheValue {
    #[inline]
    fn matches(&self, qname: &Name, qtype: RecordType, qclass: DNSClass, tcp: bool) -> bool {
        self.tcp == tcp && self.qtype == qtype && self.qclass == qclass && names_equal(&self.qname, qname)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHit {
    /// Bytes written into the output buffer.
    pub len: usize,
    /// Served past its validity, within the allowed staleness.
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub insert_collisions: u64,
    pub lookup_collisions: u64,
    pub ttl_too_shorts: u64,
}

/// Fingerprint of a query: header minus ID, lowercased name, everything after
/// the question name (QTYPE, QCLASS, EDNS), and the transport.
pub fn cache_key(qname: &Name, consumed: usize, packet: &[u8], tcp: bool) -> Result<u32, CacheError> {
    if packet.len() < HEADER_LEN {
        return Err(CacheError::PacketTooShort { len: packet.len() });
    }
    let question_end = HEADER_LEN + consumed;
    if packet.len() < question_end {
        return Err(CacheError::QuestionOverrun {
            len: packet.len(),
            consumed,
        });
    }

    let mut h = FxHasher::default();
    h.write_u32(KEY_SEED);
    // skip the query ID
    h.write(&packet[2..HEADER_LEN]);
    h.write(&name_to_wire(qname, true));
    if packet.len() > question_end {
        h.write(&packet[question_end..]);
    }
    h.write_u8(u8::from(tcp));

    let full = h.finish();
    Ok(((full >> 32) as u32) ^ (full as u32))
}

#[inline]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 并发 DNS 应答缓存 / Bounded, concurrent cache of wire-format DNS answers.
///
/// Keyed by the 32-bit fingerprint from [`cache_key`]; each key lives on one
/// `DashMap` shard, so writers to different keys do not contend.
pub struct PacketCache {
    map: DashMap<u32, CacheValue, FxBuildHasher>,
    max_entries: usize,
    max_ttl: u32,
    min_ttl: u32,
    temp_failure_ttl: u32,
    stale_ttl: u32,
    hits: AtomicU64,
    misses: AtomicU64,
    insert_collisions: AtomicU64,
    lookup_collisions: AtomicU64,
    ttl_too_shorts: AtomicU64,
}

impl PacketCache {
    pub fn new(max_entries: usize, max_ttl: u32, min_ttl: u32, temp_failure_ttl: u32, stale_ttl: u32) -> Self {
        Self {
            // one slot of headroom so reaching max_entries does not rehash
            map: DashMap::with_capacity_and_hasher(max_entries.saturating_add(1), FxBuildHasher::default()),
            max_entries,
            max_ttl,
            min_ttl,
            temp_failure_ttl,
            stale_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insert_collisions: AtomicU64::new(0),
            lookup_collisions: AtomicU64::new(0),
            ttl_too_shorts: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(
            settings.max_entries,
            settings.max_ttl,
            settings.min_ttl,
            settings.temp_failure_ttl,
            settings.stale_ttl,
        )
    }

    pub fn key_for(question: &DnsQuestion<'_>) -> Result<u32, CacheError> {
        cache_key(question.qname, question.consumed, question.packet, question.tcp)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        key: u32,
        qname: &Name,
        qtype: RecordType,
        qclass: DNSClass,
        response: &[u8],
        tcp: bool,
        rcode: ResponseCode,
    ) {
        self.insert_at(key, qname, qtype, qclass, response, tcp, rcode, unix_now())
    }

    /// Store `response` under `key`, as of wall-clock second `now`.
    ///
    /// Silently skipped when the answer is uncacheable or the cache is full. An
    /// unexpired entry for a different query is never overwritten, and an entry
    /// for the same query only ever has its validity extended.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_at(
        &self,
        key: u32,
        qname: &Name,
        qtype: RecordType,
        qclass: DNSClass,
        response: &[u8],
        tcp: bool,
        rcode: ResponseCode,
        now: u64,
    ) {
        if response.len() < HEADER_LEN {
            return;
        }

        let ttl = if rcode == ResponseCode::ServFail || rcode == ResponseCode::Refused {
            if self.temp_failure_ttl == 0 {
                return;
            }
            self.temp_failure_ttl
        } else {
            let Some(ttl) = proto_utils::min_ttl(response) else {
                trace!(event = "cache_insert_skip", qname = %qname, reason = "no_ttl");
                return;
            };
            let ttl = ttl.min(self.max_ttl);
            if ttl < self.min_ttl {
                self.ttl_too_shorts.fetch_add(1, Ordering::Relaxed);
                trace!(event = "cache_insert_skip", qname = %qname, ttl, reason = "ttl_too_short");
                return;
            }
            ttl
        };

        if self.map.len() >= self.max_entries {
            trace!(event = "cache_insert_skip", qname = %qname, reason = "full");
            return;
        }

        let validity = now + u64::from(ttl);
        let candidate = CacheValue {
            qname: qname.clone(),
            qtype,
            qclass,
            tcp,
            response: Bytes::copy_from_slice(response),
            added: now,
            validity,
        };

        match self.map.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                let was_expired = existing.validity <= now;
                if !was_expired && !existing.matches(qname, qtype, qclass, tcp) {
                    self.insert_collisions.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        event = "cache_insert_collision",
                        key,
                        qname = %qname,
                        existing = %existing.qname,
                        "cache key collision on insert"
                    );
                    return;
                }
                if validity <= existing.validity {
                    return;
                }
                slot.insert(candidate);
            }
        }
    }

    /// Look up `question` and rebuild the cached answer into `out`.
    pub fn get(
        &self,
        question: &DnsQuestion<'_>,
        query_id: u16,
        out: &mut [u8],
        allow_expired: u32,
        skip_aging: bool,
    ) -> Result<Option<CacheHit>, CacheError> {
        self.get_at(question, query_id, out, allow_expired, skip_aging, unix_now())
    }

    pub fn get_at(
        &self,
        question: &DnsQuestion<'_>,
        query_id: u16,
        out: &mut [u8],
        allow_expired: u32,
        skip_aging: bool,
        now: u64,
    ) -> Result<Option<CacheHit>, CacheError> {
        let key = Self::key_for(question)?;
        Ok(self.get_with_key_at(key, question, query_id, out, allow_expired, skip_aging, now))
    }

    pub fn get_with_key(
        &self,
        key: u32,
        question: &DnsQuestion<'_>,
        query_id: u16,
        out: &mut [u8],
        allow_expired: u32,
        skip_aging: bool,
    ) -> Option<CacheHit> {
        self.get_with_key_at(key, question, query_id, out, allow_expired, skip_aging, unix_now())
    }

    /// The answer carries `query_id` and the caller's own question-name bytes;
    /// everything else is copied from the cached response, then record TTLs are
    /// aged by the time spent in the cache unless `skip_aging` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn get_with_key_at(
        &self,
        key: u32,
        question: &DnsQuestion<'_>,
        query_id: u16,
        out: &mut [u8],
        allow_expired: u32,
        skip_aging: bool,
        now: u64,
    ) -> Option<CacheHit> {
        let (value, stale) = self.live_entry(key, question, allow_expired, now)?;
        let (len, age) = self.copy_answer(&value, stale, question, query_id, out, now)?;
        drop(value);
        Some(self.finish_hit(&mut out[..len], age, stale, skip_aging))
    }

    /// 按缓存条目大小分配输出 / Same as `get_with_key`, into a buffer sized to the cached answer.
    pub fn get_with_key_owned(
        &self,
        key: u32,
        question: &DnsQuestion<'_>,
        query_id: u16,
        allow_expired: u32,
        skip_aging: bool,
    ) -> Option<(Vec<u8>, CacheHit)> {
        self.get_with_key_owned_at(key, question, query_id, allow_expired, skip_aging, unix_now())
    }

    pub fn get_with_key_owned_at(
        &self,
        key: u32,
        question: &DnsQuestion<'_>,
        query_id: u16,
        allow_expired: u32,
        skip_aging: bool,
        now: u64,
    ) -> Option<(Vec<u8>, CacheHit)> {
        let (value, stale) = self.live_entry(key, question, allow_expired, now)?;
        let mut out = vec![0u8; value.response.len()];
        let (len, age) = self.copy_answer(&value, stale, question, query_id, &mut out, now)?;
        drop(value);
        let hit = self.finish_hit(&mut out[..len], age, stale, skip_aging);
        Some((out, hit))
    }

    /// Entry under `key` if it is fresh enough and belongs to `question`.
    fn live_entry(
        &self,
        key: u32,
        question: &DnsQuestion<'_>,
        allow_expired: u32,
        now: u64,
    ) -> Option<(Ref<'_, u32, CacheValue, FxBuildHasher>, bool)> {
        let Some(value) = self.map.get(&key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let mut stale = false;
        if value.validity < now {
            if now - value.validity > u64::from(allow_expired) {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            stale = true;
        }

        if !value.matches(question.qname, question.qtype, question.qclass, question.tcp) {
            self.lookup_collisions.fetch_add(1, Ordering::Relaxed);
            debug!(
                event = "cache_lookup_collision",
                key,
                qname = %question.qname,
                cached = %value.qname,
                "cache key collision on lookup"
            );
            return None;
        }

        Some((value, stale))
    }

    /// Rebuild the answer into `out`; returns its length and the seconds to age it by.
    fn copy_answer(
        &self,
        value: &CacheValue,
        stale: bool,
        question: &DnsQuestion<'_>,
        query_id: u16,
        out: &mut [u8],
        now: u64,
    ) -> Option<(usize, u64)> {
        let len = value.response.len();
        if out.len() < len || len < HEADER_LEN {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let cached = &value.response[..];
        out[..2].copy_from_slice(&query_id.to_be_bytes());
        out[2..HEADER_LEN].copy_from_slice(&cached[2..HEADER_LEN]);

        if len > HEADER_LEN {
            let name_end = HEADER_LEN + question.consumed;
            let Some(qname_bytes) = question.packet.get(HEADER_LEN..name_end).filter(|_| len >= name_end) else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            out[HEADER_LEN..name_end].copy_from_slice(qname_bytes);
            out[name_end..len].copy_from_slice(&cached[name_end..]);
        }

        let age = if stale {
            (value.validity - value.added).saturating_sub(u64::from(self.stale_ttl))
        } else {
            now.saturating_sub(value.added)
        };
        Some((len, age))
    }

    fn finish_hit(&self, answer: &mut [u8], age: u64, stale: bool, skip_aging: bool) -> CacheHit {
        // 头部之后才有记录 / header-only answers carry no TTLs
        if !skip_aging && answer.len() > HEADER_LEN {
            proto_utils::age_packet(answer, u32::try_from(age).unwrap_or(u32::MAX));
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        CacheHit {
            len: answer.len(),
            stale,
        }
    }

    pub fn purge_expired(&self, up_to: usize) -> usize {
        self.purge_expired_at(up_to, unix_now())
    }

    /// Drop expired entries until at most `up_to` remain. Returns the number removed.
    pub fn purge_expired_at(&self, up_to: usize, now: u64) -> usize {
        let size = self.map.len();
        if size <= up_to {
            return 0;
        }
        let mut to_remove = size - up_to;
        let mut removed = 0;
        self.map.retain(|_, value| {
            if to_remove > 0 && value.validity < now {
                to_remove -= 1;
                removed += 1;
                false
            } else {
                true
            }
        });
        debug!(event = "cache_purge_expired", removed, remaining = self.map.len());
        removed
    }

    /// Drop arbitrary entries, expired or not, until `up_to` remain.
    pub fn expunge(&self, up_to: usize) -> usize {
        let size = self.map.len();
        if size <= up_to {
            return 0;
        }
        let mut to_remove = size - up_to;
        let mut removed = 0;
        self.map.retain(|_, _| {
            if to_remove > 0 {
                to_remove -= 1;
                removed += 1;
                false
            } else {
                true
            }
        });
        debug!(event = "cache_expunge", removed, remaining = self.map.len());
        removed
    }

    /// Remove entries for `name` (and, with `suffix_match`, every name below it)
    /// whose type is `qtype`; `RecordType::ANY` matches all types.
    pub fn expunge_by_name(&self, name: &Name, qtype: RecordType, suffix_match: bool) -> usize {
        let mut removed = 0;
        self.map.retain(|_, value| {
            let name_matches = if suffix_match {
                is_part_of(&value.qname, name)
            } else {
                names_equal(&value.qname, name)
            };
            if name_matches && (qtype == RecordType::ANY || qtype == value.qtype) {
                removed += 1;
                false
            } else {
                true
            }
        });
        debug!(event = "cache_expunge_by_name", name = %name, qtype = %qtype, suffix_match, removed);
        removed
    }

    /// 单次遍历移除所有落在 `zones` 下的条目 / Remove entries under any suffix of
    /// `zones` in one pass over the map.
    pub fn expunge_matching<T>(&self, zones: &SuffixMatchTree<T>, qtype: RecordType) -> usize {
        if zones.is_empty() {
            return 0;
        }
        let mut removed = 0;
        self.map.retain(|_, value| {
            let type_matches = qtype == RecordType::ANY || qtype == value.qtype;
            if type_matches && zones.lookup(&value.qname).is_some() {
                removed += 1;
                false
            } else {
                true
            }
        });
        debug!(event = "cache_expunge_matching", zones = zones.len(), qtype = %qtype, removed);
        removed
    }

    pub fn is_full(&self) -> bool {
        self.map.len() >= self.max_entries
    }

    pub fn entries_count(&self) -> usize {
        self.map.len()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn stale_ttl(&self) -> u32 {
        self.stale_ttl
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn insert_collisions(&self) -> u64 {
        self.insert_collisions.load(Ordering::Relaxed)
    }

    pub fn lookup_collisions(&self) -> u64 {
        self.lookup_collisions.load(Ordering::Relaxed)
    }

    pub fn ttl_too_shorts(&self) -> u64 {
        self.ttl_too_shorts.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries_count(),
            max_entries: self.max_entries,
            hits: self.hits(),
            misses: self.misses(),
            insert_collisions: self.insert_collisions(),
            lookup_collisions: self.lookup_collisions(),
            ttl_too_shorts: self.ttl_too_shorts(),
        }
    }

    #[cfg(test)]
    fn entry(&self, key: u32) -> Option<CacheValue> {
        self.map.get(&key).map(|v| v.clone())
    }
}

impl fmt::Display for PacketCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.map.len(), self.max_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use crate::proto_utils::{QuickQuery, parse_question, query_id};
    use crate::test_packets::{answer_ttls, name, query, query_with_edns, response};

    const T0: u64 = 1_700_000_000;

    fn question<'a>(q: &'a QuickQuery, packet: &'a [u8], tcp: bool) -> DnsQuestion<'a> {
        DnsQuestion {
            qname: &q.qname,
            qtype: q.qtype,
            qclass: q.qclass,
            tcp,
            packet,
            consumed: q.consumed,
        }
    }

    fn cache() -> PacketCache {
        PacketCache::new(100, 86400, 0, 60, 60)
    }

    /// Insert an A answer for `qname` with the given TTLs, keyed from a matching query.
    fn seed(cache: &PacketCache, qname: &str, ttls: &[u32], now: u64) -> u32 {
        let packet = query(1, qname, RecordType::A);
        let q = parse_question(&packet).unwrap();
        let key = PacketCache::key_for(&question(&q, &packet, false)).unwrap();
        let resp = response(1, qname, RecordType::A, ResponseCode::NoError, ttls);
        cache.insert_at(key, &q.qname, q.qtype, q.qclass, &resp, false, ResponseCode::NoError, now);
        key
    }

    #[test]
    fn key_ignores_query_id_and_name_case() {
        let a = query(1, "www.example.com.", RecordType::A);
        let b = query(999, "WWW.Example.COM.", RecordType::A);
        let qa = parse_question(&a).unwrap();
        let qb = parse_question(&b).unwrap();
        assert_eq!(
            cache_key(&qa.qname, qa.consumed, &a, false).unwrap(),
            cache_key(&qb.qname, qb.consumed, &b, false).unwrap()
        );
    }

    #[test]
    fn key_separates_transport_type_and_edns() {
        let plain = query(1, "example.com.", RecordType::A);
        let q = parse_question(&plain).unwrap();
        let udp = cache_key(&q.qname, q.consumed, &plain, false).unwrap();
        let tcp = cache_key(&q.qname, q.consumed, &plain, true).unwrap();
        assert_ne!(udp, tcp);

        let aaaa = query(1, "example.com.", RecordType::AAAA);
        let qa = parse_question(&aaaa).unwrap();
        assert_ne!(udp, cache_key(&qa.qname, qa.consumed, &aaaa, false).unwrap());

        let edns = query_with_edns(1, "example.com.", RecordType::A, 1232);
        let qe = parse_question(&edns).unwrap();
        let edns_key = cache_key(&qe.qname, qe.consumed, &edns, false).unwrap();
        assert_ne!(udp, edns_key);
        let edns_big = query_with_edns(1, "example.com.", RecordType::A, 4096);
        assert_ne!(edns_key, cache_key(&qe.qname, qe.consumed, &edns_big, false).unwrap());
    }

    #[test]
    fn key_rejects_short_packets() {
        let qname = name("example.com.");
        assert_eq!(
            cache_key(&qname, 13, &[0u8; 4], false),
            Err(CacheError::PacketTooShort { len: 4 })
        );
        assert_eq!(
            cache_key(&qname, 13, &[0u8; 20], false),
            Err(CacheError::QuestionOverrun { len: 20, consumed: 13 })
        );
    }

    #[test]
    fn round_trip_substitutes_id_and_ages_ttls() {
        let cache = cache();
        let resp = response(1, "a.example.", RecordType::A, ResponseCode::NoError, &[300]);
        let key = seed(&cache, "a.example.", &[300], T0);

        let packet = query(0x4242, "a.example.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let mut out = vec![0u8; 4096];
        let hit = cache
            .get_at(&question(&q, &packet, false), 0x4242, &mut out, 0, false, T0 + 10)
            .unwrap()
            .expect("hit");
        assert!(!hit.stale);
        assert_eq!(hit.len, resp.len());
        assert_eq!(query_id(&out), Some(0x4242));
        assert_eq!(answer_ttls(&out[..hit.len]), vec![290]);
        assert_eq!(&out[2..12], &resp[2..12]);
        assert_eq!(cache.hits(), 1);

        // skip_aging leaves bytes identical apart from the ID
        let hit = cache
            .get_with_key_at(key, &question(&q, &packet, false), 1, &mut out, 0, true, T0 + 10)
            .unwrap();
        assert_eq!(&out[2..hit.len], &resp[2..]);
    }

    #[test]
    fn answer_uses_callers_question_case() {
        let cache = cache();
        seed(&cache, "a.example.", &[300], T0);
        let packet = query(5, "A.ExAmPlE.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let mut out = vec![0u8; 4096];
        let hit = cache
            .get_at(&question(&q, &packet, false), 5, &mut out, 0, true, T0)
            .unwrap()
            .unwrap();
        let echoed = parse_question(&out[..hit.len]).unwrap();
        assert_eq!(echoed.qname.to_string(), "A.ExAmPlE.");
    }

    #[test]
    fn expired_entry_misses_unless_staleness_allowed() {
        let cache = cache();
        seed(&cache, "a.example.", &[300], T0);
        let packet = query(7, "a.example.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let dq = question(&q, &packet, false);
        let mut out = vec![0u8; 4096];

        // validity is T0 + 300; exactly at validity the entry is still fresh
        assert!(cache.get_at(&dq, 7, &mut out, 0, false, T0 + 300).unwrap().is_some());
        assert!(cache.get_at(&dq, 7, &mut out, 0, false, T0 + 301).unwrap().is_none());
        assert_eq!(cache.misses(), 1);

        let hit = cache
            .get_at(&dq, 7, &mut out, 1, false, T0 + 301)
            .unwrap()
            .expect("stale hit");
        assert!(hit.stale);
        // stale age = (300 - 0) - stale_ttl(60)
        assert_eq!(answer_ttls(&out[..hit.len]), vec![60]);
    }

    #[test]
    fn stale_age_clamps_when_stale_ttl_exceeds_lifetime() {
        let cache = PacketCache::new(10, 86400, 0, 60, 3600);
        seed(&cache, "a.example.", &[30], T0);
        let packet = query(7, "a.example.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let mut out = vec![0u8; 4096];
        let hit = cache
            .get_at(&question(&q, &packet, false), 7, &mut out, 100, false, T0 + 40)
            .unwrap()
            .unwrap();
        assert!(hit.stale);
        assert_eq!(answer_ttls(&out[..hit.len]), vec![30]);
    }

    #[test]
    fn validity_is_never_shortened() {
        for order in [[100u32, 500], [500, 100]] {
            let cache = cache();
            let mut key = 0;
            for ttl in order {
                key = seed(&cache, "a.example.", &[ttl], T0);
            }
            assert_eq!(cache.entry(key).unwrap().validity, T0 + 500);
        }
    }

    #[test]
    fn expired_entry_is_replaced_by_any_identity() {
        let cache = cache();
        let key = seed(&cache, "a.example.", &[10], T0);
        let other = name("b.example.");
        let resp = response(1, "b.example.", RecordType::A, ResponseCode::NoError, &[50]);
        cache.insert_at(key, &other, RecordType::A, DNSClass::IN, &resp, false, ResponseCode::NoError, T0 + 20);
        let entry = cache.entry(key).unwrap();
        assert!(names_equal(&entry.qname, &other));
        assert_eq!(cache.insert_collisions(), 0);
    }

    #[test]
    fn collisions_leave_existing_entry_untouched() {
        let cache = cache();
        let key = seed(&cache, "a.example.", &[300], T0);

        // force a different identity onto the same key
        let other = query(1, "b.example.", RecordType::A);
        let qb = parse_question(&other).unwrap();
        let resp_b = response(1, "b.example.", RecordType::A, ResponseCode::NoError, &[900]);
        cache.insert_at(key, &qb.qname, qb.qtype, qb.qclass, &resp_b, false, ResponseCode::NoError, T0 + 1);
        assert_eq!(cache.insert_collisions(), 1);
        let entry = cache.entry(key).unwrap();
        assert!(names_equal(&entry.qname, &name("a.example.")));
        assert_eq!(entry.validity, T0 + 300);

        let mut out = vec![0u8; 4096];
        let dq = question(&qb, &other, false);
        assert!(cache.get_with_key_at(key, &dq, 1, &mut out, 0, false, T0 + 2).is_none());
        assert_eq!(cache.lookup_collisions(), 1);

        // transport is part of the identity too
        let packet = query(1, "a.example.", RecordType::A);
        let qa = parse_question(&packet).unwrap();
        assert!(cache
            .get_with_key_at(key, &question(&qa, &packet, true), 1, &mut out, 0, false, T0 + 2)
            .is_none());
        assert_eq!(cache.lookup_collisions(), 2);
    }

    #[test]
    fn ttl_policy_clamps_and_rejects() {
        let cache = PacketCache::new(10, 100, 30, 0, 0);
        let key = seed(&cache, "long.example.", &[5000], T0);
        assert_eq!(cache.entry(key).unwrap().validity, T0 + 100);

        let short = seed(&cache, "short.example.", &[10], T0);
        assert!(cache.entry(short).is_none());
        assert_eq!(cache.ttl_too_shorts(), 1);

        let empty = seed(&cache, "empty.example.", &[], T0);
        assert!(cache.entry(empty).is_none());
        assert_eq!(cache.entries_count(), 1);
    }

    #[test]
    fn temp_failures_use_their_own_ttl() {
        let packet = query(1, "fail.example.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let key = PacketCache::key_for(&question(&q, &packet, false)).unwrap();
        let servfail = response(1, "fail.example.", RecordType::A, ResponseCode::ServFail, &[]);

        let disabled = PacketCache::new(10, 86400, 0, 0, 0);
        disabled.insert_at(key, &q.qname, q.qtype, q.qclass, &servfail, false, ResponseCode::ServFail, T0);
        assert_eq!(disabled.entries_count(), 0);

        let enabled = PacketCache::new(10, 86400, 0, 15, 0);
        enabled.insert_at(key, &q.qname, q.qtype, q.qclass, &servfail, false, ResponseCode::Refused, T0);
        assert_eq!(enabled.entry(key).unwrap().validity, T0 + 15);

        enabled.insert_at(key, &q.qname, q.qtype, q.qclass, &servfail[..8], false, ResponseCode::ServFail, T0 + 1);
        assert_eq!(enabled.entry(key).unwrap().validity, T0 + 15);
    }

    #[test]
    fn header_only_answer_is_served_verbatim() {
        let cache = PacketCache::new(10, 86400, 0, 60, 0);
        let packet = query(1, "h.example.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let key = PacketCache::key_for(&question(&q, &packet, false)).unwrap();
        let mut header = packet[..HEADER_LEN].to_vec();
        header[2] |= 0x80;
        header[3] = 0x02;
        cache.insert_at(key, &q.qname, q.qtype, q.qclass, &header, false, ResponseCode::ServFail, T0);

        let mut out = vec![0u8; 512];
        let hit = cache
            .get_with_key_at(key, &question(&q, &packet, false), 0xAAAA, &mut out, 0, false, T0 + 1)
            .unwrap();
        assert_eq!(hit.len, HEADER_LEN);
        assert_eq!(query_id(&out), Some(0xAAAA));
        assert_eq!(&out[2..HEADER_LEN], &header[2..]);
    }

    #[test]
    fn small_output_buffer_is_a_miss() {
        let cache = cache();
        seed(&cache, "a.example.", &[300], T0);
        let packet = query(1, "a.example.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let mut out = vec![0u8; 16];
        assert!(cache.get_at(&question(&q, &packet, false), 1, &mut out, 0, false, T0).unwrap().is_none());
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn capacity_is_an_admission_gate() {
        let cache = PacketCache::new(2, 86400, 0, 60, 0);
        seed(&cache, "a.example.", &[10], T0);
        seed(&cache, "b.example.", &[300], T0);
        assert!(cache.is_full());
        let c = seed(&cache, "c.example.", &[300], T0);
        assert!(cache.entry(c).is_none());
        assert_eq!(cache.to_string(), "2/2");

        assert_eq!(cache.purge_expired_at(1, T0 + 100), 1);
        assert!(!cache.is_full());
        let c = seed(&cache, "c.example.", &[300], T0 + 100);
        assert!(cache.entry(c).is_some());

        assert_eq!(cache.expunge(0), 2);
        assert_eq!(cache.entries_count(), 0);
        assert_eq!(cache.expunge(0), 0);
    }

    #[test]
    fn expunge_to_target_reopens_admission() {
        let cache = PacketCache::new(3, 86400, 0, 60, 0);
        for qname in ["a.example.", "b.example.", "c.example."] {
            seed(&cache, qname, &[300], T0);
        }
        assert!(cache.is_full());
        let refused = seed(&cache, "d.example.", &[300], T0);
        assert!(cache.entry(refused).is_none());

        assert_eq!(cache.expunge(1), 2);
        assert_eq!(cache.entries_count(), 1);
        assert!(!cache.is_full());
        assert_eq!(cache.to_string(), "1/3");

        let admitted = seed(&cache, "d.example.", &[300], T0);
        assert!(cache.entry(admitted).is_some());
        assert_eq!(cache.entries_count(), 2);
        assert_eq!(cache.expunge(5), 0);
    }

    #[test]
    fn expunge_matching_drops_all_zones_at_once() {
        let cache = cache();
        let ads = seed(&cache, "x.ads.example.", &[300], T0);
        let apex = seed(&cache, "Tracker.example.", &[300], T0);
        let kept = seed(&cache, "ok.example.", &[300], T0);
        let sibling = seed(&cache, "notads.example.", &[300], T0);

        let mut zones = SuffixMatchTree::new();
        zones.add(&name("ads.example."), ());
        zones.add(&name("tracker.example."), ());

        assert_eq!(cache.expunge_matching(&zones, RecordType::AAAA), 0);
        assert_eq!(cache.expunge_matching(&zones, RecordType::ANY), 2);
        assert!(cache.entry(ads).is_none());
        assert!(cache.entry(apex).is_none());
        assert!(cache.entry(kept).is_some());
        assert!(cache.entry(sibling).is_some());
        assert_eq!(cache.expunge_matching(&SuffixMatchTree::<()>::new(), RecordType::ANY), 0);
    }

    #[test]
    fn owned_lookup_allocates_exactly_the_answer() {
        let cache = cache();
        let key = seed(&cache, "o.example.", &[300, 60], T0);
        let packet = query(0x0a0b, "O.example.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let question = question(&q, &packet, false);

        let (answer, hit) = cache
            .get_with_key_owned_at(key, &question, 0x0a0b, 0, false, T0 + 10)
            .expect("hit");
        assert_eq!(answer.len(), hit.len);
        assert_eq!(answer.len(), cache.entry(key).unwrap().response.len());
        assert_eq!(query_id(&answer), Some(0x0a0b));
        assert_eq!(answer_ttls(&answer), vec![290, 50]);

        let fresh = cache.get_with_key_owned_at(key, &question, 1, 0, false, T0 + 59);
        assert_eq!(fresh.map(|(_, hit)| hit.stale), Some(false));
        // lowest TTL was 60
        assert!(cache.get_with_key_owned_at(key, &question, 1, 0, false, T0 + 61).is_none());
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn purge_expired_stops_at_target_size() {
        let cache = cache();
        for i in 0..10 {
            seed(&cache, &format!("n{i}.example."), &[10], T0);
        }
        seed(&cache, "live.example.", &[1000], T0);
        assert_eq!(cache.purge_expired_at(20, T0 + 50), 0);
        assert_eq!(cache.purge_expired_at(6, T0 + 50), 5);
        assert_eq!(cache.entries_count(), 6);
        assert_eq!(cache.purge_expired_at(0, T0 + 50), 5);
        assert_eq!(cache.entries_count(), 1);
    }

    #[test]
    fn expunge_by_name_exact_suffix_and_type() {
        let cache = cache();
        let apex = seed(&cache, "example.", &[300], T0);
        let www = seed(&cache, "www.example.", &[300], T0);
        let other = seed(&cache, "example.org.", &[300], T0);

        assert_eq!(cache.expunge_by_name(&name("example."), RecordType::AAAA, true), 0);
        assert_eq!(cache.expunge_by_name(&name("EXAMPLE."), RecordType::A, false), 1);
        assert!(cache.entry(apex).is_none());
        assert!(cache.entry(www).is_some());

        assert_eq!(cache.expunge_by_name(&name("example."), RecordType::ANY, true), 1);
        assert!(cache.entry(www).is_none());
        assert!(cache.entry(other).is_some());
    }

    #[test]
    fn end_to_end_lifecycle() {
        let cache = cache();
        let key = seed(&cache, "a.example.", &[300], T0);
        let packet = query(0x0102, "a.example.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let dq = question(&q, &packet, false);
        let mut out = vec![0u8; 4096];

        let hit = cache.get_with_key_at(key, &dq, 0x0102, &mut out, 0, false, T0 + 10).unwrap();
        assert_eq!(query_id(&out), Some(0x0102));
        assert_eq!(answer_ttls(&out[..hit.len]), vec![290]);

        assert!(cache.get_with_key_at(key, &dq, 0x0102, &mut out, 0, false, T0 + 301).is_none());

        assert_eq!(cache.expunge_by_name(&name("example."), RecordType::ANY, true), 1);
        assert!(cache.get_with_key_at(key, &dq, 0x0102, &mut out, 0, false, T0 + 10).is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 0,
                max_entries: 100,
                hits: 1,
                misses: 2,
                insert_collisions: 0,
                lookup_collisions: 0,
                ttl_too_shorts: 0,
            }
        );
    }

    #[test]
    fn concurrent_inserts_keep_longest_validity() {
        let cache = Arc::new(cache());
        let packet = query(1, "race.example.", RecordType::A);
        let q = parse_question(&packet).unwrap();
        let key = PacketCache::key_for(&question(&q, &packet, false)).unwrap();

        let handles: Vec<_> = (1..=8u32)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let qname = q.qname.clone();
                thread::spawn(move || {
                    let resp = response(1, "race.example.", RecordType::A, ResponseCode::NoError, &[i * 100]);
                    for _ in 0..50 {
                        cache.insert_at(key, &qname, RecordType::A, DNSClass::IN, &resp, false, ResponseCode::NoError, T0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.entry(key).unwrap().validity, T0 + 800);
        assert_eq!(cache.insert_collisions(), 0);
    }

    #[test]
    fn concurrent_readers_and_writers_on_distinct_keys() {
        let cache = Arc::new(PacketCache::new(10_000, 86400, 0, 60, 0));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let mut out = vec![0u8; 4096];
                    for i in 0..100 {
                        let qname = format!("h{t}-{i}.example.");
                        seed(&cache, &qname, &[300], T0);
                        let packet = query(9, &qname, RecordType::A);
                        let q = parse_question(&packet).unwrap();
                        let hit = cache
                            .get_at(&question(&q, &packet, false), 9, &mut out, 0, true, T0)
                            .unwrap();
                        assert!(hit.is_some());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.entries_count(), 400);
        assert_eq!(cache.hits(), 400);
    }
}
