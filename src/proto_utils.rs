use std::cmp::Ordering;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{DNSClass, Name, RecordType};

/// DNS 头部固定长度 / Fixed DNS header length
pub const HEADER_LEN: usize = 12;

const OPT_TYPE: u16 = 41;
const FLAG_QR: u8 = 0x80;
const FLAG_AA: u8 = 0x04;
const FLAG_TC: u8 = 0x02;
const FLAG_RA: u8 = 0x80;

#[inline]
pub fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> Option<()> {
    buf.get_mut(offset..offset.checked_add(2)?)?
        .copy_from_slice(&value.to_be_bytes());
    Some(())
}

#[inline]
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Option<()> {
    buf.get_mut(offset..offset.checked_add(4)?)?
        .copy_from_slice(&value.to_be_bytes());
    Some(())
}

#[inline]
pub fn query_id(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 0)
}

#[inline]
pub fn set_query_id(packet: &mut [u8], id: u16) -> Option<()> {
    write_u16(packet, 0, id)
}

/// RCODE from the low 4 bits of the second flags byte.
#[inline]
pub fn response_code(packet: &[u8]) -> Option<ResponseCode> {
    let flags = *packet.get(3)?;
    Some(ResponseCode::from(0, flags & 0x0F))
}

#[inline]
pub fn is_truncated(packet: &[u8]) -> bool {
    packet.get(2).is_some_and(|flags| flags & FLAG_TC != 0)
}

#[inline]
pub fn question_count(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 4)
}

#[inline]
pub fn answer_count(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 6)
}

#[inline]
pub fn authority_count(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 8)
}

#[inline]
pub fn additional_count(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 10)
}

/// 快速解析结果 / Result of the quick question parse
#[derive(Debug, Clone)]
pub struct QuickQuery {
    pub tx_id: u16,
    /// Question name with its original case.
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    /// Wire length of the question name, starting right after the header.
    pub consumed: usize,
}

/// 仅解析 DNS 头部和第一个 Query，避免全量解析 / Parse only the header and the first
/// question, skipping a full `Message` decode.
///
/// Compression pointers are not valid in a question name here and reject the packet.
pub fn parse_question(packet: &[u8]) -> Option<QuickQuery> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let tx_id = query_id(packet)?;
    if question_count(packet)? == 0 {
        return None;
    }

    let mut pos = HEADER_LEN;
    let mut labels: Vec<&[u8]> = Vec::with_capacity(4);
    loop {
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        labels.push(packet.get(pos + 1..pos + 1 + len)?);
        pos += 1 + len;
        if pos - HEADER_LEN > 255 {
            return None;
        }
    }

    let consumed = pos - HEADER_LEN;
    let qtype = read_u16(packet, pos)?;
    let qclass = read_u16(packet, pos + 2)?;
    let qname = Name::from_labels(labels).ok()?;

    Some(QuickQuery {
        tx_id,
        qname,
        qtype: RecordType::from(qtype),
        qclass: DNSClass::from(qclass),
        consumed,
    })
}

/// Uncompressed wire form of `name`, optionally ASCII-lowercased.
pub fn name_to_wire(name: &Name, lowercase: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    for label in name.iter() {
        out.push(label.len() as u8);
        if lowercase {
            out.extend(label.iter().map(u8::to_ascii_lowercase));
        } else {
            out.extend_from_slice(label);
        }
    }
    out.push(0);
    out
}

#[inline]
pub fn labels_equal(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Case-insensitive label ordering, strcasecmp style.
#[inline]
pub fn cmp_labels(a: &[u8], b: &[u8]) -> Ordering {
    a.iter()
        .map(u8::to_ascii_lowercase)
        .cmp(b.iter().map(u8::to_ascii_lowercase))
}

pub fn names_equal(a: &Name, b: &Name) -> bool {
    let mut left = a.iter();
    let mut right = b.iter();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return true,
            (Some(l), Some(r)) if labels_equal(l, r) => continue,
            _ => return false,
        }
    }
}

/// True when `name` equals `zone` or sits anywhere below it.
pub fn is_part_of(name: &Name, zone: &Name) -> bool {
    let name_len = name.iter().count();
    let zone_len = zone.iter().count();
    if zone_len > name_len {
        return false;
    }
    name.iter()
        .skip(name_len - zone_len)
        .zip(zone.iter())
        .all(|(n, z)| labels_equal(n, z))
}

/// Offset just past the (possibly compressed) name starting at `pos`.
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        match len & 0xC0 {
            0xC0 => {
                packet.get(pos + 1)?;
                return Some(pos + 2);
            }
            0x00 => pos += 1 + len as usize,
            _ => return None,
        }
    }
}

struct RecordScan {
    ttl_offsets: Vec<usize>,
    complete: bool,
}

/// Locate the TTL field of every resource record, OPT pseudo-records excluded.
fn scan_records(packet: &[u8]) -> RecordScan {
    let mut scan = RecordScan {
        ttl_offsets: Vec::new(),
        complete: false,
    };
    let (Some(qd), Some(an), Some(ns), Some(ar)) = (
        question_count(packet),
        answer_count(packet),
        authority_count(packet),
        additional_count(packet),
    ) else {
        return scan;
    };

    let mut pos = HEADER_LEN;
    for _ in 0..qd {
        let Some(end) = skip_name(packet, pos) else {
            return scan;
        };
        // Type(2) + Class(2)
        pos = end + 4;
    }
    if pos > packet.len() {
        return scan;
    }

    let records = an as usize + ns as usize + ar as usize;
    for _ in 0..records {
        let Some(end) = skip_name(packet, pos) else {
            return scan;
        };
        // Type(2) Class(2) TTL(4) RDLen(2)
        let (Some(rtype), Some(rdlen)) = (read_u16(packet, end), read_u16(packet, end + 8)) else {
            return scan;
        };
        let next = end + 10 + rdlen as usize;
        if next > packet.len() {
            return scan;
        }
        if rtype != OPT_TYPE {
            scan.ttl_offsets.push(end + 4);
        }
        pos = next;
    }

    scan.complete = true;
    scan
}

/// Smallest TTL over all resource records of the packet.
///
/// `None` when the packet carries no records or cannot be walked to the end.
pub fn min_ttl(packet: &[u8]) -> Option<u32> {
    let scan = scan_records(packet);
    if !scan.complete {
        return None;
    }
    scan.ttl_offsets
        .iter()
        .filter_map(|&offset| read_u32(packet, offset))
        .min()
}

/// Decrement every record TTL by `seconds`, floored at zero.
///
/// Records after a malformed point are left untouched.
pub fn age_packet(packet: &mut [u8], seconds: u32) {
    if seconds == 0 {
        return;
    }
    let scan = scan_records(packet);
    for offset in scan.ttl_offsets {
        if let Some(ttl) = read_u32(packet, offset) {
            let _ = write_u32(packet, offset, ttl.saturating_sub(seconds));
        }
    }
}

/// 根据查询构造本地响应（只回显问题部分） / Build a local answer that echoes the
/// question and carries no records.
pub fn build_local_response(query: &[u8], consumed: usize, rcode: ResponseCode) -> Option<Vec<u8>> {
    let end = HEADER_LEN + consumed + 4;
    let mut out = query.get(..end)?.to_vec();
    out[2] = (out[2] | FLAG_QR) & !(FLAG_AA | FLAG_TC);
    out[3] = FLAG_RA | (u16::from(rcode) & 0x000F) as u8;
    write_u16(&mut out, 4, 1)?;
    write_u16(&mut out, 6, 0)?;
    write_u16(&mut out, 8, 0)?;
    write_u16(&mut out, 10, 0)?;
    Some(out)
}
